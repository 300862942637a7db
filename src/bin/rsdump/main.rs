use prettytable::{cell, row};
use structopt::StructOpt;

use std::{ffi, path};

use rangesrv::{
    commit_log::{inflate_block, BlockInfo, BlockStream},
    key::Mutations,
    update::decode_commit_payload,
    util::files,
    Error, Result,
};

/// Dump blocks of a commit log directory.
#[derive(Clone, StructOpt)]
pub struct Opt {
    /// Only dump this fragment.
    #[structopt(long = "fragment")]
    fragment: Option<u32>,

    /// Decode and print cells held by data blocks.
    #[structopt(long = "cells")]
    cells: bool,

    /// Commit log directory.
    log_dir: ffi::OsString,
}

fn main() {
    let opts = Opt::from_iter(std::env::args_os());
    dump(opts).map_err(|e| println!("Error: {}", e)).ok();
}

fn dump(opts: Opt) -> Result<()> {
    let log_dir = path::PathBuf::from(&opts.log_dir);
    let fragments: Vec<(u32, path::PathBuf)> = files::numbered_files(&log_dir)?
        .into_iter()
        .filter(|(num, _)| opts.fragment.map(|f| f == *num).unwrap_or(true))
        .collect();

    let mut table = prettytable::Table::new();
    table.set_format(*prettytable::format::consts::FORMAT_CLEAN);
    table.set_titles(row![
        Fy => "Fragment", "Offset", "Magic", "Revision", "ClusterId", "Compression", "Length", "ZLength"
    ]);

    let (mut n_blocks, mut n_cells) = (0, 0);
    let mut cells = vec![];
    for (num, loc) in fragments.into_iter() {
        let mut stream = BlockStream::open(&loc)?;
        loop {
            let info = match stream.next_block() {
                Ok(Some(info)) => info,
                Ok(None) => break,
                Err(Error::TruncatedCommitLog(_, msg)) => {
                    println!("fragment {} truncated tail, {}", num, msg);
                    break;
                }
                Err(err) => return Err(err),
            };
            n_blocks += 1;
            table.add_row(to_row(num, &info));
            if opts.cells && info.header.is_data() {
                n_cells += dump_cells(num, &info, &mut cells)?;
            } else if info.header.is_link() {
                let payload = inflate_block(&info.header, &info.zblock)?;
                cells.push(format!(
                    "{}@{} link {}",
                    num,
                    info.start_offset,
                    String::from_utf8_lossy(&payload)
                ));
            }
        }
    }

    table.printstd();
    println!("{} blocks", n_blocks);
    if opts.cells {
        println!("{} cells", n_cells);
    }
    cells.iter().for_each(|line| println!("{}", line));
    Ok(())
}

fn to_row(num: u32, info: &BlockInfo) -> prettytable::Row {
    let header = &info.header;
    row![
        num,
        info.start_offset,
        String::from_utf8_lossy(&header.magic),
        header.revision,
        header.cluster_id,
        header.compression,
        header.data_length,
        header.data_zlength,
    ]
}

fn dump_cells(num: u32, info: &BlockInfo, lines: &mut Vec<String>) -> Result<usize> {
    let payload = inflate_block(&info.header, &info.zblock)?;
    let (table, buf) = decode_commit_payload(&payload)?;

    let mut n = 0;
    for item in Mutations::new(buf) {
        let m = item?;
        lines.push(format!(
            "{}@{} {} {:?} {:?}",
            num,
            info.start_offset,
            table,
            m.key,
            String::from_utf8_lossy(m.value)
        ));
        n += 1;
    }
    Ok(n)
}
