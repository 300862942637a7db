use std::{fs, io::SeekFrom, path};

use crate::{commit_log::BlockHeader, read_file, util, Result};

/// Every fragment file starts with this header.
pub const FRAGMENT_HEADER: &[u8; 8] = b"CL0001\x0c\n";

const PEEK_LENGTH: u64 = 14;

/// Block read from a fragment, payload is still compressed.
#[derive(Clone, Debug)]
pub struct BlockInfo {
    pub start_offset: u64,
    pub end_offset: u64,
    pub header: BlockHeader,
    pub zblock: Vec<u8>,
}

/// Sequential reader for blocks in a single fragment file.
pub struct BlockStream {
    loc: path::PathBuf,
    file: fs::File,
    size: u64,
    offset: u64,
}

impl BlockStream {
    /// Open fragment file at `loc`. Fragments written without a file
    /// header are read from offset zero.
    pub fn open(loc: &path::Path) -> Result<BlockStream> {
        let mut file = util::files::open_file_r(loc.as_os_str())?;
        let size = err_at!(IOError, file.metadata())?.len();

        let n = FRAGMENT_HEADER.len() as u64;
        let offset = if size >= n {
            let hdr = read_file!(file, SeekFrom::Start(0), n, "fragment header")?;
            if hdr.as_slice() == FRAGMENT_HEADER {
                n
            } else {
                0
            }
        } else {
            0
        };

        Ok(BlockStream {
            loc: loc.to_path_buf(),
            file,
            size,
            offset,
        })
    }

    pub fn to_location(&self) -> path::PathBuf {
        self.loc.clone()
    }

    pub fn to_size(&self) -> u64 {
        self.size
    }

    pub fn to_offset(&self) -> u64 {
        self.offset
    }

    /// Return the next block, None when the fragment is exhausted.
    /// A partially written block at the tail of fragment is returned
    /// as [crate::Error::TruncatedCommitLog].
    pub fn next_block(&mut self) -> Result<Option<BlockInfo>> {
        if self.offset >= self.size {
            return Ok(None);
        }

        let start_offset = self.offset;
        let remaining = self.size - self.offset;
        if remaining < PEEK_LENGTH {
            err_at!(
                TruncatedCommitLog,
                msg: "{:?} header at {} remaining {}", self.loc, start_offset, remaining
            )?
        }

        let seek = SeekFrom::Start(start_offset);
        let peek = read_file!(self.file, seek, PEEK_LENGTH, "block header")?;
        let n = BlockHeader::peek_length(&peek)? as u64;
        if remaining < n {
            err_at!(
                TruncatedCommitLog,
                msg: "{:?} header at {} remaining {}", self.loc, start_offset, remaining
            )?
        }
        let buf = read_file!(self.file, seek, n, "block header")?;
        let header = BlockHeader::decode(&buf)?;

        let m = header.data_zlength as u64;
        if remaining < (n + m) {
            err_at!(
                TruncatedCommitLog,
                msg: "{:?} block at {} remaining {}/{}", self.loc, start_offset, remaining, n + m
            )?
        }
        let zblock = read_file!(self.file, SeekFrom::Start(start_offset + n), m, "zblock")?;

        self.offset = start_offset + n + m;
        Ok(Some(BlockInfo {
            start_offset,
            end_offset: self.offset,
            header,
            zblock,
        }))
    }
}
