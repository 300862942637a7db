use serde::de::DeserializeOwned;

use std::{ffi, fs, path};

use crate::Result;

#[macro_export]
macro_rules! read_file {
    ($fd:expr, $seek:expr, $n:expr, $msg:expr) => {{
        use std::convert::TryFrom;
        use std::io::{Read, Seek};

        match $fd.seek($seek) {
            Ok(_) => match usize::try_from($n) {
                Ok(n) => {
                    let mut buf = vec![0; n];
                    match $fd.read_exact(&mut buf) {
                        Ok(_) => Ok(buf),
                        Err(err) => {
                            err_at!(IOError, msg: concat!($msg, " {} at {:?}"), err, $seek)
                        }
                    }
                }
                Err(err) => err_at!(FailConvert, msg: "{}", err),
            },
            Err(err) => err_at!(IOError, msg: "{}", err),
        }
    }};
}

#[macro_export]
macro_rules! write_file {
    ($fd:expr, $buffer:expr, $file:expr, $msg:expr) => {{
        use std::io::Write;

        match err_at!(IOError, $fd.write($buffer))? {
            n if $buffer.len() == n => Ok(n),
            n => err_at!(
                Fatal, msg: "partial-wr {}, {:?}, {}/{}", $msg, $file, $buffer.len(), n
            ),
        }
    }};
}

/// create a file in append mode for writing.
pub fn create_file_a(file: &ffi::OsStr) -> Result<fs::File> {
    let os_file = {
        let os_file = path::Path::new(file);
        fs::remove_file(os_file).ok(); // NOTE: ignore remove errors.
        os_file
    };

    {
        let parent = match os_file.parent() {
            Some(parent) => Ok(parent),
            None => err_at!(InvalidFile, msg: "{:?}", file),
        }?;
        err_at!(IOError, fs::create_dir_all(parent))?;
    };

    let mut opts = fs::OpenOptions::new();
    err_at!(IOError, opts.append(true).create_new(true).open(os_file))
}

/// open file for reading.
pub fn open_file_r(file: &ffi::OsStr) -> Result<fs::File> {
    let os_file = path::Path::new(file);
    err_at!(IOError, fs::OpenOptions::new().read(true).open(os_file))
}

pub fn sync_write(file: &mut fs::File, data: &[u8]) -> Result<usize> {
    use std::io::Write;

    let n = err_at!(IOError, file.write(data))?;
    if n != data.len() {
        err_at!(IOError, msg: "partial write to file {} {}", n, data.len())?
    }
    err_at!(IOError, file.sync_all())?;
    Ok(n)
}

/// Load toml file and parse it into type `T`.
pub fn load_toml<P, T>(loc: P) -> Result<T>
where
    P: AsRef<path::Path>,
    T: DeserializeOwned,
{
    use std::str::from_utf8;

    let ploc: &path::Path = loc.as_ref();
    let data = err_at!(IOError, fs::read(ploc))?;
    let s = err_at!(FailConvert, from_utf8(&data), "not utf8 for {:?}", ploc)?;
    err_at!(FailConvert, toml::from_str(s), "file:{:?}", ploc)
}

/// List numbered files under `dir`, file names that don't parse as
/// number are skipped. Returned list is sorted on the number.
pub fn numbered_files(dir: &path::Path) -> Result<Vec<(u32, path::PathBuf)>> {
    let mut items = vec![];
    for entry in err_at!(IOError, fs::read_dir(dir))? {
        let entry = err_at!(IOError, entry)?;
        if !err_at!(IOError, entry.file_type())?.is_file() {
            continue;
        }
        let num = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok());
        if let Some(num) = num {
            items.push((num, entry.path()))
        }
    }
    items.sort_by_key(|(num, _)| *num);

    Ok(items)
}

#[cfg(test)]
#[path = "files_test.rs"]
mod files_test;
