use log::{debug, warn};
use regex::Regex;

use std::{fs, io, path, thread, time};

use crate::{commit_log, commit_log::CommitLog, hash, Result};

/// Pattern for log names under a table's transfer directory.
pub const LOG_NAME_PATTERN: &str = r"^([0-9a-f]+)_(phantom-)?(-?[0-9]+)$";

/// Default interval between attempts to allocate a transfer log name.
pub const NAME_RETRY_INTERVAL: time::Duration = time::Duration::from_millis(1200);
/// Default attempts to allocate a transfer log name.
pub const NAME_RETRY_LIMIT: usize = 10;

/// Directory holding transfer and phantom logs for table `table_id`.
pub fn to_xfer_dir(toplevel: &path::Path, table_id: &str) -> path::PathBuf {
    toplevel.join("tables").join(table_id).join("_xfer")
}

/// Directory holding cell stores of the range ending at `end_row`.
pub fn to_range_dir(toplevel: &path::Path, table_id: &str, end_row: &[u8]) -> path::PathBuf {
    toplevel
        .join("tables")
        .join(table_id)
        .join(hash::hash16(end_row))
}

/// Phantom log for range ending at `end_row`, recovered under operation
/// `op_id`.
pub fn to_phantom_log_dir(
    toplevel: &path::Path,
    table_id: &str,
    end_row: &[u8],
    op_id: i64,
) -> path::PathBuf {
    let name = format!("{}_phantom-{}", hash::hash16(end_row), op_id);
    to_xfer_dir(toplevel, table_id).join(name)
}

/// Create the phantom log at `log_dir`, a stale log left behind by an
/// earlier attempt of the same operation is removed first.
pub fn create_phantom_log(log_dir: &path::Path, config: commit_log::Config) -> Result<CommitLog> {
    match fs::remove_dir_all(log_dir) {
        Ok(_) => warn!(target: "recovery", "removed stale phantom log {:?}", log_dir),
        Err(err) if err.kind() == io::ErrorKind::NotFound => (),
        Err(err) => err_at!(IOError, Err(err), "{:?}", log_dir)?,
    }
    CommitLog::create(log_dir, config, None)
}

/// Log found under a table's transfer directory, `prefix` is the hash of
/// the range's end row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferLogName {
    /// Split transfer log, allocated at `epoch` seconds.
    Split { prefix: String, epoch: u64 },
    /// Phantom log of recovery operation `op_id`.
    Phantom { prefix: String, op_id: i64 },
}

/// Parse a transfer or phantom log name, None if `name` is neither.
pub fn parse_log_name(name: &str) -> Result<Option<TransferLogName>> {
    let re = err_at!(InvalidInput, Regex::new(LOG_NAME_PATTERN), "bad re:{:?}", LOG_NAME_PATTERN)?;
    let caps = match re.captures(name) {
        Some(caps) => caps,
        None => return Ok(None),
    };
    let (prefix, num) = match (caps.get(1), caps.get(3)) {
        (Some(prefix), Some(num)) => (prefix.as_str().to_string(), num.as_str()),
        _ => return Ok(None),
    };
    let name = match caps.get(2) {
        Some(_) => {
            let op_id = err_at!(FailConvert, num.parse::<i64>(), "{}", name)?;
            TransferLogName::Phantom { prefix, op_id }
        }
        None => match num.parse::<u64>() {
            Ok(epoch) => TransferLogName::Split { prefix, epoch },
            Err(_) => return Ok(None),
        },
    };
    Ok(Some(name))
}

/// List transfer and phantom logs of table `table_id`, sorted by path.
pub fn list_transfer_logs(
    toplevel: &path::Path,
    table_id: &str,
) -> Result<Vec<(path::PathBuf, TransferLogName)>> {
    let xfer_dir = to_xfer_dir(toplevel, table_id);
    let entries = match fs::read_dir(&xfer_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => err_at!(IOError, msg: "{:?} {}", xfer_dir, err)?,
    };

    let mut logs = vec![];
    for entry in entries {
        let entry = err_at!(IOError, entry)?;
        if !err_at!(IOError, entry.file_type())?.is_dir() {
            continue;
        }
        let name = match entry.file_name().to_str() {
            Some(name) => parse_log_name(name)?,
            None => None,
        };
        match name {
            Some(name) => logs.push((entry.path(), name)),
            None => debug!(target: "recovery", "skipping {:?}", entry.path()),
        }
    }
    logs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(logs)
}

/// Allocate unique transfer log directories, named
/// `<hash(end_row)>_<epoch-seconds>` under the table's transfer directory.
///
/// A name is reserved by creating its directory. On collision, typically
/// two splits of the same range within a second, allocation sleeps for
/// the retry interval and tries again with a fresh timestamp.
pub struct TransferLogNamer {
    interval: time::Duration,
    max_attempts: usize,
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl Default for TransferLogNamer {
    fn default() -> TransferLogNamer {
        TransferLogNamer::new(NAME_RETRY_INTERVAL, NAME_RETRY_LIMIT)
    }
}

impl TransferLogNamer {
    pub fn new(interval: time::Duration, max_attempts: usize) -> TransferLogNamer {
        TransferLogNamer {
            interval,
            max_attempts: std::cmp::max(max_attempts, 1),
            clock: Box::new(|| chrono::Utc::now().timestamp() as u64),
        }
    }

    /// Use `clock`, returning seconds, for timestamps.
    pub fn set_clock<F>(&mut self, clock: F) -> &mut Self
    where
        F: 'static + Fn() -> u64 + Send + Sync,
    {
        self.clock = Box::new(clock);
        self
    }

    pub fn allocate(
        &self,
        toplevel: &path::Path,
        table_id: &str,
        end_row: &[u8],
    ) -> Result<path::PathBuf> {
        let xfer_dir = to_xfer_dir(toplevel, table_id);
        err_at!(IOError, fs::create_dir_all(&xfer_dir), "{:?}", xfer_dir)?;

        let prefix = hash::hash16(end_row);
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                thread::sleep(self.interval);
            }
            let log_dir = xfer_dir.join(format!("{}_{}", prefix, (self.clock)()));
            match fs::create_dir(&log_dir) {
                Ok(_) => {
                    debug!(target: "maintenance", "allocated transfer log {:?}", log_dir);
                    return Ok(log_dir);
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(target: "maintenance", "transfer log {:?} exists", log_dir);
                }
                Err(err) => err_at!(IOError, Err(err), "{:?}", log_dir)?,
            }
        }
        err_at!(
            Timeout,
            msg: "transfer log for {} after {} attempts", table_id, self.max_attempts
        )
    }
}

#[cfg(test)]
#[path = "transfer_test.rs"]
mod transfer_test;
