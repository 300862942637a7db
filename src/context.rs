//! Module implement the server context shared by pipeline, maintenance,
//! recovery and request handlers.

use log::info;

use std::{
    collections::BTreeMap,
    fs, path,
    sync::{Arc, Mutex},
};

use crate::{
    clock::{RevisionClock, REVISION_NULL},
    commit_log::{CommitLog, CommitLogReader},
    config::Config,
    query_cache::QueryCache,
    recovery::transfer::{self, TransferLogNamer},
    state::StateCell,
    table::{TableIdentifier, TableInfoMap},
    Result,
};

pub struct Context {
    pub location: String,
    pub config: Config,
    pub clock: RevisionClock,
    pub state: StateCell,
    pub tables: TableInfoMap,
    /// Commit log for user tables.
    pub user_log: Arc<CommitLog>,
    /// Commit log for system tables, every append is synced.
    pub system_log: Arc<CommitLog>,
    pub query_cache: Option<QueryCache>,
    pub namer: TransferLogNamer,
    // revisions, per owner, below which commit logs shall not be purged,
    // flagged true for the system log.
    pins: Mutex<BTreeMap<String, (bool, i64)>>,
}

impl Context {
    /// Create a context for server `location`. Existing commit logs under
    /// the configured directory are scanned and adopted, new fragments are
    /// appended after them.
    pub fn new(location: &str, config: Config) -> Result<Context> {
        let tables_dir = config.to_tables_dir();
        err_at!(IOError, fs::create_dir_all(&tables_dir), "{:?}", tables_dir)?;

        let user_log = open_log(&config.to_user_log_dir(), &config)?;
        let system_log = open_log(&config.to_system_log_dir(), &config)?;
        let query_cache = match config.query_cache_size {
            0 => None,
            size => Some(QueryCache::new(size)),
        };

        info!(target: "rangesrv", "{}, context created at {:?}", location, config.dir);

        Ok(Context {
            location: location.to_string(),
            config,
            clock: RevisionClock::new(),
            state: StateCell::new(),
            tables: TableInfoMap::new(),
            user_log: Arc::new(user_log),
            system_log: Arc::new(system_log),
            query_cache,
            namer: TransferLogNamer::default(),
            pins: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn to_range_dir(&self, table_id: &str, end_row: &[u8]) -> path::PathBuf {
        transfer::to_range_dir(&self.config.dir, table_id, end_row)
    }

    /// Return the commit log receiving updates for `table`.
    pub fn to_commit_log(&self, table: &TableIdentifier) -> Arc<CommitLog> {
        match table.is_system() {
            true => Arc::clone(&self.system_log),
            false => Arc::clone(&self.user_log),
        }
    }

    /// Hold back purging of `table`'s commit log at `revision`, on behalf
    /// of `owner`, until [Context::unpin_revision]. Pinning a null
    /// revision is a no-op.
    pub fn pin_revision(&self, owner: &str, table: &TableIdentifier, revision: i64) -> Result<()> {
        if revision != REVISION_NULL {
            let mut pins = err_at!(Fatal, self.pins.lock())?;
            pins.insert(owner.to_string(), (table.is_system(), revision));
        }
        Ok(())
    }

    pub fn unpin_revision(&self, owner: &str) -> Result<()> {
        err_at!(Fatal, self.pins.lock())?.remove(owner);
        Ok(())
    }

    /// Return the lowest pinned revision for user and system logs,
    /// i64::MAX when none are pinned.
    pub fn to_pinned_revisions(&self) -> Result<(i64, i64)> {
        let (mut user, mut system) = (i64::MAX, i64::MAX);
        for (is_system, revision) in err_at!(Fatal, self.pins.lock())?.values() {
            match is_system {
                true => system = std::cmp::min(system, *revision),
                false => user = std::cmp::min(user, *revision),
            }
        }
        Ok((user, system))
    }

    pub fn close(&self) -> Result<()> {
        self.user_log.close()?;
        self.system_log.close()
    }
}

fn open_log(log_dir: &path::Path, config: &Config) -> Result<CommitLog> {
    let log_config = config.commit_log.clone();
    match log_dir.exists() {
        true => {
            let mut reader = CommitLogReader::open(log_dir, log_config.clone())?;
            reader.scan()?;
            CommitLog::create(log_dir, log_config, Some(&reader))
        }
        false => CommitLog::create(log_dir, log_config, None),
    }
}
