//! Module implement range server configuration.
//!
//! Configuration can be composed in code, using [Config::new] and the
//! `set_*` builder methods, or loaded from a toml file via [TomlConfig].

use arbitrary::Arbitrary;
use serde::Deserialize;

use std::{convert::TryFrom, path, time};

use crate::{commit_log, compress::CompressionType, util, Error, Result};

/// Default cluster id stamped into commit log blocks.
pub const CLUSTER_ID: u64 = 1;
/// Default byte limit for coalescing update requests and commit groups, 5MB.
pub const COALESCE_LIMIT: usize = 5 * 1024 * 1024;
/// Default group commit window.
pub const COMMIT_INTERVAL: time::Duration = time::Duration::from_millis(50);
/// Default allowed clock skew between servers.
pub const MAX_CLOCK_SKEW: time::Duration = time::Duration::from_secs(180);
/// Default number of times a busy range is retried within a request.
pub const BUSY_RETRY_LIMIT: usize = 10;
/// Default interval between busy retries.
pub const BUSY_RETRY_INTERVAL: time::Duration = time::Duration::from_millis(10);
/// Default number of times a failed group sync is retried.
pub const SYNC_RETRY_LIMIT: usize = 3;
/// Default interval between sync retries.
pub const SYNC_RETRY_INTERVAL: time::Duration = time::Duration::from_millis(100);
/// Default request timeout.
pub const REQUEST_TIMEOUT: time::Duration = time::Duration::from_secs(30);
/// Default cell cache size that triggers a minor compaction, 8MB.
pub const COMPACT_MINOR_THRESHOLD: usize = 8 * 1024 * 1024;
/// Default number of cell stores that triggers a merging compaction.
pub const COMPACT_MERGE_STORES: usize = 4;
/// Default range size that triggers a split, 256MB.
pub const SPLIT_THRESHOLD: usize = 256 * 1024 * 1024;
/// Default interval between maintenance passes.
pub const MAINTENANCE_INTERVAL: time::Duration = time::Duration::from_secs(1);
/// Default memory budget for query cache, 32MB.
pub const QUERY_CACHE_SIZE: usize = 32 * 1024 * 1024;
/// Default scanner block size, 64KB.
pub const SCANNER_BLOCK_SIZE: usize = 64 * 1024;

/// Configuration for [crate::RangeServer].
#[derive(Clone, Debug)]
pub struct Config {
    /// Toplevel directory holding commit logs, tables and transfer logs.
    pub dir: path::PathBuf,
    /// Cluster id stamped into commit log blocks.
    ///
    /// Default: [CLUSTER_ID]
    pub cluster_id: u64,
    /// Refer to [commit_log::Config].
    pub commit_log: commit_log::Config,
    /// Update requests are coalesced into one pipeline context, and
    /// contexts into one commit group, up to this many bytes.
    ///
    /// Default: [COALESCE_LIMIT]
    pub coalesce_limit: usize,
    /// Wait at most this long for more contexts before syncing a group.
    ///
    /// Default: [COMMIT_INTERVAL]
    pub commit_interval: time::Duration,
    /// Default: [MAX_CLOCK_SKEW]
    pub max_clock_skew: time::Duration,
    /// Default: [BUSY_RETRY_LIMIT]
    pub busy_retry_limit: usize,
    /// Default: [BUSY_RETRY_INTERVAL]
    pub busy_retry_interval: time::Duration,
    /// Default: [SYNC_RETRY_LIMIT]
    pub sync_retry_limit: usize,
    /// Default: [SYNC_RETRY_INTERVAL]
    pub sync_retry_interval: time::Duration,
    /// Default: [REQUEST_TIMEOUT]
    pub request_timeout: time::Duration,
    /// Default: [COMPACT_MINOR_THRESHOLD]
    pub compact_minor_threshold: usize,
    /// Default: [COMPACT_MERGE_STORES]
    pub compact_merge_stores: usize,
    /// Default: [SPLIT_THRESHOLD]
    pub split_threshold: usize,
    /// Default: [MAINTENANCE_INTERVAL]
    pub maintenance_interval: time::Duration,
    /// Query cache memory budget, zero disables the cache.
    ///
    /// Default: [QUERY_CACHE_SIZE]
    pub query_cache_size: usize,
    /// Default: [SCANNER_BLOCK_SIZE]
    pub scanner_block_size: usize,
    /// Number of request dispatcher threads.
    ///
    /// Default: number of cores.
    pub pool_size: usize,
}

impl Config {
    pub fn new(dir: &path::Path) -> Config {
        Config {
            dir: dir.to_path_buf(),
            cluster_id: CLUSTER_ID,
            commit_log: commit_log::Config::default(),
            coalesce_limit: COALESCE_LIMIT,
            commit_interval: COMMIT_INTERVAL,
            max_clock_skew: MAX_CLOCK_SKEW,
            busy_retry_limit: BUSY_RETRY_LIMIT,
            busy_retry_interval: BUSY_RETRY_INTERVAL,
            sync_retry_limit: SYNC_RETRY_LIMIT,
            sync_retry_interval: SYNC_RETRY_INTERVAL,
            request_timeout: REQUEST_TIMEOUT,
            compact_minor_threshold: COMPACT_MINOR_THRESHOLD,
            compact_merge_stores: COMPACT_MERGE_STORES,
            split_threshold: SPLIT_THRESHOLD,
            maintenance_interval: MAINTENANCE_INTERVAL,
            query_cache_size: QUERY_CACHE_SIZE,
            scanner_block_size: SCANNER_BLOCK_SIZE,
            pool_size: num_cpus::get(),
        }
    }

    /// Load configuration from toml file at `loc`.
    pub fn from_toml<P>(loc: P) -> Result<Config>
    where
        P: AsRef<path::Path>,
    {
        let cfg: TomlConfig = util::files::load_toml(loc)?;
        Config::try_from(cfg)
    }

    pub fn set_cluster_id(&mut self, cluster_id: u64) -> &mut Self {
        self.cluster_id = cluster_id;
        self
    }

    pub fn set_commit_log(&mut self, config: commit_log::Config) -> &mut Self {
        self.commit_log = config;
        self
    }

    pub fn set_coalesce_limit(&mut self, limit: usize) -> &mut Self {
        self.coalesce_limit = limit;
        self
    }

    pub fn set_commit_interval(&mut self, interval: time::Duration) -> &mut Self {
        self.commit_interval = interval;
        self
    }

    pub fn set_max_clock_skew(&mut self, skew: time::Duration) -> &mut Self {
        self.max_clock_skew = skew;
        self
    }

    pub fn set_busy_retry(&mut self, limit: usize, interval: time::Duration) -> &mut Self {
        self.busy_retry_limit = limit;
        self.busy_retry_interval = interval;
        self
    }

    pub fn set_sync_retry(&mut self, limit: usize, interval: time::Duration) -> &mut Self {
        self.sync_retry_limit = limit;
        self.sync_retry_interval = interval;
        self
    }

    pub fn set_request_timeout(&mut self, timeout: time::Duration) -> &mut Self {
        self.request_timeout = timeout;
        self
    }

    pub fn set_compaction(&mut self, minor_threshold: usize, merge_stores: usize) -> &mut Self {
        self.compact_minor_threshold = minor_threshold;
        self.compact_merge_stores = merge_stores;
        self
    }

    pub fn set_split_threshold(&mut self, threshold: usize) -> &mut Self {
        self.split_threshold = threshold;
        self
    }

    pub fn set_maintenance_interval(&mut self, interval: time::Duration) -> &mut Self {
        self.maintenance_interval = interval;
        self
    }

    pub fn set_query_cache_size(&mut self, size: usize) -> &mut Self {
        self.query_cache_size = size;
        self
    }

    pub fn set_scanner_block_size(&mut self, size: usize) -> &mut Self {
        self.scanner_block_size = size;
        self
    }

    pub fn set_pool_size(&mut self, pool_size: usize) -> &mut Self {
        self.pool_size = std::cmp::max(pool_size, 1);
        self
    }
}

impl Config {
    pub fn to_user_log_dir(&self) -> path::PathBuf {
        self.dir.join("log").join("user")
    }

    pub fn to_system_log_dir(&self) -> path::PathBuf {
        self.dir.join("log").join("system")
    }

    pub fn to_tables_dir(&self) -> path::PathBuf {
        self.dir.join("tables")
    }
}

impl<'a> Arbitrary<'a> for Config {
    fn arbitrary(u: &mut arbitrary::Unstructured) -> arbitrary::Result<Self> {
        let dir = std::env::temp_dir().join("rangesrv-arbitrary");
        let mut config = Config::new(&dir);

        config.commit_log = commit_log::Config::arbitrary(u)?;
        config.coalesce_limit = *u.choose(&[1024, 64 * 1024, COALESCE_LIMIT])?;
        config.commit_interval = time::Duration::from_millis(*u.choose(&[0, 1, 10, 50])?);
        config.busy_retry_limit = *u.choose(&[0, 1, BUSY_RETRY_LIMIT])?;
        config.busy_retry_interval = time::Duration::from_millis(*u.choose(&[1, 5])?);
        config.sync_retry_limit = *u.choose(&[0, 1, SYNC_RETRY_LIMIT])?;
        config.sync_retry_interval = time::Duration::from_millis(1);
        config.query_cache_size = *u.choose(&[0, 1024, QUERY_CACHE_SIZE])?;
        config.scanner_block_size = *u.choose(&[128, 1024, SCANNER_BLOCK_SIZE])?;
        config.pool_size = *u.choose(&[1, 2, 4])?;

        Ok(config)
    }
}

/// Configuration as loaded from toml file, durations are in milliseconds.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TomlConfig {
    dir: Option<path::PathBuf>,
    cluster_id: Option<u64>,
    commit_log: Option<TomlCommitLog>,
    coalesce_limit: Option<usize>,
    commit_interval: Option<u64>,
    max_clock_skew: Option<u64>,
    busy_retry_limit: Option<usize>,
    busy_retry_interval: Option<u64>,
    sync_retry_limit: Option<usize>,
    sync_retry_interval: Option<u64>,
    request_timeout: Option<u64>,
    compact_minor_threshold: Option<usize>,
    compact_merge_stores: Option<usize>,
    split_threshold: Option<usize>,
    maintenance_interval: Option<u64>,
    query_cache_size: Option<usize>,
    scanner_block_size: Option<usize>,
    pool_size: Option<usize>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TomlCommitLog {
    roll_limit: Option<u64>,
    compressor: Option<String>,
    skip_errors: Option<bool>,
}

impl TryFrom<TomlCommitLog> for commit_log::Config {
    type Error = Error;

    fn try_from(cfg: TomlCommitLog) -> Result<commit_log::Config> {
        let mut config = commit_log::Config::default();
        if let Some(roll_limit) = cfg.roll_limit {
            config.set_roll_limit(roll_limit);
        }
        if let Some(compressor) = cfg.compressor {
            config.set_compressor(compressor.parse::<CompressionType>()?);
        }
        if let Some(skip_errors) = cfg.skip_errors {
            config.set_skip_errors(skip_errors);
        }
        Ok(config)
    }
}

impl TryFrom<TomlConfig> for Config {
    type Error = Error;

    fn try_from(cfg: TomlConfig) -> Result<Config> {
        let millis = time::Duration::from_millis;

        let dir = match cfg.dir {
            Some(dir) => dir,
            None => err_at!(InvalidInput, msg: "toml config missing `dir`")?,
        };
        let mut config = Config::new(&dir);

        config.cluster_id = cfg.cluster_id.unwrap_or(CLUSTER_ID);
        if let Some(commit_log) = cfg.commit_log {
            config.commit_log = commit_log::Config::try_from(commit_log)?;
        }
        config.coalesce_limit = cfg.coalesce_limit.unwrap_or(COALESCE_LIMIT);
        config.commit_interval = cfg.commit_interval.map(millis).unwrap_or(COMMIT_INTERVAL);
        config.max_clock_skew = cfg.max_clock_skew.map(millis).unwrap_or(MAX_CLOCK_SKEW);
        config.busy_retry_limit = cfg.busy_retry_limit.unwrap_or(BUSY_RETRY_LIMIT);
        config.busy_retry_interval = cfg
            .busy_retry_interval
            .map(millis)
            .unwrap_or(BUSY_RETRY_INTERVAL);
        config.sync_retry_limit = cfg.sync_retry_limit.unwrap_or(SYNC_RETRY_LIMIT);
        config.sync_retry_interval = cfg
            .sync_retry_interval
            .map(millis)
            .unwrap_or(SYNC_RETRY_INTERVAL);
        config.request_timeout = cfg.request_timeout.map(millis).unwrap_or(REQUEST_TIMEOUT);
        config.compact_minor_threshold = cfg
            .compact_minor_threshold
            .unwrap_or(COMPACT_MINOR_THRESHOLD);
        config.compact_merge_stores = cfg.compact_merge_stores.unwrap_or(COMPACT_MERGE_STORES);
        config.split_threshold = cfg.split_threshold.unwrap_or(SPLIT_THRESHOLD);
        config.maintenance_interval = cfg
            .maintenance_interval
            .map(millis)
            .unwrap_or(MAINTENANCE_INTERVAL);
        config.query_cache_size = cfg.query_cache_size.unwrap_or(QUERY_CACHE_SIZE);
        config.scanner_block_size = cfg.scanner_block_size.unwrap_or(SCANNER_BLOCK_SIZE);
        if let Some(pool_size) = cfg.pool_size {
            config.set_pool_size(pool_size);
        }

        Ok(config)
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
