//! Module implement the block structured commit log.
//!
//! A commit log is a directory of numbered fragment files. Each fragment
//! starts with an 8-byte file header, followed by a sequence of blocks:
//!
//! ```text
//! [block-header][compressed payload] [block-header][compressed payload] ...
//! ```
//!
//! Block headers carry magic, version, compression type, checksums, lengths
//! and, from version 1 onwards, revision and cluster-id. Data blocks carry
//! serialized mutations, link blocks carry the path of another commit log
//! whose fragments are logically part of this log.
//!
//! Writers append through [CommitLog], readers iterate blocks, following
//! links, through [CommitLogReader]. Group commit is achieved by calling
//! [CommitLog::append] without sync and issuing one [CommitLog::sync] for
//! a batch of appends.

use std::path;

mod header;
mod reader;
mod stream;
mod writer;

pub use header::{
    decode_block, encode_block, inflate_block, BlockHeader, BLOCK_HEADER_VERSION,
    HEADER_LENGTH_V0, HEADER_LENGTH_V1,
};
pub use reader::{Block, CommitLogReader};
pub use stream::{BlockInfo, BlockStream, FRAGMENT_HEADER};
pub use writer::CommitLog;

use crate::compress::CompressionType;

/// Magic for data blocks.
pub const MAGIC_DATA: &[u8; 10] = b"COMMITDATA";
/// Magic for link blocks.
pub const MAGIC_LINK: &[u8; 10] = b"COMMITLINK";

/// Default fragment size limit, beyond which fragments are rolled, 100MB.
pub const ROLL_LIMIT: u64 = 100 * 1024 * 1024;

/// Lock file held by the writer of a log directory.
pub const LOCK_FILE: &str = "LOCK";

/// Configuration for [CommitLog] and [CommitLogReader].
#[derive(Clone, Debug)]
pub struct Config {
    /// Fragment size limit, after which the fragment is rolled.
    ///
    /// Default: [ROLL_LIMIT]
    pub roll_limit: u64,
    /// Compression type for data blocks.
    ///
    /// Default: zlib
    pub compressor: CompressionType,
    /// While reading, skip over corrupt blocks with a warning, instead of
    /// failing.
    ///
    /// Default: false
    pub skip_errors: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            roll_limit: ROLL_LIMIT,
            compressor: CompressionType::Zlib,
            skip_errors: false,
        }
    }
}

impl<'a> arbitrary::Arbitrary<'a> for Config {
    fn arbitrary(u: &mut arbitrary::Unstructured) -> arbitrary::Result<Self> {
        let roll_limit = *u.choose(&[1024, 10 * 1024, 1024 * 1024, ROLL_LIMIT])?;
        let compressor = *u.choose(&[
            CompressionType::None,
            CompressionType::Zlib,
            CompressionType::Zstd,
            CompressionType::Lzma,
        ])?;

        let config = Config {
            roll_limit,
            compressor,
            skip_errors: false,
        };
        Ok(config)
    }
}

impl Config {
    pub fn set_roll_limit(&mut self, roll_limit: u64) -> &mut Self {
        self.roll_limit = roll_limit;
        self
    }

    pub fn set_compressor(&mut self, compressor: CompressionType) -> &mut Self {
        self.compressor = compressor;
        self
    }

    pub fn set_skip_errors(&mut self, skip_errors: bool) -> &mut Self {
        self.skip_errors = skip_errors;
        self
    }
}

/// Book keeping for a single fragment file.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    /// Directory of the log this fragment belongs to.
    pub log_dir: path::PathBuf,
    /// Fragment number.
    pub num: u32,
    /// Size of fragment in bytes.
    pub size: u64,
    /// Latest revision found in this fragment.
    pub revision: i64,
    /// For linked fragments, the fragment holding the link block.
    pub parent: Option<(path::PathBuf, u32)>,
}

impl FileInfo {
    pub fn to_path(&self) -> path::PathBuf {
        to_fragment_path(&self.log_dir, self.num)
    }
}

/// Common interface to query a commit log, used when linking logs.
pub trait CommitLogBase {
    fn to_log_dir(&self) -> path::PathBuf;

    fn to_latest_revision(&self) -> i64;

    /// Return completed fragments of this log, including fragments
    /// adopted through links.
    fn to_fragments(&self) -> Vec<FileInfo>;
}

/// Compose path to fragment `num` under `log_dir`.
pub fn to_fragment_path(log_dir: &path::Path, num: u32) -> path::PathBuf {
    log_dir.join(num.to_string())
}
