//! Rangesrv implement the core of a range server, for sorted,
//! range-partitioned tables of versioned cells.
//!
//! Tables are split by row into ranges, and each [Range][range::Range]
//! is served by one server at any time. Mutations are made durable in a
//! shared commit log before they are applied to the range's in-memory
//! cell cache, and revisions are issued by a monotonic, wall-clock
//! driven [clock]. Cell caches are periodically compacted into cell
//! stores, after which commit log fragments can be purged.
//!
//! Server side, [RangeServer] tie together:
//!
//! * [update], a three stage pipeline to qualify, commit and respond to
//!   batched updates.
//! * [scan], scanners handing out cells in blocks.
//! * [range::maintenance], background compaction, split and commit log
//!   purge, co-ordinated with updates through per range guards.
//! * [recovery], taking over ranges of a failed server through phantom
//!   ranges, replayed from the failed server's commit log.
//!
//! Client side, [mutator] scatter buffered mutations to servers holding
//! their ranges, resending mutations that were sent to the wrong server.
//!
//! Every server instance carry its own [Config], typically loaded from a
//! toml file.

#[macro_use]
mod error;

pub mod clock;
pub mod commit_log;
pub mod compress;
pub mod config;
pub mod context;
pub mod hash;
pub mod key;
pub mod mutator;
pub mod query_cache;
pub mod range;
pub mod recovery;
pub mod scan;
pub mod server;
pub mod state;
pub mod table;
pub mod update;
pub mod util;

pub use config::Config;
pub use error::{code, Error, Result};
pub use server::RangeServer;
