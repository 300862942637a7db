//! Module implement range maintenance, compactions, splits, drops and
//! relinquish, along with the background [Scheduler].
//!
//! Every maintenance task first acquires the range's maintenance guard
//! through [Range::begin_maintenance], which turns away new update batches
//! and waits for in-flight batches to drain.

use log::{debug, error, info, warn};

use std::{
    fmt, fs, ops,
    sync::{mpsc, Arc},
    time,
};

use crate::{
    commit_log::{CommitLog, CommitLogBase},
    context::Context,
    range::{Range, TransferInfo},
    recovery,
    table::{RangeSpec, TableInfo},
    util::thread::{Rx, Thread, Tx},
    Error, Result,
};

/// Bit set of maintenance tasks due on a range.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceFlag(u32);

impl MaintenanceFlag {
    pub const SPLIT: MaintenanceFlag = MaintenanceFlag(0x01);
    pub const COMPACT_MINOR: MaintenanceFlag = MaintenanceFlag(0x02);
    pub const COMPACT_MAJOR: MaintenanceFlag = MaintenanceFlag(0x04);
    pub const COMPACT_MERGING: MaintenanceFlag = MaintenanceFlag(0x08);
    pub const COMPACT_GC: MaintenanceFlag = MaintenanceFlag(0x10);
    pub const MEMORY_PURGE: MaintenanceFlag = MaintenanceFlag(0x20);
    pub const RELINQUISH: MaintenanceFlag = MaintenanceFlag(0x40);

    const NAMES: [(MaintenanceFlag, &'static str); 7] = [
        (MaintenanceFlag::SPLIT, "split"),
        (MaintenanceFlag::COMPACT_MINOR, "minor"),
        (MaintenanceFlag::COMPACT_MAJOR, "major"),
        (MaintenanceFlag::COMPACT_MERGING, "merging"),
        (MaintenanceFlag::COMPACT_GC, "gc"),
        (MaintenanceFlag::MEMORY_PURGE, "memory-purge"),
        (MaintenanceFlag::RELINQUISH, "relinquish"),
    ];

    pub fn from_bits(bits: u32) -> MaintenanceFlag {
        MaintenanceFlag(bits & 0x7F)
    }

    pub fn to_bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: MaintenanceFlag) -> bool {
        other.0 != 0 && (self.0 & other.0) == other.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_compaction(&self) -> bool {
        let mask = MaintenanceFlag::COMPACT_MINOR
            | MaintenanceFlag::COMPACT_MAJOR
            | MaintenanceFlag::COMPACT_MERGING
            | MaintenanceFlag::COMPACT_GC
            | MaintenanceFlag::MEMORY_PURGE;
        (self.0 & mask.0) != 0
    }

    pub fn to_names(&self) -> Vec<&'static str> {
        MaintenanceFlag::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl ops::BitOr for MaintenanceFlag {
    type Output = MaintenanceFlag;

    fn bitor(self, rhs: MaintenanceFlag) -> MaintenanceFlag {
        MaintenanceFlag(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for MaintenanceFlag {
    fn bitor_assign(&mut self, rhs: MaintenanceFlag) {
        self.0 |= rhs.0
    }
}

impl fmt::Display for MaintenanceFlag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_names().join("|"))
    }
}

impl fmt::Debug for MaintenanceFlag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MaintenanceFlag({:#x}:{})", self.0, self)
    }
}

/// Return the maintenance tasks due on `range` as per configured
/// thresholds.
pub fn needs_maintenance(ctx: &Context, range: &Range) -> Result<MaintenanceFlag> {
    let config = &ctx.config;
    let mut flags = MaintenanceFlag::default();

    if range.is_relinquishing() {
        flags |= MaintenanceFlag::RELINQUISH;
        return Ok(flags);
    }
    if range.footprint()? > config.split_threshold && range.to_transfer()?.is_none() {
        flags |= MaintenanceFlag::SPLIT;
    } else if range.cache_footprint()? > config.compact_minor_threshold {
        flags |= MaintenanceFlag::COMPACT_MINOR;
    }
    if range.store_count()? >= config.compact_merge_stores {
        flags |= MaintenanceFlag::COMPACT_MERGING;
    }
    Ok(flags)
}

// Retry parameters for acquiring the maintenance guard, waits for at most
// the configured request timeout.
fn guard_retry(ctx: &Context) -> (time::Duration, usize) {
    let interval = ctx.config.busy_retry_interval;
    let millis = std::cmp::max(interval.as_millis(), 1);
    let limit = (ctx.config.request_timeout.as_millis() / millis) as usize;
    (interval, std::cmp::max(limit, ctx.config.busy_retry_limit))
}

/// Run maintenance `flags` on `range` of `table`.
pub fn run(ctx: &Context, table: &TableInfo, range: &Arc<Range>, flags: MaintenanceFlag) -> Result<()> {
    debug!(target: "maintenance", "{}, running {}", range, flags);

    if flags.contains(MaintenanceFlag::RELINQUISH) {
        relinquish(ctx, table, range)?;
    } else if flags.contains(MaintenanceFlag::SPLIT) {
        split(ctx, table, range)?;
    } else if flags.is_compaction() {
        compact(ctx, range, flags)?;
    }
    purge_commit_logs(ctx)?;
    Ok(())
}

/// Compact `range` as per `flags`. Minor compaction and memory purge
/// freeze the cell cache, major and gc compactions merge all stores
/// dropping deleted cells, merging compaction merge stores retaining
/// delete markers.
pub fn compact(ctx: &Context, range: &Range, flags: MaintenanceFlag) -> Result<()> {
    let (interval, limit) = guard_retry(ctx);
    let _activator = range.begin_maintenance(interval, limit)?;

    if flags.contains(MaintenanceFlag::COMPACT_MINOR) || flags.contains(MaintenanceFlag::MEMORY_PURGE) {
        range.compact_minor()?;
    }
    if flags.contains(MaintenanceFlag::COMPACT_MAJOR) || flags.contains(MaintenanceFlag::COMPACT_GC) {
        range.compact_major(true)?;
    } else if flags.contains(MaintenanceFlag::COMPACT_MERGING) {
        range.compact_major(false)?;
    }
    Ok(())
}

/// Purge commit log fragments whose mutations are all persisted in cell
/// stores. User and system logs are purged independently, each below
/// the earliest revision still held in any cell cache of its ranges, or
/// pinned on the context. Return the number of fragments removed.
pub fn purge_commit_logs(ctx: &Context) -> Result<usize> {
    let (mut user_rev, mut system_rev) = ctx.to_pinned_revisions()?;
    for (table, range) in ctx.tables.to_ranges()?.into_iter() {
        let revision = match range.to_earliest_cached_revision()? {
            crate::clock::REVISION_NULL => continue,
            revision => revision,
        };
        match table.to_identifier()?.is_system() {
            true => system_rev = std::cmp::min(system_rev, revision),
            false => user_rev = std::cmp::min(user_rev, revision),
        }
    }

    let n = ctx.user_log.purge(user_rev)?.len() + ctx.system_log.purge(system_rev)?.len();
    if n > 0 {
        info!(
            target: "maintenance",
            "purged {} fragments, user:{} system:{}", n, user_rev, system_rev
        );
    }
    Ok(n)
}

/// Split `range` into two. Rows at or below the split row move out into a
/// new range, `range` shrinks to the upper half. Return the new range,
/// None if `range` is too small to split.
///
/// Split happens in two phases. First, a transfer log is installed on the
/// range, updates to the moving rows are logged into it from then on.
/// Second, with the guard held again, the range is shrunk and the new
/// range is created and caught up from the transfer log. Finally the
/// transfer log is linked into the commit log so that it gets purged
/// along with it.
pub fn split(ctx: &Context, table: &TableInfo, range: &Arc<Range>) -> Result<Option<Arc<Range>>> {
    let (interval, limit) = guard_retry(ctx);
    let table_id = table.to_id();

    let (split_row, log) = {
        let _activator = range.begin_maintenance(interval, limit)?;
        let split_row = match range.to_split_row()? {
            Some(split_row) => split_row,
            None => {
                debug!(target: "maintenance", "{}, too small to split", range);
                return Ok(None);
            }
        };
        let spec = range.to_spec()?;
        let log_dir = ctx.namer.allocate(&ctx.config.dir, &table_id, &spec.end_row)?;
        let log = Arc::new(CommitLog::create(&log_dir, ctx.config.commit_log.clone(), None)?);
        range.set_transfer(TransferInfo {
            split_row: split_row.clone(),
            log_dir,
            log: Arc::clone(&log),
        })?;
        info!(
            target: "maintenance",
            "{}, splitting at {:?}", range, String::from_utf8_lossy(&split_row)
        );
        (split_row, log)
    };

    // once the transfer log is installed, the second phase must run to
    // completion, so keep trying for the guard.
    let activator = loop {
        match range.begin_maintenance(interval, limit) {
            Ok(activator) => break Ok(activator),
            Err(Error::RangeBusy(_, msg)) => {
                warn!(target: "maintenance", "{}, split waiting {}", range, msg)
            }
            Err(err) => break Err(err),
        }
    };

    let res = match activator {
        Ok(_activator) => {
            let res = split_shrink(ctx, table, range, &split_row, &log);
            finish_transfer(ctx, range, &log).and(res)
        }
        Err(err) => finish_transfer(ctx, range, &log).and(Err(err)),
    };
    match res {
        Ok(new_range) => Ok(Some(new_range)),
        Err(err) => {
            error!(target: "maintenance", "{}, split failed {}", range, err);
            Err(err)
        }
    }
}

// Callers shall hold the maintenance guard.
fn split_shrink(
    ctx: &Context,
    table: &TableInfo,
    range: &Arc<Range>,
    split_row: &[u8],
    log: &CommitLog,
) -> Result<Arc<Range>> {
    let old_spec = range.to_spec()?;
    let low_cells = range.shrink(split_row)?;

    let spec = RangeSpec::new(&old_spec.start_row, split_row);
    let range_dir = ctx.to_range_dir(&table.to_id(), split_row);
    let revision = range.to_latest_revision();
    let new_range = Range::create(range.to_table(), spec, &range_dir, low_cells, revision)?;

    // catch up with updates logged after the transfer started.
    log.close()?;
    let n = recovery::replay_into_range(&log.to_log_dir(), ctx.config.commit_log.clone(), &new_range)?;
    let new_range = Arc::new(new_range);
    table.add_range(Arc::clone(&new_range))?;

    info!(
        target: "maintenance",
        "{}, split off {}, replayed {} cells from transfer log", range, new_range, n
    );
    Ok(new_range)
}

// Remove the transfer log from `range` and link it into the commit log,
// an empty transfer log is removed instead.
fn finish_transfer(ctx: &Context, range: &Range, log: &CommitLog) -> Result<()> {
    range.clear_transfer()?;
    log.close()?;

    let log_dir = log.to_log_dir();
    match log.to_latest_revision() {
        crate::clock::REVISION_NULL => match fs::remove_dir_all(&log_dir) {
            Ok(_) => debug!(target: "maintenance", "removed empty transfer log {:?}", log_dir),
            Err(err) => warn!(target: "maintenance", "remove {:?} {}", log_dir, err),
        },
        _ => ctx.to_commit_log(&range.to_table()).link_log(ctx.config.cluster_id, log)?,
    }
    if let Some(xfer_dir) = log_dir.parent() {
        // fails while other transfer logs are in progress.
        fs::remove_dir(xfer_dir).ok();
    }
    Ok(())
}

/// Drop `range` and its files. Waits for in-flight maintenance and
/// updates to complete, after which the range refuses all activity.
pub fn drop_range(table: &TableInfo, range: &Range) -> Result<()> {
    range.as_guard().wait_for_complete(true)?;
    let end_row = range.to_spec()?.end_row;
    table.remove_range(&end_row)?;
    range.remove_files()?;
    info!(target: "maintenance", "{}, dropped", range);
    Ok(())
}

/// Hand over `range` to another server. The cell cache is persisted and
/// the range is removed from `table`, its files remain for the next owner.
pub fn relinquish(ctx: &Context, table: &TableInfo, range: &Range) -> Result<()> {
    range.set_relinquish();
    {
        let (interval, limit) = guard_retry(ctx);
        let _activator = range.begin_maintenance(interval, limit)?;
        range.compact_minor()?;
    }
    range.as_guard().wait_for_complete(true)?;
    let end_row = range.to_spec()?.end_row;
    table.remove_range(&end_row)?;
    info!(target: "maintenance", "{}, relinquished", range);
    Ok(())
}

/// Message type for [Scheduler].
pub enum Msg {
    /// Look for ranges needing maintenance.
    Check,
}

/// Background thread scheduling range maintenance. Ranges are checked
/// once every maintenance interval, or on demand through [Msg::Check].
pub struct Scheduler {
    thread: Thread<Msg, (), ()>,
}

impl Scheduler {
    pub fn new(ctx: Arc<Context>) -> Result<Scheduler> {
        let thread = Thread::new("maintenance", move |rx: Rx<Msg, ()>| {
            move || scheduler_loop(ctx, rx)
        })?;
        Ok(Scheduler { thread })
    }

    pub fn to_tx(&self) -> Result<Tx<Msg, ()>> {
        self.thread.to_tx()
    }

    /// Request a maintenance check.
    pub fn check(&self) -> Result<()> {
        self.thread.to_tx()?.post(Msg::Check)
    }

    /// Stop the scheduler, all clones of its [Tx] must be dropped before
    /// calling this.
    pub fn close(self) -> Result<()> {
        self.thread.join()
    }
}

fn scheduler_loop(ctx: Arc<Context>, rx: Rx<Msg, ()>) {
    let interval = ctx.config.maintenance_interval;
    info!(target: "maintenance", "scheduler started, interval {:?}", interval);

    loop {
        match rx.recv_timeout(interval) {
            Ok((Msg::Check, _)) => {
                // coalesce pending checks.
                while let Ok((Msg::Check, _)) = rx.try_recv() {}
            }
            Err(mpsc::RecvTimeoutError::Timeout) => (),
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
        if let Err(err) = schedule(&ctx) {
            error!(target: "maintenance", "schedule {}", err);
        }
    }

    info!(target: "maintenance", "scheduler stopped");
}

/// Run due maintenance on all ranges. Tables with maintenance disabled,
/// or the whole server with maintenance disabled, are skipped.
pub fn schedule(ctx: &Context) -> Result<usize> {
    if ctx.state.to_snapshot()?.maintenance_disabled {
        return Ok(0);
    }

    let mut n = 0;
    for (table, range) in ctx.tables.to_ranges()?.into_iter() {
        if table.is_maintenance_disabled() || range.as_guard().is_disabled() {
            continue;
        }
        let flags = needs_maintenance(ctx, &range)?;
        if flags.is_empty() {
            continue;
        }
        match run(ctx, &table, &range, flags) {
            Ok(()) => n += 1,
            Err(Error::RangeBusy(_, msg)) => {
                debug!(target: "maintenance", "{}, busy {}", range, msg);
            }
            Err(err) => error!(target: "maintenance", "{}, {} failed {}", range, flags, err),
        }
    }
    Ok(n)
}

#[cfg(test)]
#[path = "maintenance_test.rs"]
mod maintenance_test;
