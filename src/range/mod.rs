//! Module implement a range, a contiguous row interval of a table.
//!
//! Mutations are added into an in-memory, sorted, cell cache. Compactions
//! freeze the cache into immutable [CellStore] files and merge stores.
//! Scans merge the cache with all stores and resolve delete markers.
//!
//! Two synchronization primitives gate access to a range:
//!
//! * [RangeMaintenanceGuard], held either by the update pipeline, as a
//!   lease shared by all in-flight batches, or by a maintenance task.
//! * [Barrier], entered by scans and put up by maintenance while it
//!   restructures the range.

use log::{debug, error, info};

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt, fs, path,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering::SeqCst},
        Arc, Mutex, RwLock,
    },
    thread, time,
};

use crate::{
    clock::REVISION_NULL,
    commit_log::CommitLog,
    key::{Cell, CellKey, Flag, Mutations},
    scan::ScanSpec,
    table::{RangeSpec, TableIdentifier},
    Error, Result,
};

mod barrier;
mod guard;
pub mod maintenance;
mod store;

pub use barrier::{Barrier, Entered, Held};
pub use guard::{Activator, GuardState, RangeMaintenanceGuard};
pub use maintenance::{MaintenanceFlag, Scheduler};
pub use store::CellStore;

/// Rows of a splitting range that move to the split-off range, along with
/// the transfer log receiving their mutations.
#[derive(Clone)]
pub struct TransferInfo {
    pub split_row: Vec<u8>,
    pub log_dir: path::PathBuf,
    pub log: Arc<CommitLog>,
}

impl TransferInfo {
    pub fn transferring(&self, row: &[u8]) -> bool {
        row <= self.split_row.as_slice()
    }
}

/// A range of table rows, `(start_row, end_row]`, held by this server.
pub struct Range {
    table: TableIdentifier,
    spec: RwLock<RangeSpec>,
    range_dir: path::PathBuf,

    guard: RangeMaintenanceGuard,
    scan_barrier: Barrier,
    // number of in-flight update batches sharing the guard.
    updates: Mutex<usize>,
    maintenance_pending: AtomicBool,
    // latest revision qualified for this range.
    latest_revision: AtomicI64,
    relinquish: AtomicBool,

    inner: RwLock<Inner>,

    n_cells_written: AtomicU64,
    n_bytes_written: AtomicU64,
}

struct Inner {
    cache: BTreeMap<CellKey, Vec<u8>>,
    cache_footprint: usize,
    // oldest revision in cache, REVISION_NULL for empty cache.
    earliest_cached_revision: i64,
    stores: Vec<Arc<CellStore>>,
    next_store: u32,
    transfer: Option<TransferInfo>,
    error: Option<Error>,
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_name())
    }
}

impl Range {
    /// Load range `spec` of `table`, along with cell stores found under
    /// `range_dir`.
    pub fn new(table: TableIdentifier, spec: RangeSpec, range_dir: &path::Path) -> Result<Range> {
        let stores: Vec<Arc<CellStore>> = CellStore::open_dir(range_dir)?
            .into_iter()
            .map(Arc::new)
            .collect();
        let next_store = stores.last().map(|s| s.to_num() + 1).unwrap_or(0);
        let latest = stores
            .iter()
            .map(|s| s.to_revision())
            .max()
            .unwrap_or(REVISION_NULL);

        let range = Range {
            table,
            spec: RwLock::new(spec),
            range_dir: range_dir.to_path_buf(),

            guard: RangeMaintenanceGuard::new(),
            scan_barrier: Barrier::new(),
            updates: Mutex::new(0),
            maintenance_pending: AtomicBool::new(false),
            latest_revision: AtomicI64::new(latest),
            relinquish: AtomicBool::new(false),

            inner: RwLock::new(Inner {
                cache: BTreeMap::new(),
                cache_footprint: 0,
                earliest_cached_revision: REVISION_NULL,
                stores,
                next_store,
                transfer: None,
                error: None,
            }),

            n_cells_written: AtomicU64::new(0),
            n_bytes_written: AtomicU64::new(0),
        };
        info!(target: "rangesrv", "{}, loaded range at {:?}", range, range_dir);
        Ok(range)
    }

    /// Create range `spec` populated with sorted `cells`.
    pub fn create(
        table: TableIdentifier,
        spec: RangeSpec,
        range_dir: &path::Path,
        cells: Vec<Cell>,
        revision: i64,
    ) -> Result<Range> {
        if !cells.is_empty() {
            let next = CellStore::open_dir(range_dir)?
                .last()
                .map(|s| s.to_num() + 1)
                .unwrap_or(0);
            CellStore::create(range_dir, next, cells, revision)?;
        }
        Range::new(table, spec, range_dir)
    }

    pub fn to_table(&self) -> TableIdentifier {
        self.table.clone()
    }

    pub fn to_spec(&self) -> Result<RangeSpec> {
        Ok(err_at!(Fatal, self.spec.read())?.clone())
    }

    pub fn to_name(&self) -> String {
        match self.spec.read() {
            Ok(spec) => format!("{}{}", self.table.id, spec),
            Err(_) => format!("{}[?]", self.table.id),
        }
    }

    pub fn to_range_dir(&self) -> path::PathBuf {
        self.range_dir.clone()
    }

    pub fn as_guard(&self) -> &RangeMaintenanceGuard {
        &self.guard
    }

    pub fn as_scan_barrier(&self) -> &Barrier {
        &self.scan_barrier
    }

    fn read_inner(&self) -> Result<std::sync::RwLockReadGuard<Inner>> {
        err_at!(Fatal, self.inner.read())
    }

    fn write_inner(&self) -> Result<std::sync::RwLockWriteGuard<Inner>> {
        err_at!(Fatal, self.inner.write())
    }
}

// update lease
impl Range {
    /// Take a share of the update lease. First batch in activates the
    /// maintenance guard on behalf of all in-flight batches. Fails fast
    /// with RangeBusy while maintenance holds, or waits for, the guard,
    /// and once the range is being relinquished.
    pub fn increment_update_counter(&self) -> Result<()> {
        let mut updates = err_at!(Fatal, self.updates.lock())?;
        if self.maintenance_pending.load(SeqCst) {
            err_at!(RangeBusy, msg: "{} maintenance pending", self.to_name())?
        }
        if self.relinquish.load(SeqCst) {
            err_at!(RangeBusy, msg: "{} relinquishing", self.to_name())?
        }
        if *updates == 0 {
            self.guard.activate()?;
        }
        *updates += 1;
        Ok(())
    }

    /// Release a share of the update lease, last batch out deactivates
    /// the guard.
    pub fn decrement_update_counter(&self) -> Result<()> {
        let mut updates = err_at!(Fatal, self.updates.lock())?;
        match *updates {
            0 => err_at!(Fatal, msg: "{} update counter underflow", self.to_name())?,
            1 => {
                *updates = 0;
                self.guard.deactivate()?;
            }
            _ => *updates -= 1,
        }
        Ok(())
    }

    pub fn to_update_count(&self) -> usize {
        self.updates.lock().map(|n| *n).unwrap_or(0)
    }

    /// Acquire the guard for maintenance. New update batches are turned
    /// away while waiting for in-flight batches to drain, for at most
    /// `limit` attempts spaced by `interval`.
    pub fn begin_maintenance(&self, interval: time::Duration, limit: usize) -> Result<Activator> {
        self.maintenance_pending.store(true, SeqCst);
        let mut attempt = 0;
        let res = loop {
            match self.guard.activator() {
                Ok(activator) => break Ok(activator),
                Err(Error::RangeBusy(p, m)) if attempt >= limit => break Err(Error::RangeBusy(p, m)),
                Err(Error::RangeBusy(_, _)) => {
                    attempt += 1;
                    thread::sleep(interval)
                }
                Err(err) => break Err(err),
            }
        };
        self.maintenance_pending.store(false, SeqCst);
        res
    }
}

// state
impl Range {
    pub fn to_latest_revision(&self) -> i64 {
        self.latest_revision.load(SeqCst)
    }

    pub fn observe_revision(&self, revision: i64) {
        self.latest_revision.fetch_max(revision, SeqCst);
    }

    pub fn set_transfer(&self, info: TransferInfo) -> Result<()> {
        let mut inner = self.write_inner()?;
        if inner.transfer.is_some() {
            err_at!(InvalidInput, msg: "{} transfer already in progress", self.to_name())?
        }
        inner.transfer = Some(info);
        Ok(())
    }

    pub fn to_transfer(&self) -> Result<Option<TransferInfo>> {
        Ok(self.read_inner()?.transfer.clone())
    }

    pub fn clear_transfer(&self) -> Result<Option<TransferInfo>> {
        Ok(self.write_inner()?.transfer.take())
    }

    /// Mark range as unusable for updates, typically after an
    /// unrecoverable commit log failure.
    pub fn mark_unavailable(&self, err: &Error) -> Result<()> {
        let mut inner = self.write_inner()?;
        if inner.error.is_none() {
            error!(target: "rangesrv", "{}, marked unavailable {}", self.to_name(), err);
            let msg = format!("{} {}", self.to_name(), err.to_message());
            inner.error = Some(Error::Unavailable(String::new(), msg));
        }
        Ok(())
    }

    pub fn to_error(&self) -> Result<Option<Error>> {
        Ok(self.read_inner()?.error.clone())
    }

    pub fn set_relinquish(&self) {
        self.relinquish.store(true, SeqCst)
    }

    pub fn is_relinquishing(&self) -> bool {
        self.relinquish.load(SeqCst)
    }

    pub fn cache_footprint(&self) -> Result<usize> {
        Ok(self.read_inner()?.cache_footprint)
    }

    pub fn store_count(&self) -> Result<usize> {
        Ok(self.read_inner()?.stores.len())
    }

    /// Total footprint of cache and stores.
    pub fn footprint(&self) -> Result<usize> {
        let inner = self.read_inner()?;
        let n: usize = inner.stores.iter().map(|s| s.footprint()).sum();
        Ok(n + inner.cache_footprint)
    }

    /// Return oldest revision not yet persisted in a cell store, commit
    /// log fragments older than this are not needed for this range.
    pub fn to_earliest_cached_revision(&self) -> Result<i64> {
        Ok(self.read_inner()?.earliest_cached_revision)
    }

    /// Return (cells-written, bytes-written).
    pub fn to_write_stats(&self) -> (u64, u64) {
        (self.n_cells_written.load(SeqCst), self.n_bytes_written.load(SeqCst))
    }
}

// data path
impl Range {
    /// Add serialized mutations in `buf` to the cell cache, all or none.
    /// With `replay`, mutations already captured in a cell store or in
    /// the cache are skipped, so replaying the same log twice is
    /// harmless. Return the number of cells added.
    pub fn add_mutations(&self, buf: &[u8], replay: bool) -> Result<usize> {
        let mut cells = vec![];
        for item in Mutations::new(buf) {
            let m = item?;
            if m.key.revision.is_none() {
                err_at!(DecodeFail, msg: "{} mutation without revision {:?}", self, m.key)?
            }
            cells.push(Cell::new(CellKey::from(&m.key), m.value.to_vec()));
        }

        let mut inner = self.write_inner()?;
        let stored_revision = inner
            .stores
            .iter()
            .map(|s| s.to_revision())
            .max()
            .unwrap_or(REVISION_NULL);

        let mut n = 0;
        for cell in cells.into_iter() {
            let revision = cell.key.revision;
            if replay && (revision <= stored_revision || inner.cache.contains_key(&cell.key)) {
                continue;
            }
            inner.cache_footprint += cell.footprint();
            inner.earliest_cached_revision = match inner.earliest_cached_revision {
                REVISION_NULL => revision,
                rev => std::cmp::min(rev, revision),
            };
            self.latest_revision.fetch_max(revision, SeqCst);
            inner.cache.insert(cell.key, cell.value);
            n += 1;
        }

        self.n_cells_written.fetch_add(n as u64, SeqCst);
        self.n_bytes_written.fetch_add(buf.len() as u64, SeqCst);
        Ok(n)
    }

    /// Return cells matching `spec`, with delete markers applied.
    pub fn scan(&self, spec: &ScanSpec) -> Result<Vec<Cell>> {
        let _entered = self.scan_barrier.scoped_enter()?;

        let range_spec = self.to_spec()?;
        let cells = self.to_merged_cells(|row| {
            range_spec.contains(row)
                && row >= spec.start_row.as_slice()
                && (spec.end_row.is_empty() || row <= spec.end_row.as_slice())
        })?;
        let cells: Vec<Cell> = cells
            .into_iter()
            .filter(|c| {
                let family = c.key.family as u8;
                spec.families.is_empty() || family == 0 || spec.families.contains(&family)
            })
            .collect();

        let revision = match spec.revision {
            REVISION_NULL => i64::MAX,
            revision => revision,
        };
        let mut cells = resolve(cells, revision, spec.max_versions);
        if spec.cell_limit > 0 {
            cells.truncate(spec.cell_limit as usize);
        }
        Ok(cells)
    }

    // Merge stores and cache cells whose row matches `filter`, newest
    // copy of a key wins.
    fn to_merged_cells<F>(&self, filter: F) -> Result<Vec<Cell>>
    where
        F: Fn(&[u8]) -> bool,
    {
        let inner = self.read_inner()?;

        let mut merged: BTreeMap<CellKey, Vec<u8>> = BTreeMap::new();
        for store in inner.stores.iter() {
            for cell in store.as_cells().iter().filter(|c| filter(&c.key.row)) {
                merged.insert(cell.key.clone(), cell.value.clone());
            }
        }
        for (key, value) in inner.cache.iter().filter(|(k, _)| filter(&k.row)) {
            merged.insert(key.clone(), value.clone());
        }
        Ok(merged.into_iter().map(|(k, v)| Cell::new(k, v)).collect())
    }

    fn to_all_cells(&self) -> Result<Vec<Cell>> {
        self.to_merged_cells(|_| true)
    }

    /// Pick a row that splits this range into two non-empty halves,
    /// None if the range holds less than two rows.
    pub fn to_split_row(&self) -> Result<Option<Vec<u8>>> {
        let mut rows: Vec<Vec<u8>> = self
            .to_all_cells()?
            .into_iter()
            .map(|c| c.key.row)
            .collect();
        rows.dedup();
        match rows.len() {
            0 | 1 => Ok(None),
            n => Ok(Some(rows.swap_remove((n / 2) - 1))),
        }
    }
}

// maintenance, callers shall hold the guard.
impl Range {
    /// Freeze the cell cache into a new cell store. Return false if the
    /// cache was empty.
    pub fn compact_minor(&self) -> Result<bool> {
        let (num, cells, revision) = {
            let mut inner = self.write_inner()?;
            if inner.cache.is_empty() {
                return Ok(false);
            }
            let num = inner.next_store;
            inner.next_store += 1;
            let cells: Vec<Cell> = inner
                .cache
                .iter()
                .map(|(k, v)| Cell::new(k.clone(), v.clone()))
                .collect();
            (num, cells, self.to_latest_revision())
        };

        let n = cells.len();
        let store = CellStore::create(&self.range_dir, num, cells.clone(), revision)?;

        let mut inner = self.write_inner()?;
        for cell in cells.iter() {
            inner.cache.remove(&cell.key);
        }
        inner.cache_footprint = inner.cache.iter().map(|(k, v)| footprint(k, v)).sum();
        inner.earliest_cached_revision = inner
            .cache
            .keys()
            .map(|k| k.revision)
            .min()
            .unwrap_or(REVISION_NULL);
        inner.stores.push(Arc::new(store));

        info!(target: "maintenance", "{}, minor compaction {} cells into store {}", self, n, num);
        Ok(true)
    }

    /// Merge cache and all stores into a single store. With
    /// `drop_deletes`, delete markers and the cells they shadow are
    /// removed, otherwise every cell is retained.
    pub fn compact_major(&self, drop_deletes: bool) -> Result<()> {
        let _held = self.scan_barrier.scoped_put_up()?;

        let cells = self.to_all_cells()?;
        let cells = match drop_deletes {
            true => resolve(cells, i64::MAX, 0),
            false => cells,
        };
        let n = cells.len();
        let num = self.replace_stores(cells)?;

        info!(
            target: "maintenance",
            "{}, major compaction {} cells into store {:?} drop_deletes:{}",
            self, n, num, drop_deletes
        );
        Ok(())
    }

    /// Shrink range to `(split_row, end_row]`, return the cells that fall
    /// out of the new boundary.
    pub fn shrink(&self, split_row: &[u8]) -> Result<Vec<Cell>> {
        let _held = self.scan_barrier.scoped_put_up()?;

        let (low, high): (Vec<Cell>, Vec<Cell>) = self
            .to_all_cells()?
            .into_iter()
            .partition(|c| c.key.row.as_slice() <= split_row);
        self.replace_stores(high)?;

        let mut spec = err_at!(Fatal, self.spec.write())?;
        spec.start_row = split_row.to_vec();
        info!(target: "maintenance", "{}, shrunk, moved {} cells out", self.table.id, low.len());
        Ok(low)
    }

    // Replace all stores and cache with a single store holding `cells`.
    fn replace_stores(&self, cells: Vec<Cell>) -> Result<Option<u32>> {
        let num = {
            let mut inner = self.write_inner()?;
            let num = inner.next_store;
            inner.next_store += 1;
            num
        };
        let revision = self.to_latest_revision();
        let store = match cells.is_empty() {
            true => None,
            false => Some(Arc::new(CellStore::create(&self.range_dir, num, cells, revision)?)),
        };

        let old_stores = {
            let mut inner = self.write_inner()?;
            inner.cache.clear();
            inner.cache_footprint = 0;
            inner.earliest_cached_revision = REVISION_NULL;
            let old = std::mem::take(&mut inner.stores);
            inner.stores.extend(store.iter().cloned());
            old
        };
        for store in old_stores.iter() {
            store.remove()?;
        }
        Ok(store.map(|s| s.to_num()))
    }

    /// Remove all files held by this range.
    pub fn remove_files(&self) -> Result<()> {
        let mut inner = self.write_inner()?;
        inner.cache.clear();
        inner.stores.clear();
        match fs::remove_dir_all(&self.range_dir) {
            Ok(_) => (),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => err_at!(IOError, Err(err), "{:?}", self.range_dir)?,
        }
        debug!(target: "maintenance", "{}, removed {:?}", self, self.range_dir);
        Ok(())
    }
}

fn footprint(key: &CellKey, value: &[u8]) -> usize {
    key.row.len() + key.qualifier.len() + value.len() + 32
}

/// Apply delete markers to sorted `cells` and return visible cells with
/// revision at or below `revision`. With `max_versions` > 0, only that many
/// versions per column are returned.
pub(crate) fn resolve(cells: Vec<Cell>, revision: i64, max_versions: u32) -> Vec<Cell> {
    let mut out = vec![];
    let mut row_cells: Vec<Cell> = vec![];

    let mut iter = cells.into_iter().filter(|c| c.key.revision <= revision).peekable();
    while let Some(cell) = iter.next() {
        row_cells.push(cell);
        let last = match iter.peek() {
            Some(next) => next.key.row != row_cells[0].key.row,
            None => true,
        };
        if last {
            resolve_row(std::mem::take(&mut row_cells), max_versions, &mut out)
        }
    }
    out
}

fn resolve_row(cells: Vec<Cell>, max_versions: u32, out: &mut Vec<Cell>) {
    let mut row_ts: Option<i64> = None;
    let mut family_ts: HashMap<u32, i64> = HashMap::new();
    let mut cell_ts: HashMap<(u32, Vec<u8>), i64> = HashMap::new();
    let mut versions: HashSet<(u32, Vec<u8>, i64)> = HashSet::new();

    let max = |a: Option<&i64>, ts: i64| a.map(|a| std::cmp::max(*a, ts)).unwrap_or(ts);
    for cell in cells.iter() {
        let (family, ts) = (cell.key.family, cell.key.timestamp);
        match cell.key.to_flag() {
            Ok(Flag::DeleteRow) => row_ts = Some(max(row_ts.as_ref(), ts)),
            Ok(Flag::DeleteColumnFamily) => {
                family_ts.insert(family, max(family_ts.get(&family), ts));
            }
            Ok(Flag::DeleteCell) => {
                let k = (family, cell.key.qualifier.clone());
                let ts = max(cell_ts.get(&k), ts);
                cell_ts.insert(k, ts);
            }
            Ok(Flag::DeleteCellVersion) => {
                versions.insert((family, cell.key.qualifier.clone(), ts));
            }
            Ok(Flag::Insert) | Err(_) => (),
        }
    }

    let mut counts: HashMap<(u32, Vec<u8>), u32> = HashMap::new();
    for cell in cells.into_iter().filter(|c| !c.key.is_delete()) {
        let (family, ts) = (cell.key.family, cell.key.timestamp);
        let column = (family, cell.key.qualifier.clone());
        let deleted = row_ts.map(|t| ts <= t).unwrap_or(false)
            || family_ts.get(&family).map(|t| ts <= *t).unwrap_or(false)
            || cell_ts.get(&column).map(|t| ts <= *t).unwrap_or(false)
            || versions.contains(&(family, column.1.clone(), ts));
        if deleted {
            continue;
        }
        if max_versions > 0 {
            let count = counts.entry(column).or_insert(0);
            *count += 1;
            if *count > max_versions {
                continue;
            }
        }
        out.push(cell)
    }
}
