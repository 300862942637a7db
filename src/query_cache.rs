//! Module implement the query cache for single row scans.
//!
//! Entries are keyed by a 128-bit digest over the table identity and the
//! serialized scan spec. Memory accounting charges every entry its result
//! size, its row and a fixed [ENTRY_OVERHEAD]. When full, least recently
//! used entries are evicted to make room.

use log::info;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    hash::Hasher,
    sync::Mutex,
};

use crate::{hash::CityHasher, key::Cell, scan::ScanSpec, table::TableIdentifier, Result};

/// Memory charged for each entry, in addition to row and result.
pub const ENTRY_OVERHEAD: usize = 64;

/// Statistics for [QueryCache].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub max_memory: usize,
    pub avail_memory: usize,
    pub entries: usize,
    pub lookups: u64,
    pub hits: u64,
    pub inserts: u64,
    pub invalidates: u64,
}

struct Entry {
    table: String,
    row: Vec<u8>,
    families: Vec<u8>,
    cells: Vec<Cell>,
    length: usize,
    tick: u64,
}

struct Inner {
    entries: HashMap<u128, Entry>,
    // access order, oldest first.
    lru: BTreeMap<u64, u128>,
    rows: HashMap<(String, Vec<u8>), HashSet<u128>>,
    tick: u64,
    stats: Stats,
}

/// LRU cache of single row scan results, bounded by memory.
pub struct QueryCache {
    inner: Mutex<Inner>,
}

impl QueryCache {
    pub fn new(max_memory: usize) -> QueryCache {
        let stats = Stats {
            max_memory,
            avail_memory: max_memory,
            ..Stats::default()
        };
        QueryCache {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                lru: BTreeMap::new(),
                rows: HashMap::new(),
                tick: 0,
                stats,
            }),
        }
    }

    /// Compute cache key for scanning `spec` over `table`.
    pub fn to_key(table: &TableIdentifier, spec: &ScanSpec) -> Result<u128> {
        let mut hasher = CityHasher::new();
        hasher.write(table.id.as_bytes());
        hasher.write(&table.generation.to_le_bytes());
        hasher.write(&spec.to_bytes()?);
        Ok(hasher.to_digest())
    }

    /// Cache `cells` resulting from a scan of `row`. Return false if the
    /// result can't fit in the cache.
    pub fn insert(
        &self,
        key: u128,
        table: &str,
        row: &[u8],
        families: &[u8],
        cells: Vec<Cell>,
    ) -> Result<bool> {
        let result_length: usize = cells.iter().map(|c| c.footprint()).sum();
        let length = result_length + row.len() + ENTRY_OVERHEAD;

        let mut inner = err_at!(Fatal, self.inner.lock())?;
        if length > inner.stats.max_memory {
            return Ok(false);
        }
        inner.remove(&key);
        while inner.stats.avail_memory < length {
            let oldest = inner.lru.values().next().cloned();
            match oldest {
                Some(key) => inner.remove(&key),
                None => break,
            }
        }
        if inner.stats.avail_memory < length {
            return Ok(false);
        }

        inner.tick += 1;
        let tick = inner.tick;
        let entry = Entry {
            table: table.to_string(),
            row: row.to_vec(),
            families: families.to_vec(),
            cells,
            length,
            tick,
        };
        inner.lru.insert(tick, key);
        inner
            .rows
            .entry((entry.table.clone(), entry.row.clone()))
            .or_insert_with(HashSet::new)
            .insert(key);
        inner.entries.insert(key, entry);
        inner.stats.avail_memory -= length;
        inner.stats.inserts += 1;
        Ok(true)
    }

    /// Lookup cached result for `key`, hits move the entry to the most
    /// recently used position.
    pub fn lookup(&self, key: u128) -> Result<Option<Vec<Cell>>> {
        let mut inner = err_at!(Fatal, self.inner.lock())?;
        inner.stats.lookups += 1;
        if inner.stats.lookups % 1000 == 0 {
            let rate = (inner.stats.hits as f64) / (inner.stats.lookups as f64) * 100.0;
            info!(target: "rangesrv", "query cache cumulative hit rate {:.2}%", rate);
        }

        inner.tick += 1;
        let tick = inner.tick;
        let old_tick = match inner.entries.get_mut(&key) {
            Some(entry) => std::mem::replace(&mut entry.tick, tick),
            None => return Ok(None),
        };
        inner.lru.remove(&old_tick);
        inner.lru.insert(tick, key);
        inner.stats.hits += 1;
        Ok(inner.entries.get(&key).map(|e| e.cells.clone()))
    }

    /// Invalidate cached results for `row` of `table` that include any
    /// of `families`. An empty family set, on either side, matches all.
    pub fn invalidate(&self, table: &str, row: &[u8], families: &[u8]) -> Result<usize> {
        let mut inner = err_at!(Fatal, self.inner.lock())?;
        let keys: Vec<u128> = match inner.rows.get(&(table.to_string(), row.to_vec())) {
            Some(keys) => keys.iter().cloned().collect(),
            None => return Ok(0),
        };

        let mut n = 0;
        for key in keys.into_iter() {
            let hit = match inner.entries.get(&key) {
                Some(entry) if entry.families.is_empty() || families.is_empty() => true,
                Some(entry) => entry.families.iter().any(|f| families.contains(f)),
                None => false,
            };
            if hit {
                inner.remove(&key);
                n += 1;
            }
        }
        inner.stats.invalidates += n as u64;
        Ok(n)
    }

    pub fn to_stats(&self) -> Result<Stats> {
        let inner = err_at!(Fatal, self.inner.lock())?;
        let mut stats = inner.stats.clone();
        stats.entries = inner.entries.len();
        Ok(stats)
    }
}

impl Inner {
    fn remove(&mut self, key: &u128) {
        if let Some(entry) = self.entries.remove(key) {
            self.lru.remove(&entry.tick);
            let row_key = (entry.table, entry.row);
            let empty = match self.rows.get_mut(&row_key) {
                Some(keys) => {
                    keys.remove(key);
                    keys.is_empty()
                }
                None => false,
            };
            if empty {
                self.rows.remove(&row_key);
            }
            self.stats.avail_memory += entry.length;
        }
    }
}

#[cfg(test)]
#[path = "query_cache_test.rs"]
mod query_cache_test;
