//! Module implement scan specifications and the scanner table.
//!
//! A scan over a range is materialized when the scanner is created, cells
//! are then handed out in blocks of configured size by successive
//! `fetch_scanblock` calls.

use cbordata::Cborize;
use log::debug;

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU32, Ordering::SeqCst},
        Mutex,
    },
    time,
};

use crate::{
    clock::REVISION_NULL,
    key::Cell,
    table::{RangeSpec, TableIdentifier},
    util, Result,
};

const SCAN_SPEC_VER: u32 = 0x00040001;

/// Scan request over a range.
#[derive(Clone, Debug, PartialEq, Eq, Cborize)]
pub struct ScanSpec {
    /// First row to return, inclusive, empty for no lower bound.
    pub start_row: Vec<u8>,
    /// Last row to return, inclusive, empty for no upper bound.
    pub end_row: Vec<u8>,
    /// Column families to return, empty for all.
    pub families: Vec<u8>,
    /// Snapshot revision, REVISION_NULL for latest.
    pub revision: i64,
    /// Versions per column, 0 for all.
    pub max_versions: u32,
    /// Stop after this many cells, 0 for no limit.
    pub cell_limit: u32,
}

impl ScanSpec {
    const ID: u32 = SCAN_SPEC_VER;

    /// Scan all versions of all columns in `row`.
    pub fn new_row(row: &[u8]) -> ScanSpec {
        ScanSpec {
            start_row: row.to_vec(),
            end_row: row.to_vec(),
            ..ScanSpec::default()
        }
    }

    /// Only single row scans are served from, and saved into, query cache.
    pub fn is_single_row(&self) -> bool {
        !self.start_row.is_empty() && self.start_row == self.end_row
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        util::into_cbor_bytes(self.clone())
    }
}

impl Default for ScanSpec {
    fn default() -> ScanSpec {
        ScanSpec {
            start_row: vec![],
            end_row: vec![],
            families: vec![],
            revision: REVISION_NULL,
            max_versions: 0,
            cell_limit: 0,
        }
    }
}

/// Block of cells returned by create_scanner and fetch_scanblock.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanBlock {
    /// Scanner id to fetch more cells, valid only when `more` is true.
    pub scanner_id: u32,
    pub cells: Vec<Cell>,
    pub more: bool,
}

struct Scanner {
    table: TableIdentifier,
    range: RangeSpec,
    cells: VecDeque<Cell>,
    touched: time::Instant,
}

/// Table of outstanding scanners.
pub struct ScannerMap {
    next_id: AtomicU32,
    block_size: usize,
    scanners: Mutex<HashMap<u32, Scanner>>,
}

impl ScannerMap {
    pub fn new(block_size: usize) -> ScannerMap {
        ScannerMap {
            next_id: AtomicU32::new(1),
            block_size: std::cmp::max(block_size, 1),
            scanners: Mutex::new(HashMap::new()),
        }
    }

    /// Register a scanner over `cells`, and return the first block. When
    /// all cells fit in the first block no scanner is retained.
    pub fn create(
        &self,
        table: TableIdentifier,
        range: RangeSpec,
        cells: Vec<Cell>,
    ) -> Result<ScanBlock> {
        let mut scanner = Scanner {
            table,
            range,
            cells: cells.into(),
            touched: time::Instant::now(),
        };
        let block = self.next_block(&mut scanner);
        match block.is_empty() || scanner.cells.is_empty() {
            true => Ok(ScanBlock {
                scanner_id: 0,
                cells: block,
                more: false,
            }),
            false => {
                let id = self.next_id.fetch_add(1, SeqCst);
                debug!(
                    target: "rangesrv",
                    "scanner {} {}{} pending:{}",
                    id, scanner.table, scanner.range, scanner.cells.len()
                );
                err_at!(Fatal, self.scanners.lock())?.insert(id, scanner);
                Ok(ScanBlock {
                    scanner_id: id,
                    cells: block,
                    more: true,
                })
            }
        }
    }

    /// Return the next block for scanner `id`. The scanner is removed
    /// after its last block.
    pub fn fetch(&self, id: u32) -> Result<ScanBlock> {
        let mut scanners = err_at!(Fatal, self.scanners.lock())?;
        let (cells, more) = match scanners.get_mut(&id) {
            Some(scanner) => {
                scanner.touched = time::Instant::now();
                let cells = self.next_block(scanner);
                (cells, !scanner.cells.is_empty())
            }
            None => err_at!(InvalidScannerId, msg: "scanner {}", id)?,
        };
        if !more {
            scanners.remove(&id);
        }
        Ok(ScanBlock {
            scanner_id: id,
            cells,
            more,
        })
    }

    pub fn destroy(&self, id: u32) -> Result<()> {
        match err_at!(Fatal, self.scanners.lock())?.remove(&id) {
            Some(_) => Ok(()),
            None => err_at!(InvalidScannerId, msg: "scanner {}", id),
        }
    }

    /// Remove scanners idle for longer than `ttl`, return the number of
    /// scanners removed.
    pub fn purge_idle(&self, ttl: time::Duration) -> Result<usize> {
        let mut scanners = err_at!(Fatal, self.scanners.lock())?;
        let n = scanners.len();
        scanners.retain(|_, s| s.touched.elapsed() < ttl);
        Ok(n - scanners.len())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(err_at!(Fatal, self.scanners.lock())?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // At least one cell, and then cells while the block is within size.
    fn next_block(&self, scanner: &mut Scanner) -> Vec<Cell> {
        let mut block = vec![];
        let mut size = 0;
        while let Some(cell) = scanner.cells.pop_front() {
            size += cell.footprint();
            block.push(cell);
            if size >= self.block_size {
                break;
            }
        }
        block
    }
}

#[cfg(test)]
#[path = "scan_test.rs"]
mod scan_test;
