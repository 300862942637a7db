use cbordata::Cborize;
use log::debug;

use std::{fs, path};

use crate::{key::Cell, util, write_file, Result};

const STORE_VER: u32 = 0x00030001;

// On-disk image of a cell store.
#[derive(Clone, Debug, Cborize)]
struct StoreFile {
    revision: i64,
    cells: Vec<Cell>,
}

impl StoreFile {
    const ID: u32 = STORE_VER;
}

/// Immutable, sorted run of cells persisted as a single cbor file. Cell
/// stores are produced by compactions and read by scans.
#[derive(Debug)]
pub struct CellStore {
    loc: path::PathBuf,
    num: u32,
    revision: i64,
    cells: Vec<Cell>,
    footprint: usize,
}

impl CellStore {
    /// Persist sorted `cells` as store number `num` under `dir`. `revision`
    /// is the latest revision captured in this store.
    pub fn create(dir: &path::Path, num: u32, cells: Vec<Cell>, revision: i64) -> Result<CellStore> {
        err_at!(IOError, fs::create_dir_all(dir), "{:?}", dir)?;

        let loc = dir.join(num.to_string());
        let tmp = dir.join(format!("{}.tmp", num));

        let store = StoreFile { revision, cells };
        let data = util::into_cbor_bytes(store)?;
        {
            let mut file = err_at!(IOError, fs::File::create(&tmp), "{:?}", tmp)?;
            write_file!(file, &data, &tmp, "cell store")?;
            err_at!(IOError, file.sync_all())?;
        }
        err_at!(IOError, fs::rename(&tmp, &loc), "{:?}", loc)?;

        debug!(target: "maintenance", "{:?}, created cell store {} bytes", loc, data.len());
        Self::open(&loc, num)
    }

    pub fn open(loc: &path::Path, num: u32) -> Result<CellStore> {
        let data = err_at!(IOError, fs::read(loc), "{:?}", loc)?;
        let (store, _) = util::from_cbor_bytes::<StoreFile>(&data)?;
        let footprint = store.cells.iter().map(|c| c.footprint()).sum();
        Ok(CellStore {
            loc: loc.to_path_buf(),
            num,
            revision: store.revision,
            cells: store.cells,
            footprint,
        })
    }

    /// Open all cell stores under `dir`, in creation order.
    pub fn open_dir(dir: &path::Path) -> Result<Vec<CellStore>> {
        let mut stores = vec![];
        if dir.is_dir() {
            for (num, loc) in util::files::numbered_files(dir)?.into_iter() {
                stores.push(Self::open(&loc, num)?)
            }
        }
        Ok(stores)
    }

    pub fn to_location(&self) -> path::PathBuf {
        self.loc.clone()
    }

    pub fn to_num(&self) -> u32 {
        self.num
    }

    pub fn to_revision(&self) -> i64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn footprint(&self) -> usize {
        self.footprint
    }

    pub fn as_cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Return cells whose row falls in `(start_row, end_row]`.
    pub fn to_cells(&self, start_row: &[u8], end_row: &[u8]) -> Vec<Cell> {
        let from = self.cells.partition_point(|c| c.key.row.as_slice() <= start_row);
        self.cells[from..]
            .iter()
            .take_while(|c| c.key.row.as_slice() <= end_row)
            .cloned()
            .collect()
    }

    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.loc) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => err_at!(IOError, Err(err), "{:?}", self.loc),
        }
    }
}
