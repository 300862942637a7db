//! Module implement table identity, schema and the live table map.
//!
//! Ranges of a table are kept sorted by their end row. Range boundaries
//! are start-exclusive and end-inclusive, that is, a range `(s, e]` holds
//! all rows `r` such that `s < r <= e`. Empty start row stands for the
//! beginning of the key space and [END_ROW_MARKER] for its end.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    ops::Bound,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc, RwLock,
    },
};

use crate::{range::Range, util, Result};

/// End row of the last range in a table.
pub const END_ROW_MARKER: &[u8] = b"\xff\xff";

/// Identifier of the metadata table.
pub const METADATA_ID: &str = "0/0";

/// Table id along with its schema generation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableIdentifier {
    pub id: String,
    pub generation: u32,
}

impl fmt::Display for TableIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.generation)
    }
}

impl TableIdentifier {
    pub fn new(id: &str, generation: u32) -> TableIdentifier {
        TableIdentifier {
            id: id.to_string(),
            generation,
        }
    }

    /// System tables live under namespace `0/`.
    pub fn is_system(&self) -> bool {
        self.id.starts_with("0/")
    }

    pub fn is_metadata(&self) -> bool {
        self.id == METADATA_ID
    }

    pub fn is_user(&self) -> bool {
        !self.is_system()
    }

    pub fn encoded_length(&self) -> usize {
        let n = self.id.len();
        util::encoded_length_vi32(n as u32) + n + 4
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<usize> {
        let m = buf.len();
        util::encode_vstr(buf, &self.id)?;
        util::encode_u32(buf, self.generation);
        Ok(buf.len() - m)
    }

    pub fn decode(buf: &mut &[u8]) -> Result<TableIdentifier> {
        let id = util::decode_vstr(buf)?;
        let generation = util::decode_u32(buf)?;
        Ok(TableIdentifier { id, generation })
    }
}

/// Row interval of a range, start-exclusive and end-inclusive.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RangeSpec {
    pub start_row: Vec<u8>,
    pub end_row: Vec<u8>,
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{}..{}]",
            String::from_utf8_lossy(&self.start_row),
            String::from_utf8_lossy(&self.end_row)
        )
    }
}

impl RangeSpec {
    pub fn new(start_row: &[u8], end_row: &[u8]) -> RangeSpec {
        RangeSpec {
            start_row: start_row.to_vec(),
            end_row: end_row.to_vec(),
        }
    }

    /// Spec covering the entire key space.
    pub fn full() -> RangeSpec {
        RangeSpec::new(b"", END_ROW_MARKER)
    }

    pub fn contains(&self, row: &[u8]) -> bool {
        row > self.start_row.as_slice() && row <= self.end_row.as_slice()
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<usize> {
        let m = buf.len();
        util::encode_bytes(buf, &self.start_row)?;
        util::encode_bytes(buf, &self.end_row)?;
        Ok(buf.len() - m)
    }

    pub fn decode(buf: &mut &[u8]) -> Result<RangeSpec> {
        let start_row = util::decode_bytes(buf)?.to_vec();
        let end_row = util::decode_bytes(buf)?.to_vec();
        Ok(RangeSpec { start_row, end_row })
    }
}

/// Column family within a schema. Family code 0 is reserved for
/// row deletes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnFamily {
    pub id: u8,
    pub name: String,
    /// Maximum number of versions returned by scans, 0 means all.
    pub max_versions: u32,
    pub deleted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    pub generation: u32,
    pub families: Vec<ColumnFamily>,
}

impl Schema {
    pub fn new(generation: u32) -> Schema {
        Schema {
            generation,
            families: vec![],
        }
    }

    /// Add column family `name`, return its code.
    pub fn add_family(&mut self, name: &str, max_versions: u32) -> Result<u8> {
        if self.to_family_id(name).is_some() {
            err_at!(InvalidInput, msg: "duplicate column family {}", name)?
        }
        let id = match self.families.iter().map(|cf| cf.id).max() {
            Some(255) => err_at!(InvalidInput, msg: "too many column families")?,
            Some(id) => id + 1,
            None => 1,
        };
        self.families.push(ColumnFamily {
            id,
            name: name.to_string(),
            max_versions,
            deleted: false,
        });
        Ok(id)
    }

    /// Return live column family for `id`.
    pub fn to_family(&self, id: u8) -> Option<&ColumnFamily> {
        self.families.iter().find(|cf| cf.id == id && !cf.deleted)
    }

    pub fn to_family_id(&self, name: &str) -> Option<u8> {
        self.families
            .iter()
            .find(|cf| cf.name == name && !cf.deleted)
            .map(|cf| cf.id)
    }
}

/// Live table, its schema and the set of ranges held by this server.
pub struct TableInfo {
    id: String,
    schema: RwLock<Arc<Schema>>,
    ranges: RwLock<BTreeMap<Vec<u8>, Arc<Range>>>,
    maintenance_disabled: AtomicBool,
}

impl TableInfo {
    pub fn new(id: &str, schema: Schema) -> TableInfo {
        TableInfo {
            id: id.to_string(),
            schema: RwLock::new(Arc::new(schema)),
            ranges: RwLock::new(BTreeMap::new()),
            maintenance_disabled: AtomicBool::new(false),
        }
    }

    pub fn to_id(&self) -> String {
        self.id.clone()
    }

    pub fn to_identifier(&self) -> Result<TableIdentifier> {
        let generation = self.to_schema()?.generation;
        Ok(TableIdentifier::new(&self.id, generation))
    }

    pub fn to_schema(&self) -> Result<Arc<Schema>> {
        Ok(Arc::clone(&*err_at!(Fatal, self.schema.read())?))
    }

    /// Install a newer schema, generations never go backward.
    pub fn update_schema(&self, schema: Schema) -> Result<()> {
        let mut cur = err_at!(Fatal, self.schema.write())?;
        if schema.generation < cur.generation {
            err_at!(
                GenerationMismatch,
                msg: "table {} schema generation {} < {}", self.id, schema.generation, cur.generation
            )?
        }
        *cur = Arc::new(schema);
        Ok(())
    }

    /// Add `range`, fail if a range with the same end row is present.
    pub fn add_range(&self, range: Arc<Range>) -> Result<()> {
        let end_row = range.to_spec()?.end_row;
        let mut ranges = err_at!(Fatal, self.ranges.write())?;
        if ranges.contains_key(&end_row) {
            err_at!(
                InvalidInput,
                msg: "table {} range {} already loaded", self.id, range.to_name()
            )?
        }
        ranges.insert(end_row, range);
        Ok(())
    }

    pub fn remove_range(&self, end_row: &[u8]) -> Result<Option<Arc<Range>>> {
        Ok(err_at!(Fatal, self.ranges.write())?.remove(end_row))
    }

    pub fn get_range(&self, spec: &RangeSpec) -> Result<Option<Arc<Range>>> {
        let ranges = err_at!(Fatal, self.ranges.read())?;
        match ranges.get(&spec.end_row) {
            Some(range) if range.to_spec()?.start_row == spec.start_row => {
                Ok(Some(Arc::clone(range)))
            }
            _ => Ok(None),
        }
    }

    /// Locate the range holding `row`, along with its boundaries as of
    /// this lookup.
    pub fn find_containing_range(&self, row: &[u8]) -> Result<Option<(Arc<Range>, RangeSpec)>> {
        let ranges = err_at!(Fatal, self.ranges.read())?;
        let bound = (Bound::Included(row.to_vec()), Bound::Unbounded);
        match ranges.range::<Vec<u8>, _>(bound).next() {
            Some((_, range)) => {
                let spec = range.to_spec()?;
                if spec.contains(row) {
                    Ok(Some((Arc::clone(range), spec)))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    pub fn to_ranges(&self) -> Result<Vec<Arc<Range>>> {
        let ranges = err_at!(Fatal, self.ranges.read())?;
        Ok(ranges.values().cloned().collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(err_at!(Fatal, self.ranges.read())?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn set_maintenance_disabled(&self, disabled: bool) {
        self.maintenance_disabled.store(disabled, SeqCst)
    }

    pub fn is_maintenance_disabled(&self) -> bool {
        self.maintenance_disabled.load(SeqCst)
    }
}

/// Map of live tables, keyed by table id.
#[derive(Default)]
pub struct TableInfoMap {
    tables: RwLock<HashMap<String, Arc<TableInfo>>>,
}

impl TableInfoMap {
    pub fn new() -> TableInfoMap {
        TableInfoMap::default()
    }

    pub fn get(&self, id: &str) -> Result<Option<Arc<TableInfo>>> {
        Ok(err_at!(Fatal, self.tables.read())?.get(id).cloned())
    }

    /// Return table `id`, creating it with `schema` if missing.
    pub fn get_or_insert(&self, id: &str, schema: Schema) -> Result<Arc<TableInfo>> {
        let mut tables = err_at!(Fatal, self.tables.write())?;
        let table = tables
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(TableInfo::new(id, schema)));
        Ok(Arc::clone(table))
    }

    pub fn remove(&self, id: &str) -> Result<Option<Arc<TableInfo>>> {
        Ok(err_at!(Fatal, self.tables.write())?.remove(id))
    }

    pub fn to_tables(&self) -> Result<Vec<Arc<TableInfo>>> {
        let tables = err_at!(Fatal, self.tables.read())?;
        let mut tables: Vec<Arc<TableInfo>> = tables.values().cloned().collect();
        tables.sort_by_key(|t| t.to_id());
        Ok(tables)
    }

    /// Return all ranges across all tables.
    pub fn to_ranges(&self) -> Result<Vec<(Arc<TableInfo>, Arc<Range>)>> {
        let mut items = vec![];
        for table in self.to_tables()?.into_iter() {
            for range in table.to_ranges()?.into_iter() {
                items.push((Arc::clone(&table), range))
            }
        }
        Ok(items)
    }
}

#[cfg(test)]
#[path = "table_test.rs"]
mod table_test;
