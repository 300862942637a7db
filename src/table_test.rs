use std::sync::Arc;

use super::*;
use crate::Error;

fn new_range(dir: &std::path::Path, id: &str, start: &[u8], end: &[u8]) -> Arc<Range> {
    let table = TableIdentifier::new(id, 1);
    let range_dir = dir.join(format!("{}", crate::hash::hash16(end)));
    Arc::new(Range::new(table, RangeSpec::new(start, end), &range_dir).unwrap())
}

#[test]
fn test_table_identifier() {
    let tid = TableIdentifier::new("2/7", 3);
    assert!(tid.is_user());
    assert!(!tid.is_system());
    assert!(TableIdentifier::new(METADATA_ID, 1).is_metadata());
    assert!(TableIdentifier::new("0/1", 1).is_system());

    let mut buf = vec![];
    let n = tid.encode(&mut buf).unwrap();
    assert_eq!(n, buf.len());
    assert_eq!(n, tid.encoded_length());
    let mut rd = buf.as_slice();
    assert_eq!(TableIdentifier::decode(&mut rd).unwrap(), tid);
    assert!(rd.is_empty());
}

#[test]
fn test_range_spec() {
    let spec = RangeSpec::new(b"b", b"m");
    assert!(!spec.contains(b"b"));
    assert!(spec.contains(b"ba"));
    assert!(spec.contains(b"m"));
    assert!(!spec.contains(b"ma"));

    let full = RangeSpec::full();
    assert!(full.contains(b"\x01"));
    assert!(full.contains(END_ROW_MARKER));
    assert!(!full.contains(b""));
}

#[test]
fn test_schema() {
    let mut schema = Schema::new(1);
    assert_eq!(schema.add_family("a", 0).unwrap(), 1);
    assert_eq!(schema.add_family("b", 3).unwrap(), 2);
    assert!(schema.add_family("a", 0).is_err());
    assert_eq!(schema.to_family_id("b"), Some(2));
    assert_eq!(schema.to_family(2).unwrap().max_versions, 3);
    assert!(schema.to_family(9).is_none());
}

#[test]
fn test_table_info() {
    let dir = std::env::temp_dir().join("test_table_info");
    std::fs::remove_dir_all(&dir).ok();

    let table = TableInfo::new("2/1", Schema::new(1));
    table.add_range(new_range(&dir, "2/1", b"", b"g")).unwrap();
    table.add_range(new_range(&dir, "2/1", b"g", b"p")).unwrap();
    table.add_range(new_range(&dir, "2/1", b"p", END_ROW_MARKER)).unwrap();
    assert_eq!(table.len().unwrap(), 3);
    assert!(table.add_range(new_range(&dir, "2/1", b"a", b"g")).is_err());

    for (row, end) in vec![("a", "g"), ("g", "g"), ("h", "p"), ("p", "p")].into_iter() {
        let (_, spec) = table.find_containing_range(row.as_bytes()).unwrap().unwrap();
        assert_eq!(spec.end_row, end.as_bytes().to_vec(), "{:?}", row);
    }
    let (_, spec) = table.find_containing_range(b"zz").unwrap().unwrap();
    assert_eq!(spec.end_row, END_ROW_MARKER.to_vec());

    let spec = RangeSpec::new(b"g", b"p");
    assert!(table.get_range(&spec).unwrap().is_some());
    assert!(table.get_range(&RangeSpec::new(b"h", b"p")).unwrap().is_none());

    table.remove_range(b"p").unwrap().unwrap();
    assert!(table.find_containing_range(b"h").unwrap().is_none());

    // schema never goes backward.
    table.update_schema(Schema::new(3)).unwrap();
    match table.update_schema(Schema::new(2)) {
        Err(Error::GenerationMismatch(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    assert_eq!(table.to_identifier().unwrap().generation, 3);

    assert!(!table.is_maintenance_disabled());
    table.set_maintenance_disabled(true);
    assert!(table.is_maintenance_disabled());
}

#[test]
fn test_table_info_map() {
    let dir = std::env::temp_dir().join("test_table_info_map");
    std::fs::remove_dir_all(&dir).ok();

    let tables = TableInfoMap::new();
    let a = tables.get_or_insert("2/2", Schema::new(1)).unwrap();
    let b = tables.get_or_insert("2/2", Schema::new(5)).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(b.to_schema().unwrap().generation, 1);

    tables.get_or_insert("2/1", Schema::new(1)).unwrap();
    let ids: Vec<String> = tables.to_tables().unwrap().iter().map(|t| t.to_id()).collect();
    assert_eq!(ids, vec!["2/1".to_string(), "2/2".to_string()]);

    a.add_range(new_range(&dir, "2/2", b"", END_ROW_MARKER)).unwrap();
    assert_eq!(tables.to_ranges().unwrap().len(), 1);

    assert!(tables.remove("2/2").unwrap().is_some());
    assert!(tables.get("2/2").unwrap().is_none());
}
