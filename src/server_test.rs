use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{path, time::Duration};

use super::*;
use crate::{
    commit_log::CommitLog,
    key::{encode_mutation, Key},
    recovery::transfer::{to_phantom_log_dir, TransferLogNamer},
    update::encode_commit_header,
    mutator::ScatterBuffer,
    recovery::params::{PhantomCommitComplete, PhantomPrepareComplete},
    table::END_ROW_MARKER,
};

struct NullMaster;

impl MasterClient for NullMaster {
    fn phantom_prepare_complete(&self, _params: PhantomPrepareComplete) -> Result<()> {
        Ok(())
    }

    fn phantom_commit_complete(&self, _params: PhantomCommitComplete) -> Result<()> {
        Ok(())
    }
}

fn test_dir(name: &str) -> path::PathBuf {
    let dir = std::env::temp_dir().join(name);
    std::fs::remove_dir_all(&dir).ok();
    dir
}

fn new_config(dir: &path::Path) -> Config {
    let mut config = Config::new(dir);
    config
        .set_commit_interval(Duration::from_millis(2))
        .set_scanner_block_size(64)
        .set_pool_size(2);
    config
}

fn to_table() -> TableIdentifier {
    TableIdentifier::new("2/1", 1)
}

// Server holding table "2/1" with family "cf", and ranges `specs`.
fn new_server(location: &str, config: Config, specs: &[RangeSpec]) -> RangeServer {
    let server = RangeServer::new(location, config, Arc::new(NullMaster)).unwrap();
    let mut schema = Schema::new(1);
    schema.add_family("cf", 0).unwrap();
    server.create_table("2/1", schema).unwrap();
    for spec in specs.iter() {
        server.load_range(&to_table(), spec).unwrap();
    }
    server
}

fn to_buffer(rows: &[String]) -> Vec<u8> {
    let mut buf = vec![];
    for row in rows.iter() {
        let key = Key::insert(row.as_bytes(), 1, b"q");
        encode_mutation(&mut buf, &key, row.as_bytes()).unwrap();
    }
    buf
}

fn to_rows(block: &ScanBlock) -> Vec<String> {
    block
        .cells
        .iter()
        .map(|c| String::from_utf8(c.key.row.clone()).unwrap())
        .collect()
}

// Scan the whole of range `spec`, block by block.
fn scan_all(server: &RangeServer, spec: &RangeSpec) -> Vec<String> {
    let mut block = server
        .create_scanner(&to_table(), spec, &ScanSpec::default())
        .unwrap();
    let mut rows = to_rows(&block);
    while block.more {
        block = server.fetch_scanblock(block.scanner_id).unwrap();
        rows.extend(to_rows(&block));
    }
    rows
}

#[test]
fn test_server_update_scan() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_server_update_scan {}", seed);

    let dir = test_dir("test_server_update_scan");
    let full = RangeSpec::new(b"", END_ROW_MARKER);
    let server = new_server("rs1", new_config(&dir), &[full.clone()]);

    let n = 10 + rng.gen::<usize>() % 100;
    let mut rows: Vec<String> = (0..n).map(|i| format!("row-{:04}", i)).collect();
    for chunk in rows.chunks(7) {
        let resp = server
            .update(to_table(), to_buffer(chunk), chunk.len() as u32, 0)
            .unwrap();
        assert!(resp.is_ok(), "{:?}", resp);
    }
    assert!(server.commit_log_sync(to_table()).unwrap().is_ok());

    rows.sort();
    assert_eq!(scan_all(&server, &full), rows);

    // destroy a scanner half way.
    let block = server
        .create_scanner(&to_table(), &full, &ScanSpec::default())
        .unwrap();
    assert!(block.more && !block.cells.is_empty());
    server.destroy_scanner(block.scanner_id).unwrap();
    match server.fetch_scanblock(block.scanner_id) {
        Err(Error::InvalidScannerId(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    match server.destroy_scanner(block.scanner_id) {
        Err(Error::InvalidScannerId(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    // idle scanners are purged.
    let block = server
        .create_scanner(&to_table(), &full, &ScanSpec::default())
        .unwrap();
    assert!(block.more);
    assert_eq!(server.purge_scanners(Duration::from_secs(3600)).unwrap(), 0);
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(server.purge_scanners(Duration::from_millis(1)).unwrap(), 1);

    // scan errors.
    match server.create_scanner(&TableIdentifier::new("2/2", 1), &full, &ScanSpec::default()) {
        Err(Error::TableNotFound(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    match server.create_scanner(&TableIdentifier::new("2/1", 2), &full, &ScanSpec::default()) {
        Err(Error::GenerationMismatch(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    let partial = RangeSpec::new(b"", b"m");
    match server.create_scanner(&to_table(), &partial, &ScanSpec::default()) {
        Err(Error::RangeNotFound(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    server.close().unwrap();
}

#[test]
fn test_server_query_cache() {
    let dir = test_dir("test_server_query_cache");
    let full = RangeSpec::new(b"", END_ROW_MARKER);
    let server = new_server("rs1", new_config(&dir), &[full.clone()]);
    let rows = vec!["a".to_string(), "b".to_string()];
    assert!(server.update(to_table(), to_buffer(&rows), 2, 0).unwrap().is_ok());

    let spec = ScanSpec::new_row(b"a");
    let block = server.create_scanner(&to_table(), &full, &spec).unwrap();
    assert_eq!(to_rows(&block), vec!["a".to_string()]);
    assert!(!block.more);
    let block = server.create_scanner(&to_table(), &full, &spec).unwrap();
    assert_eq!(to_rows(&block), vec!["a".to_string()]);

    let cache = server.as_context().query_cache.as_ref().unwrap();
    let stats = cache.to_stats().unwrap();
    assert_eq!((stats.lookups, stats.hits, stats.entries), (2, 1, 1));

    // an update to the row invalidates the cached result.
    let key = Key::insert(b"a", 1, b"r");
    let mut buf = vec![];
    encode_mutation(&mut buf, &key, b"new").unwrap();
    assert!(server.update(to_table(), buf, 1, 0).unwrap().is_ok());
    assert_eq!(cache.to_stats().unwrap().entries, 0);

    let block = server.create_scanner(&to_table(), &full, &spec).unwrap();
    assert_eq!(block.cells.len(), 2);
    assert_eq!(block.cells[1].value, b"new".to_vec());

    // multi row scans are not cached.
    let spec = ScanSpec {
        start_row: b"a".to_vec(),
        end_row: b"b".to_vec(),
        ..ScanSpec::default()
    };
    server.create_scanner(&to_table(), &full, &spec).unwrap();
    assert_eq!(cache.to_stats().unwrap().lookups, 3);

    server.close().unwrap();
}

#[test]
fn test_server_query_cache_system() {
    let dir = test_dir("test_server_query_cache_system");
    let server = new_server("rs1", new_config(&dir), &[]);
    let mut schema = Schema::new(1);
    schema.add_family("cf", 0).unwrap();
    server.create_table("0/1", schema).unwrap();

    let table = TableIdentifier::new("0/1", 1);
    let full = RangeSpec::new(b"", END_ROW_MARKER);
    server.load_range(&table, &full).unwrap();
    let rows = vec!["a".to_string()];
    assert!(server.update(table.clone(), to_buffer(&rows), 1, 0).unwrap().is_ok());

    let spec = ScanSpec::new_row(b"a");
    for _ in 0..2 {
        let block = server.create_scanner(&table, &full, &spec).unwrap();
        assert_eq!(to_rows(&block), rows);
    }

    let cache = server.as_context().query_cache.as_ref().unwrap();
    let stats = cache.to_stats().unwrap();
    assert_eq!((stats.lookups, stats.entries), (0, 0));

    server.close().unwrap();
}

#[test]
fn test_server_admin() {
    let dir = test_dir("test_server_admin");
    let full = RangeSpec::new(b"", END_ROW_MARKER);
    let server = new_server("rs1", new_config(&dir), &[full.clone()]);
    // loading again is a no-op.
    server.load_range(&to_table(), &full).unwrap();

    let rows: Vec<String> = ["a", "b", "c", "d", "e", "f"].iter().map(|r| r.to_string()).collect();
    assert!(server.update(to_table(), to_buffer(&rows), 6, 0).unwrap().is_ok());

    server.table_maintenance_disable("2/1").unwrap();
    assert!(server.ctx.tables.get("2/1").unwrap().unwrap().is_maintenance_disabled());
    server.table_maintenance_enable("2/1").unwrap();
    assert!(!server.ctx.tables.get("2/1").unwrap().unwrap().is_maintenance_disabled());
    match server.table_maintenance_disable("2/9") {
        Err(Error::TableNotFound(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    let n = server.compact("2/1", None, MaintenanceFlag::COMPACT_MINOR).unwrap();
    assert_eq!(n, 1);
    let n = server.compact("2/1", Some(&full), MaintenanceFlag::COMPACT_MAJOR).unwrap();
    assert_eq!(n, 1);
    assert_eq!(scan_all(&server, &full), rows);

    let low = server.split("2/1", &full).unwrap().unwrap();
    assert_eq!(low, RangeSpec::new(b"", b"c"));
    let high = RangeSpec::new(b"c", END_ROW_MARKER);
    assert_eq!(scan_all(&server, &low), rows[..3].to_vec());
    assert_eq!(scan_all(&server, &high), rows[3..].to_vec());
    match server.split("2/1", &full) {
        Err(Error::RangeNotFound(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    // readonly mode rejects user updates.
    let state = server.to_state().unwrap().as_ref().clone().set_readonly(true);
    let stale = state.clone();
    let state = server.set_state(state).unwrap();
    assert!(state.readonly);
    match server.set_state(stale) {
        Err(Error::GenerationMismatch(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    let resp = server.update(to_table(), to_buffer(&rows), 6, 0).unwrap();
    assert_eq!(resp.error, code::RANGESERVER_SERVER_IN_READONLY_MODE);
    let state = server.to_state().unwrap().as_ref().clone().set_readonly(false);
    server.set_state(state).unwrap();
    assert!(server.update(to_table(), to_buffer(&rows), 6, 0).unwrap().is_ok());

    let range_dir = server.ctx.to_range_dir("2/1", &low.end_row);
    assert!(range_dir.exists());
    server.drop_table("2/1").unwrap();
    assert!(server.ctx.tables.get("2/1").unwrap().is_none());
    assert!(!range_dir.exists());
    match server.drop_table("2/1") {
        Err(Error::TableNotFound(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    server.close().unwrap();
}

#[test]
fn test_server_restart() {
    let dir = test_dir("test_server_restart");
    let full = RangeSpec::new(b"", END_ROW_MARKER);

    let rows: Vec<String> = (0..20).map(|i| format!("{:02}", i)).collect();
    {
        let server = new_server("rs1", new_config(&dir), &[full.clone()]);
        assert!(server.update(to_table(), to_buffer(&rows), 20, 0).unwrap().is_ok());
        server.close().unwrap();
    }

    let server = new_server("rs1", new_config(&dir), &[full.clone()]);
    assert!(scan_all(&server, &full).is_empty());
    assert_eq!(server.replay_commit_logs().unwrap(), 20);
    assert_eq!(scan_all(&server, &full), rows);
    // replay is idempotent.
    assert_eq!(server.replay_commit_logs().unwrap(), 0);

    // new revisions follow replayed ones.
    let last = server.ctx.clock.to_last();
    let more = vec!["99".to_string()];
    assert!(server.update(to_table(), to_buffer(&more), 1, 0).unwrap().is_ok());
    assert!(server.ctx.clock.to_last() > last);

    server.close().unwrap();
}

#[test]
fn test_server_restart_transfer_logs() {
    let dir = test_dir("test_server_restart_transfer_logs");
    let full = RangeSpec::new(b"", END_ROW_MARKER);
    let config = new_config(&dir);

    // transfer log of a split that never got linked.
    let namer = TransferLogNamer::default();
    let split_dir = namer.allocate(&config.dir, "2/1", b"m").unwrap();
    {
        let log = CommitLog::create(&split_dir, config.commit_log.clone(), None).unwrap();
        let mut buf = vec![];
        encode_commit_header(&mut buf, &to_table()).unwrap();
        for (i, row) in ["a", "b", "c"].iter().enumerate() {
            let mut key = Key::insert(row.as_bytes(), 1, b"q");
            key.set_revision(100 + i as i64);
            encode_mutation(&mut buf, &key, row.as_bytes()).unwrap();
        }
        log.append(config.cluster_id, &buf, 102, true).unwrap();
        log.close().unwrap();
    }
    // phantom log of an unfinished recovery.
    let phantom_dir = to_phantom_log_dir(&config.dir, "2/1", b"z", 3);
    std::fs::create_dir_all(&phantom_dir).unwrap();

    let server = new_server("rs1", config.clone(), &[full.clone()]);
    assert_eq!(server.replay_commit_logs().unwrap(), 3);
    assert_eq!(scan_all(&server, &full), vec!["a", "b", "c"]);
    assert!(!phantom_dir.exists());
    assert!(server.ctx.clock.to_last() >= 102);
    let linked = server.ctx.to_commit_log(&to_table()).to_linked_logs().unwrap();
    assert!(linked.contains(&split_dir));
    server.close().unwrap();

    // once linked, the transfer log replays through the commit log.
    let server = new_server("rs1", config, &[full.clone()]);
    assert_eq!(server.replay_commit_logs().unwrap(), 3);
    assert_eq!(scan_all(&server, &full), vec!["a", "b", "c"]);
    server.close().unwrap();
}

#[test]
fn test_dispatcher() {
    let dir = test_dir("test_dispatcher");
    let full = RangeSpec::new(b"", END_ROW_MARKER);
    let server = Arc::new(new_server("rs1", new_config(&dir), &[full.clone()]));
    let dispatcher = Dispatcher::new(Arc::clone(&server)).unwrap();

    let rows: Vec<String> = ["x", "y"].iter().map(|r| r.to_string()).collect();
    let req = Request::Update {
        table: to_table(),
        buffer: to_buffer(&rows),
        count: 2,
        flags: 0,
    };
    match dispatcher.request(req).unwrap() {
        Response::Update(resp) => assert!(resp.is_ok(), "{:?}", resp),
        resp => panic!("unexpected {:?}", resp),
    }

    let req = Request::CreateScanner {
        table: to_table(),
        range: full.clone(),
        spec: ScanSpec::default(),
    };
    let (tx, rx) = mpsc::channel();
    dispatcher.request_tx(req, tx).unwrap();
    match rx.recv().unwrap() {
        Response::ScanBlock(block) => assert_eq!(to_rows(&block), rows),
        resp => panic!("unexpected {:?}", resp),
    }

    let req = Request::TableMaintenanceDisable {
        table_id: "2/7".to_string(),
    };
    let resp = dispatcher.request(req).unwrap();
    assert_eq!(resp.to_error(), code::TABLE_NOT_FOUND);

    let req = Request::FetchScanblock { scanner_id: 1234 };
    let resp = dispatcher.request(req).unwrap();
    assert_eq!(resp.to_error(), code::RANGESERVER_INVALID_SCANNER_ID);

    let update = PhantomUpdate {
        op_id: 1,
        location: "rs9".to_string(),
        plan_generation: 1,
        table: to_table(),
        spec: full.clone(),
        fragment: 0,
        more: false,
        payload: vec![],
    };
    let resp = dispatcher.request(Request::PhantomUpdate(update)).unwrap();
    assert_eq!(resp.to_error(), code::RANGESERVER_PHANTOM_RANGE_MAP_NOT_FOUND);

    let req = Request::Split {
        table_id: "2/1".to_string(),
        spec: full.clone(),
    };
    assert_eq!(
        dispatcher.request(req).unwrap(),
        Response::Split(Some(RangeSpec::new(b"", b"x")))
    );

    dispatcher.close_wait().unwrap();
    match Arc::try_unwrap(server) {
        Ok(server) => server.close().unwrap(),
        Err(_) => panic!("server still shared"),
    }
}

#[test]
fn test_to_short() {
    assert_eq!(to_short("abc"), "abc");
    let name = "x".repeat(200);
    assert_eq!(to_short(&name).len(), 80);
}

#[test]
fn test_scatter_local() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_scatter_local {}", seed);

    let low = RangeSpec::new(b"", b"m");
    let high = RangeSpec::new(b"m", END_ROW_MARKER);
    let dir1 = test_dir("test_scatter_local_1");
    let dir2 = test_dir("test_scatter_local_2");
    let rs1 = Arc::new(new_server("rs1", new_config(&dir1), &[low.clone()]));
    let rs2 = Arc::new(new_server("rs2", new_config(&dir2), &[high.clone()]));

    let sender = Arc::new(LocalSender::new());
    sender.add_server(Arc::clone(&rs1)).unwrap();
    sender.add_server(Arc::clone(&rs2)).unwrap();

    let mut sb = ScatterBuffer::new(
        to_table(),
        Arc::clone(&sender) as Arc<dyn RangeLocator>,
        Arc::clone(&sender) as Arc<dyn RangeSender>,
    );
    let n = 1 + rng.gen::<usize>() % 100;
    let mut rows: Vec<String> = (0..n)
        .map(|i| format!("{}{:03}", (b'a' + rng.gen_range(0..26)) as char, i))
        .collect();
    for row in rows.iter() {
        let key = Key::insert(row.as_bytes(), 1, b"q");
        sb.set(&key, row.as_bytes()).unwrap();
    }
    assert!(sb.flush(0).unwrap().is_empty());

    rows.sort();
    let (lows, highs): (Vec<String>, Vec<String>) =
        rows.into_iter().partition(|r| r.as_bytes() <= &b"m"[..]);
    assert_eq!(scan_all(&rs1, &low), lows);
    assert_eq!(scan_all(&rs2, &high), highs);

    // unknown family is reported back, not retried.
    let key = Key::insert(b"b", 9, b"q");
    sb.set(&key, b"x").unwrap();
    let failed = sb.flush(0).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error, code::RANGESERVER_INVALID_COLUMNFAMILY);

    assert!(sender.remove_server("rs2").unwrap().is_some());
    let key = Key::insert(b"x", 1, b"q");
    assert!(sb.set(&key, b"x").is_err());
}
