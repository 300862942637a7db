use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{path, time::Duration};

use super::*;
use crate::{
    commit_log::{self, CommitLogReader},
    config::Config,
    error::code,
    key::{encode_mutation, Key},
    range::{Range, TransferInfo},
    scan::ScanSpec,
    table::{RangeSpec, Schema, TableIdentifier, END_ROW_MARKER},
    update::{decode_commit_payload, SendBackRec, NO_LOG_SYNC},
};

const WAIT: Duration = Duration::from_secs(10);

fn test_dir(name: &str) -> path::PathBuf {
    let dir = std::env::temp_dir().join(name);
    std::fs::remove_dir_all(&dir).ok();
    dir
}

fn new_config(name: &str) -> Config {
    let mut config = Config::new(&test_dir(name));
    config.set_commit_interval(Duration::from_millis(2));
    config
}

// Context with table "2/1", family 1, split into ranges (..m] and (m..].
fn new_context(config: Config) -> Arc<Context> {
    let ctx = Context::new("rs1", config).unwrap();

    let mut schema = Schema::new(1);
    schema.add_family("cf", 0).unwrap();
    let info = ctx.tables.get_or_insert("2/1", schema).unwrap();
    let table = TableIdentifier::new("2/1", 1);
    for spec in [RangeSpec::new(b"", b"m"), RangeSpec::new(b"m", END_ROW_MARKER)].iter() {
        let dir = ctx.to_range_dir("2/1", &spec.end_row);
        let range = Range::new(table.clone(), spec.clone(), &dir).unwrap();
        info.add_range(Arc::new(range)).unwrap();
    }
    Arc::new(ctx)
}

fn to_range(ctx: &Context, row: &[u8]) -> Arc<Range> {
    let info = ctx.tables.get("2/1").unwrap().unwrap();
    info.find_containing_range(row).unwrap().unwrap().0
}

fn put(buf: &mut Vec<u8>, row: &str, family: u8) {
    let key = Key::insert(row.as_bytes(), family, b"q");
    encode_mutation(buf, &key, row.as_bytes()).unwrap();
}

fn to_buffer(rows: &[&str]) -> Vec<u8> {
    let mut buf = vec![];
    rows.iter().for_each(|row| put(&mut buf, row, 1));
    buf
}

fn new_request(
    id: u64,
    buf: Vec<u8>,
    count: u32,
    flags: u32,
    timeout: Duration,
) -> (UpdateRequest, mpsc::Receiver<UpdateResponse>) {
    let (tx, rx) = mpsc::channel::<UpdateResponse>();
    let table = TableIdentifier::new("2/1", 1);
    let req = UpdateRequest::new(id, table, buf, count, flags, timeout, Box::new(tx));
    (req, rx)
}

// Return rows found in data blocks of commit log at `log_dir`.
fn logged_rows(log_dir: &path::Path) -> Vec<String> {
    let mut reader = CommitLogReader::open(log_dir, commit_log::Config::default()).unwrap();
    let mut rows = vec![];
    while let Some(block) = reader.next_block().unwrap() {
        let (table, buf) = decode_commit_payload(&block.payload).unwrap();
        assert_eq!(table.id, "2/1");
        for m in Mutations::new(buf) {
            let m = m.unwrap();
            assert!(m.key.revision.unwrap() <= block.header.revision);
            rows.push(String::from_utf8(m.key.row).unwrap());
        }
    }
    rows.sort();
    rows
}

fn scanned_rows(range: &Range) -> Vec<String> {
    range
        .scan(&ScanSpec::default())
        .unwrap()
        .into_iter()
        .map(|c| String::from_utf8(c.key.row).unwrap())
        .collect()
}

#[test]
fn test_pipeline_updates() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_pipeline_updates {}", seed);

    let ctx = new_context(new_config("test_pipeline_updates"));
    let pipeline = UpdatePipeline::new(Arc::clone(&ctx), None).unwrap();

    let n_requests = 1 + (rng.gen::<usize>() % 100);
    let mut receivers = vec![];
    let mut all_rows = vec![];
    for id in 0..n_requests {
        let n = 1 + (rng.gen::<usize>() % 10);
        let rows: Vec<String> = (0..n)
            .map(|i| format!("{}{:04}-{}", (b'a' + rng.gen_range(0..26)) as char, id, i))
            .collect();
        let refs: Vec<&str> = rows.iter().map(|r| r.as_str()).collect();
        let flags = if rng.gen::<bool>() { NO_LOG_SYNC } else { 0 };
        let (req, rx) = new_request(id as u64, to_buffer(&refs), n as u32, flags, WAIT);
        pipeline.submit(req).unwrap();
        receivers.push((id as u64, rx));
        all_rows.extend(rows);
    }

    for (id, rx) in receivers.into_iter() {
        let resp = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(resp.id, id);
        assert!(resp.is_ok(), "{:?}", resp);
    }
    pipeline.close().unwrap();

    all_rows.sort();
    let low = to_range(&ctx, b"a");
    let high = to_range(&ctx, b"z");
    let mut rows = scanned_rows(&low);
    assert!(rows.iter().all(|r| r.as_str() <= "m"));
    assert!(scanned_rows(&high).iter().all(|r| r.as_str() > "m"));
    rows.extend(scanned_rows(&high));
    assert_eq!(rows, all_rows);

    // leases are all released.
    assert_eq!(low.to_update_count(), 0);
    assert_eq!(high.to_update_count(), 0);
    assert!(!low.as_guard().in_progress());

    ctx.close().unwrap();
    assert_eq!(logged_rows(&ctx.config.to_user_log_dir()), all_rows);
}

#[test]
fn test_pipeline_empty_request() {
    let ctx = new_context(new_config("test_pipeline_empty_request"));
    let pipeline = UpdatePipeline::new(Arc::clone(&ctx), None).unwrap();

    let (req, rx) = new_request(1, vec![], 0, 0, WAIT);
    pipeline.submit(req).unwrap();
    let resp = rx.try_recv().unwrap();
    assert!(resp.is_ok());
    assert_eq!(resp.id, 1);

    let (req, rx) = new_request(2, vec![], 0, FORCE_SYNC, WAIT);
    pipeline.submit(req).unwrap();
    let resp = rx.recv_timeout(WAIT).unwrap();
    assert!(resp.is_ok());
    assert_eq!(resp.id, 2);

    pipeline.close().unwrap();
    ctx.close().unwrap();
    assert!(logged_rows(&ctx.config.to_user_log_dir()).is_empty());
}

#[test]
fn test_pipeline_send_back() {
    let ctx = new_context(new_config("test_pipeline_send_back"));
    let pipeline = UpdatePipeline::new(Arc::clone(&ctx), None).unwrap();

    let mut buf = vec![];
    put(&mut buf, "a", 1);
    let offset = buf.len();
    put(&mut buf, "b", 5);
    let len = buf.len() - offset;
    put(&mut buf, "n", 1);

    let (req, rx) = new_request(1, buf, 3, 0, WAIT);
    pipeline.submit(req).unwrap();
    let resp = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(resp.error, code::OK);
    let want = SendBackRec::new(
        code::RANGESERVER_INVALID_COLUMNFAMILY,
        1,
        offset as u32,
        len as u32,
    );
    assert_eq!(resp.send_back, vec![want]);
    assert_eq!(resp.to_rejected(), 1);

    // whole request rejected for unknown table.
    let (mut req, rx) = new_request(2, to_buffer(&["c"]), 1, 0, WAIT);
    req.table = TableIdentifier::new("2/2", 1);
    pipeline.submit(req).unwrap();
    let resp = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(resp.error, code::TABLE_NOT_FOUND);

    pipeline.close().unwrap();

    assert_eq!(scanned_rows(&to_range(&ctx, b"a")), vec!["a"]);
    assert_eq!(scanned_rows(&to_range(&ctx, b"n")), vec!["n"]);
}

#[test]
fn test_pipeline_transfer() {
    let ctx = new_context(new_config("test_pipeline_transfer"));
    let low = to_range(&ctx, b"a");

    let log_dir = test_dir("test_pipeline_transfer_log");
    let log = CommitLog::create(&log_dir, commit_log::Config::default(), None).unwrap();
    let transfer = TransferInfo {
        split_row: b"f".to_vec(),
        log_dir: log_dir.clone(),
        log: Arc::new(log),
    };
    low.set_transfer(transfer.clone()).unwrap();

    let pipeline = UpdatePipeline::new(Arc::clone(&ctx), None).unwrap();
    let (req, rx) = new_request(1, to_buffer(&["a", "f", "g", "n"]), 4, 0, WAIT);
    pipeline.submit(req).unwrap();
    assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
    pipeline.close().unwrap();

    // transferring rows are applied to the parent, but logged apart.
    assert_eq!(scanned_rows(&low), vec!["a", "f", "g"]);
    transfer.log.close().unwrap();
    ctx.close().unwrap();
    assert_eq!(logged_rows(&log_dir), vec!["a", "f"]);
    assert_eq!(logged_rows(&ctx.config.to_user_log_dir()), vec!["g", "n"]);
}

#[test]
fn test_pipeline_expired() {
    let ctx = new_context(new_config("test_pipeline_expired"));
    let pipeline = UpdatePipeline::new(Arc::clone(&ctx), None).unwrap();

    let (req, rx) = new_request(1, to_buffer(&["a"]), 1, 0, Duration::from_millis(0));
    pipeline.submit(req).unwrap();
    let resp = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(resp.error, code::REQUEST_TIMEOUT);
    pipeline.close().unwrap();

    // timeout doesn't imply loss, mutations are logged and applied.
    assert_eq!(scanned_rows(&to_range(&ctx, b"a")), vec!["a"]);
}

#[test]
fn test_pipeline_unavailable_range() {
    let ctx = new_context(new_config("test_pipeline_unavailable_range"));
    let low = to_range(&ctx, b"a");
    let err: Result<()> = err_at!(IOError, msg: "disk gone");
    low.mark_unavailable(&err.unwrap_err()).unwrap();

    let pipeline = UpdatePipeline::new(Arc::clone(&ctx), None).unwrap();
    let (req, rx) = new_request(1, to_buffer(&["a", "b", "n"]), 3, 0, WAIT);
    pipeline.submit(req).unwrap();
    let resp = rx.recv_timeout(WAIT).unwrap();
    pipeline.close().unwrap();

    assert_eq!(resp.send_back.len(), 1);
    assert_eq!(resp.send_back[0].error, code::RANGESERVER_UNAVAILABLE);
    assert_eq!(resp.send_back[0].count, 2);
    assert!(scanned_rows(&low).is_empty());
    assert_eq!(scanned_rows(&to_range(&ctx, b"n")), vec!["n"]);
}

#[test]
fn test_pipeline_maintenance_check() {
    let mut config = new_config("test_pipeline_maintenance_check");
    config.set_compaction(1, 100);
    let ctx = new_context(config);

    let scheduler: Thread<Msg, (), usize> = Thread::new("test-scheduler", |rx: Rx<Msg, ()>| {
        move || {
            let mut n = 0;
            while let Ok((Msg::Check, _)) = rx.recv() {
                n += 1;
            }
            n
        }
    })
    .unwrap();

    let pipeline = UpdatePipeline::new(Arc::clone(&ctx), Some(scheduler.to_tx().unwrap())).unwrap();
    let (req, rx) = new_request(1, to_buffer(&["a"]), 1, 0, WAIT);
    pipeline.submit(req).unwrap();
    assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
    pipeline.close().unwrap();

    assert_eq!(scheduler.join().unwrap(), 1);
}

#[test]
fn test_pipeline_group_commit() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_pipeline_group_commit {}", seed);

    let mut config = new_config("test_pipeline_group_commit");
    config.set_commit_interval(Duration::from_millis(500));
    let ctx = new_context(config);
    let (_, syncs) = ctx.user_log.to_stats().unwrap();

    let pipeline = UpdatePipeline::new(Arc::clone(&ctx), None).unwrap();
    let n_requests = 2 + (rng.gen::<usize>() % 20);
    let mut receivers = vec![];
    for id in 0..n_requests {
        let row = format!("{}{:02}", (b'a' + rng.gen_range(0..26)) as char, id);
        let (req, rx) = new_request(id as u64, to_buffer(&[row.as_str()]), 1, 0, WAIT);
        pipeline.submit(req).unwrap();
        receivers.push(rx);
    }
    for rx in receivers.into_iter() {
        let resp = rx.recv_timeout(WAIT).unwrap();
        assert!(resp.is_ok(), "{:?}", resp);
    }
    pipeline.close().unwrap();

    // every request was released by the same sync.
    let (appends, n) = ctx.user_log.to_stats().unwrap();
    assert_eq!(n, syncs + 1);
    assert!(appends >= 1);
    assert_eq!(logged_rows(&ctx.config.to_user_log_dir()).len(), n_requests);
}

#[test]
fn test_pipeline_sync_failure() {
    let mut config = new_config("test_pipeline_sync_failure");
    config.set_sync_retry(2, Duration::from_millis(1));
    let ctx = new_context(config);
    ctx.user_log.set_sync_faults(3).unwrap();

    let pipeline = UpdatePipeline::new(Arc::clone(&ctx), None).unwrap();
    let (req, rx) = new_request(1, to_buffer(&["a", "x"]), 2, 0, WAIT);
    pipeline.submit(req).unwrap();
    let resp = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(resp.error, code::LOCAL_IO_ERROR, "{:?}", resp);

    let (low, high) = (to_range(&ctx, b"a"), to_range(&ctx, b"x"));
    for range in [&low, &high].iter() {
        match range.to_error().unwrap() {
            Some(Error::Unavailable(_, _)) => (),
            err => panic!("unexpected {:?}", err),
        }
        assert!(scanned_rows(range).is_empty());
    }

    // log syncs again, but the ranges stay unavailable.
    let (req, rx) = new_request(2, to_buffer(&["b"]), 1, 0, WAIT);
    pipeline.submit(req).unwrap();
    let resp = rx.recv_timeout(WAIT).unwrap();
    pipeline.close().unwrap();
    assert_eq!(resp.send_back.len(), 1);
    assert_eq!(resp.send_back[0].error, code::RANGESERVER_UNAVAILABLE);
}
