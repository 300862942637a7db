use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use super::*;
use crate::{
    commit_log::CommitLog,
    config::Config,
    error::code,
    key::Key,
    scan::ScanSpec,
    table::{Schema, END_ROW_MARKER},
    update::{decode_commit_payload, encode_commit_header},
    Error,
};

fn test_dir(name: &str) -> path::PathBuf {
    let dir = std::env::temp_dir().join(name);
    std::fs::remove_dir_all(&dir).ok();
    dir
}

#[derive(Default)]
struct TestMaster {
    prepared: Mutex<Vec<CompleteParams>>,
    committed: Mutex<Vec<CompleteParams>>,
}

impl MasterClient for TestMaster {
    fn phantom_prepare_complete(&self, params: PhantomPrepareComplete) -> Result<()> {
        self.prepared.lock().unwrap().push(params);
        Ok(())
    }

    fn phantom_commit_complete(&self, params: PhantomCommitComplete) -> Result<()> {
        self.committed.lock().unwrap().push(params);
        Ok(())
    }
}

impl TestMaster {
    fn last_prepared(&self) -> CompleteParams {
        self.prepared.lock().unwrap().last().cloned().unwrap()
    }

    fn last_committed(&self) -> CompleteParams {
        self.committed.lock().unwrap().last().cloned().unwrap()
    }
}

// Context with table "2/1", generation 1, family 1 and no ranges.
fn new_context(name: &str) -> Context {
    let ctx = Context::new("rs2", Config::new(&test_dir(name))).unwrap();
    let mut schema = Schema::new(1);
    schema.add_family("cf", 0).unwrap();
    ctx.tables.get_or_insert("2/1", schema).unwrap();
    ctx
}

fn add_live_range(ctx: &Context, spec: RangeSpec) -> Arc<Range> {
    let table = TableIdentifier::new("2/1", 1);
    let dir = ctx.to_range_dir("2/1", &spec.end_row);
    let range = Arc::new(Range::new(table, spec, &dir).unwrap());
    let info = ctx.tables.get("2/1").unwrap().unwrap();
    info.add_range(Arc::clone(&range)).unwrap();
    range
}

fn to_mutations(rows: &[(&str, i64)]) -> Vec<u8> {
    let mut buf = vec![];
    for (row, revision) in rows.iter() {
        let mut key = Key::insert(row.as_bytes(), 1, b"q");
        key.set_revision(*revision);
        encode_mutation(&mut buf, &key, row.as_bytes()).unwrap();
    }
    buf
}

fn to_commit_payload(table_id: &str, rows: &[(&str, i64)]) -> Vec<u8> {
    let mut buf = vec![];
    encode_commit_header(&mut buf, &TableIdentifier::new(table_id, 1)).unwrap();
    buf.extend_from_slice(&to_mutations(rows));
    buf
}

fn scanned(range: &Range) -> Vec<String> {
    range
        .scan(&ScanSpec::default())
        .unwrap()
        .into_iter()
        .map(|c| String::from_utf8(c.key.row).unwrap())
        .collect()
}

fn low_spec() -> QualifiedRangeSpec {
    QualifiedRangeSpec::new(TableIdentifier::new("2/1", 1), RangeSpec::new(b"", b"m"))
}

fn high_spec() -> QualifiedRangeSpec {
    let spec = RangeSpec::new(b"m", END_ROW_MARKER);
    QualifiedRangeSpec::new(TableIdentifier::new("2/1", 1), spec)
}

fn phantom_update(
    qs: &QualifiedRangeSpec,
    plan_generation: i32,
    fragment: u32,
    more: bool,
    rows: &[(&str, i64)],
) -> PhantomUpdate {
    PhantomUpdate {
        op_id: 7,
        location: "rs1".to_string(),
        plan_generation,
        table: qs.table.clone(),
        spec: qs.spec.clone(),
        fragment,
        more,
        payload: to_mutations(rows),
    }
}

#[test]
fn test_replay_into_range() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_replay_into_range {}", seed);

    let dir = test_dir("test_replay_into_range");
    let log_dir = dir.join("log");
    let log = CommitLog::create(&log_dir, commit_log::Config::default(), None).unwrap();

    let mut revision = 100;
    let mut expected = vec![];
    for _ in 0..(1 + rng.gen::<usize>() % 20) {
        let rows: Vec<(String, i64)> = (0..(1 + rng.gen::<usize>() % 5))
            .map(|_| {
                revision += 1;
                let row = format!("{}{}", (b'a' + rng.gen_range(0..26)) as char, revision);
                (row, revision)
            })
            .collect();
        let refs: Vec<(&str, i64)> = rows.iter().map(|(r, v)| (r.as_str(), *v)).collect();
        log.append(1, &to_commit_payload("2/1", &refs), revision, false)
            .unwrap();
        // other tables are ignored.
        log.append(1, &to_commit_payload("2/2", &refs), revision, false)
            .unwrap();
        expected.extend(rows.into_iter().map(|(r, _)| r).filter(|r| r.as_str() <= "m"));
    }
    log.close().unwrap();
    expected.sort();

    let table = TableIdentifier::new("2/1", 1);
    let range = Range::new(table, RangeSpec::new(b"", b"m"), &dir.join("range")).unwrap();
    let n = replay_into_range(&log_dir, commit_log::Config::default(), &range).unwrap();
    assert_eq!(n, expected.len());
    assert_eq!(scanned(&range), expected);

    // replaying again yields the same range.
    let n = replay_into_range(&log_dir, commit_log::Config::default(), &range).unwrap();
    assert_eq!(n, 0);
    assert_eq!(scanned(&range), expected);
}

#[test]
fn test_replay_commit_log() {
    let ctx = new_context("test_replay_commit_log");
    let low = add_live_range(&ctx, low_spec().spec);
    let high = add_live_range(&ctx, high_spec().spec);

    let log_dir = ctx.config.dir.join("old-log");
    let log = CommitLog::create(&log_dir, commit_log::Config::default(), None).unwrap();
    let rows = [("a", 10), ("z", 11), ("m", 12), ("n", 13)];
    log.append(1, &to_commit_payload("2/1", &rows), 13, true).unwrap();
    log.append(1, &to_commit_payload("2/9", &[("b", 99)]), 99, true)
        .unwrap();
    log.close().unwrap();

    assert_eq!(replay_commit_log(&ctx, &log_dir).unwrap(), 4);
    assert_eq!(scanned(&low), vec!["a", "m"]);
    assert_eq!(scanned(&high), vec!["n", "z"]);
    assert!(ctx.clock.to_last() >= 99);
    assert!(ctx.clock.next() > 99);

    assert_eq!(replay_commit_log(&ctx, &log_dir).unwrap(), 0);
    assert_eq!(scanned(&low), vec!["a", "m"]);
}

#[test]
fn test_recovery() {
    let ctx = new_context("test_recovery");
    let master = Arc::new(TestMaster::default());
    let recovery = Recovery::new(Arc::clone(&master) as Arc<dyn MasterClient>);
    let specs = vec![low_spec(), high_spec()];

    recovery.load(&ctx, 7, "rs1", 1, &[0, 1], &specs).unwrap();
    let (plan, states) = recovery.to_status("rs1").unwrap().unwrap();
    assert_eq!(plan, 1);
    assert_eq!(states, vec![PhantomState::Loaded, PhantomState::Loaded]);

    // fragments arrive out of order, in parts.
    let updates = vec![
        phantom_update(&specs[0], 1, 1, true, &[("c", 30)]),
        phantom_update(&specs[1], 1, 0, false, &[("x", 20), ("n", 10)]),
        phantom_update(&specs[0], 1, 0, false, &[("a", 10), ("b", 20)]),
        phantom_update(&specs[0], 1, 1, false, &[("d", 40)]),
        phantom_update(&specs[1], 1, 1, false, &[]),
    ];
    let applied: Vec<bool> = updates
        .iter()
        .map(|u| recovery.update(&ctx, u).unwrap())
        .collect();
    assert_eq!(applied, vec![false, true, true, true, true]);

    // duplicate fragment is ignored.
    assert!(!recovery.update(&ctx, &updates[2]).unwrap());

    // phantom ranges are not live yet.
    let info = ctx.tables.get("2/1").unwrap().unwrap();
    assert!(info.find_containing_range(b"a").unwrap().is_none());

    recovery.prepare(&ctx, 7, "rs1", 1, &specs).unwrap();
    let notice = master.last_prepared();
    assert!(notice.is_ok(), "{}", notice);
    assert_eq!((notice.op_id, notice.location.as_str(), notice.plan_generation), (7, "rs1", 1));

    recovery.commit(&ctx, 7, "rs1", 1, &specs).unwrap();
    assert!(master.last_committed().is_ok());
    assert!(recovery.to_status("rs1").unwrap().is_none());

    let (low, _) = info.find_containing_range(b"a").unwrap().unwrap();
    let (high, _) = info.find_containing_range(b"x").unwrap().unwrap();
    assert_eq!(scanned(&low), vec!["a", "b", "c", "d"]);
    assert_eq!(scanned(&high), vec!["n", "x"]);
    assert_eq!(low.to_latest_revision(), 40);

    // retried commit, ranges already live.
    recovery.commit(&ctx, 7, "rs1", 1, &specs).unwrap();
    assert_eq!(master.committed.lock().unwrap().len(), 2);
    assert!(master.last_committed().is_ok());

    // phantom logs are reachable from the user commit log.
    ctx.close().unwrap();
    let user_log = ctx.config.to_user_log_dir();
    let mut reader = CommitLogReader::open(&user_log, commit_log::Config::default()).unwrap();
    let mut rows = vec![];
    while let Some(block) = reader.next_block().unwrap() {
        let (_, buf) = decode_commit_payload(&block.payload).unwrap();
        for m in Mutations::new(buf) {
            rows.push(String::from_utf8(m.unwrap().key.row).unwrap());
        }
    }
    rows.sort();
    assert_eq!(rows, vec!["a", "b", "c", "d", "n", "x"]);
}

#[test]
fn test_recovery_purge_before_commit() {
    let ctx = new_context("test_recovery_purge_before_commit");
    let master = Arc::new(TestMaster::default());
    let recovery = Recovery::new(Arc::clone(&master) as Arc<dyn MasterClient>);
    let specs = vec![low_spec()];

    recovery.load(&ctx, 7, "rs1", 1, &[0], &specs).unwrap();
    let update = phantom_update(&specs[0], 1, 0, false, &[("a", 10), ("b", 20)]);
    assert!(recovery.update(&ctx, &update).unwrap());
    recovery.prepare(&ctx, 7, "rs1", 1, &specs).unwrap();
    assert_eq!(ctx.to_pinned_revisions().unwrap(), (10, i64::MAX));

    // no live ranges hold the linked fragments, the pin does.
    crate::range::maintenance::purge_commit_logs(&ctx).unwrap();
    let log_dir = transfer::to_phantom_log_dir(&ctx.config.dir, "2/1", b"m", 7);
    assert!(log_dir.exists());

    recovery.commit(&ctx, 7, "rs1", 1, &specs).unwrap();
    assert!(master.last_committed().is_ok());
    assert_eq!(ctx.to_pinned_revisions().unwrap(), (i64::MAX, i64::MAX));
    // the live range's cache holds purging back from now on.
    crate::range::maintenance::purge_commit_logs(&ctx).unwrap();

    ctx.close().unwrap();
    let user_log = ctx.config.to_user_log_dir();
    let mut reader = CommitLogReader::open(&user_log, commit_log::Config::default()).unwrap();
    let mut rows = vec![];
    while let Some(block) = reader.next_block().unwrap() {
        let (_, buf) = decode_commit_payload(&block.payload).unwrap();
        for m in Mutations::new(buf) {
            rows.push(String::from_utf8(m.unwrap().key.row).unwrap());
        }
    }
    rows.sort();
    assert_eq!(rows, vec!["a", "b"]);
}

#[test]
fn test_recovery_retries() {
    let ctx = new_context("test_recovery_retries");
    let master = Arc::new(TestMaster::default());
    let recovery = Recovery::new(Arc::clone(&master) as Arc<dyn MasterClient>);
    let specs = vec![low_spec()];

    recovery.load(&ctx, 7, "rs1", 2, &[0], &specs).unwrap();
    recovery
        .update(&ctx, &phantom_update(&specs[0], 2, 0, true, &[("a", 10)]))
        .unwrap();

    // stale plan is ignored, loaded ranges stay.
    recovery.load(&ctx, 7, "rs1", 1, &[0, 1], &specs).unwrap();
    let (plan, states) = recovery.to_status("rs1").unwrap().unwrap();
    assert_eq!((plan, states.len()), (2, 1));

    // updates under another plan are refused.
    match recovery.update(&ctx, &phantom_update(&specs[0], 1, 0, false, &[])) {
        Err(Error::PlanGenerationMismatch(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    // prepare before all fragments are in fails, master is told.
    assert!(recovery.prepare(&ctx, 7, "rs1", 2, &specs).is_err());
    let notice = master.last_prepared();
    assert_eq!(notice.error, code::RANGESERVER_RANGE_NOT_ACTIVE);
    assert!(!notice.message.is_empty());

    // newer plan replaces the loaded ranges, partial fragments are lost.
    recovery.load(&ctx, 8, "rs1", 3, &[0], &specs).unwrap();
    let (plan, states) = recovery.to_status("rs1").unwrap().unwrap();
    assert_eq!((plan, states), (3, vec![PhantomState::Loaded]));

    let update = phantom_update(&specs[0], 3, 0, false, &[("b", 20)]);
    assert!(recovery.update(&ctx, &update).unwrap());
    recovery.prepare(&ctx, 8, "rs1", 3, &specs).unwrap();
    recovery.prepare(&ctx, 8, "rs1", 3, &specs).unwrap();
    assert_eq!(master.prepared.lock().unwrap().len(), 3);
    assert!(master.last_prepared().is_ok());

    // updates after replay are no-ops.
    assert!(!recovery.update(&ctx, &update).unwrap());

    recovery.commit(&ctx, 8, "rs1", 3, &specs).unwrap();
    let info = ctx.tables.get("2/1").unwrap().unwrap();
    let (range, _) = info.find_containing_range(b"a").unwrap().unwrap();
    assert_eq!(scanned(&range), vec!["b"]);

    // load of a range already live is skipped.
    recovery.load(&ctx, 9, "rs1", 4, &[0], &specs).unwrap();
    let (_, states) = recovery.to_status("rs1").unwrap().unwrap();
    assert!(states.is_empty());
    assert!(!recovery
        .update(&ctx, &phantom_update(&specs[0], 4, 0, false, &[("c", 30)]))
        .unwrap());
}

#[test]
fn test_recovery_errors() {
    let ctx = new_context("test_recovery_errors");
    let master = Arc::new(TestMaster::default());
    let recovery = Recovery::new(Arc::clone(&master) as Arc<dyn MasterClient>);

    match recovery.update(&ctx, &phantom_update(&low_spec(), 1, 0, false, &[])) {
        Err(Error::PhantomMapNotFound(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    let unknown = QualifiedRangeSpec::new(TableIdentifier::new("2/5", 1), RangeSpec::full());
    match recovery.load(&ctx, 1, "rs1", 1, &[0], &[unknown]) {
        Err(Error::TableNotFound(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    recovery.load(&ctx, 1, "rs1", 1, &[0], &[low_spec()]).unwrap();
    match recovery.update(&ctx, &phantom_update(&high_spec(), 1, 0, false, &[])) {
        Err(Error::RangeNotFound(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    assert!(recovery.prepare(&ctx, 1, "rs9", 1, &[low_spec()]).is_err());
    assert_eq!(master.last_prepared().error, code::RANGESERVER_PHANTOM_RANGE_MAP_NOT_FOUND);

    assert!(recovery.commit(&ctx, 1, "rs1", 1, &[low_spec()]).is_err());
    let notice = master.last_committed();
    assert_eq!(notice.error, code::RANGESERVER_RANGE_NOT_ACTIVE);
    assert_eq!(notice.location, "rs1");

    // range without data, prepare removes its empty phantom log.
    recovery
        .update(&ctx, &phantom_update(&low_spec(), 1, 0, false, &[]))
        .unwrap();
    recovery.prepare(&ctx, 1, "rs1", 1, &[low_spec()]).unwrap();
    let log_dir = transfer::to_phantom_log_dir(&ctx.config.dir, "2/1", b"m", 1);
    assert!(!log_dir.exists());
    recovery.commit(&ctx, 1, "rs1", 1, &[low_spec()]).unwrap();
    assert!(recovery.to_status("rs1").unwrap().is_none());
}
