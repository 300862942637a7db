use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::collections::HashMap;

use super::*;
use crate::{update::SendBackRec, Error};

// Rows up to "m" live on "rs1", the rest on "rs2".
#[derive(Default)]
struct TestLocator {
    invalidated: Mutex<Vec<Vec<u8>>>,
    // rows that can no longer be located once invalidated.
    lost: Vec<Vec<u8>>,
}

impl RangeLocator for TestLocator {
    fn locate(&self, _table: &TableIdentifier, row: &[u8]) -> Result<String> {
        let invalidated = self.invalidated.lock().unwrap().iter().any(|r| r == row);
        let lost = self.lost.iter().any(|r| r == row);
        match row {
            b"" => err_at!(OutOfRange, msg: "empty row"),
            _ if invalidated && lost => err_at!(TableNotFound, msg: "dropped"),
            row if row <= &b"m"[..] => Ok("rs1".to_string()),
            _ => Ok("rs2".to_string()),
        }
    }

    fn invalidate(&self, _table: &TableIdentifier, row: &[u8]) {
        self.invalidated.lock().unwrap().push(row.to_vec());
    }
}

type Reply = Box<dyn Fn(&[u8], u32) -> Result<UpdateResponse> + Send + Sync>;

// Record every batch, answer with the reply installed for the server,
// or OK.
#[derive(Default)]
struct TestSender {
    sent: Mutex<Vec<(String, Vec<String>, u32)>>,
    replies: Mutex<HashMap<String, Vec<Reply>>>,
}

impl TestSender {
    fn push_reply(&self, addr: &str, reply: Reply) {
        let mut replies = self.replies.lock().unwrap();
        replies.entry(addr.to_string()).or_insert_with(Vec::new).push(reply);
    }

    fn to_sent(&self, addr: &str) -> Vec<Vec<String>> {
        let sent = self.sent.lock().unwrap();
        sent.iter()
            .filter(|(a, _, _)| a == addr)
            .map(|(_, rows, _)| rows.clone())
            .collect()
    }
}

impl RangeSender for TestSender {
    fn send(
        &self,
        addr: &str,
        _table: &TableIdentifier,
        buffer: Vec<u8>,
        count: u32,
        _flags: u32,
    ) -> Result<UpdateResponse> {
        let rows: Vec<String> = Mutations::new(&buffer)
            .map(|m| String::from_utf8(m.unwrap().key.row).unwrap())
            .collect();
        assert_eq!(rows.len(), count as usize);
        self.sent.lock().unwrap().push((addr.to_string(), rows, count));

        let reply = {
            let mut replies = self.replies.lock().unwrap();
            match replies.get_mut(addr) {
                Some(replies) if !replies.is_empty() => Some(replies.remove(0)),
                _ => None,
            }
        };
        match reply {
            Some(reply) => reply(&buffer, count),
            None => Ok(UpdateResponse::default()),
        }
    }
}

// Reject the first mutation of a batch with `error`.
fn reject_first(error: i32) -> Reply {
    Box::new(move |buffer: &[u8], _count: u32| {
        let m = Mutations::new(buffer).next().unwrap().unwrap();
        let rec = SendBackRec::new(error, 1, m.offset as u32, m.length as u32);
        Ok(UpdateResponse {
            send_back: vec![rec],
            ..UpdateResponse::default()
        })
    })
}

fn new_buffer(
    locator: &Arc<TestLocator>,
    sender: &Arc<TestSender>,
) -> ScatterBuffer {
    let mut sb = ScatterBuffer::new(
        TableIdentifier::new("2/1", 1),
        Arc::clone(locator) as Arc<dyn RangeLocator>,
        Arc::clone(sender) as Arc<dyn RangeSender>,
    );
    sb.set_retry_interval(time::Duration::from_millis(1))
        .set_timeout(time::Duration::from_secs(10));
    sb
}

fn set(sb: &mut ScatterBuffer, row: &str) {
    let key = Key::insert(row.as_bytes(), 1, b"q");
    sb.set(&key, row.as_bytes()).unwrap();
}

#[test]
fn test_completion_counter() {
    let counter = Arc::new(CompletionCounter::new());
    assert!(counter.is_complete());
    assert!(counter.wait_for_completion(time::Duration::from_millis(1)).unwrap());

    counter.set(2).unwrap();
    counter.increment().unwrap();
    assert!(!counter.is_complete());
    assert!(!counter.decrement().unwrap());
    assert!(!counter.decrement().unwrap());
    assert!(!counter.wait_for_completion(time::Duration::from_millis(10)).unwrap());
    assert!(counter.decrement().unwrap());
    assert!(counter.is_complete());
    match counter.decrement() {
        Err(Error::Fatal(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    counter.set_retries().unwrap();
    counter.set_errors().unwrap();
    assert!(counter.has_retries() && counter.has_errors());
    counter.set(0).unwrap();
    assert!(!counter.has_retries() && !counter.has_errors());

    let n = 8;
    counter.set(n).unwrap();
    let handles: Vec<thread::JoinHandle<()>> = (0..n)
        .map(|i| {
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                thread::sleep(time::Duration::from_millis(i as u64));
                counter.decrement().unwrap();
            })
        })
        .collect();
    assert!(counter.wait_for_completion(time::Duration::from_secs(10)).unwrap());
    handles.into_iter().for_each(|h| h.join().unwrap());
}

#[test]
fn test_scatter_sorted() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_scatter_sorted {}", seed);

    let (locator, sender) = (Arc::new(TestLocator::default()), Arc::new(TestSender::default()));
    let mut sb = new_buffer(&locator, &sender);
    assert!(sb.is_empty());

    let mut rows: Vec<String> = (0..(1 + rng.gen::<usize>() % 200))
        .map(|i| format!("{}{}", (b'a' + rng.gen_range(0..26)) as char, i))
        .collect();
    rows.iter().for_each(|row| set(&mut sb, row));
    assert!(!sb.is_empty());
    assert!(sb.to_memory_used() > 0);
    assert!(!sb.is_full());

    assert!(sb.flush(0).unwrap().is_empty());
    assert!(sb.is_empty());
    assert_eq!(sb.to_resends(), 0);
    assert_eq!(sb.to_memory_used(), 0);

    rows.sort();
    let (low, high): (Vec<String>, Vec<String>) = rows.into_iter().partition(|r| r.as_str() <= "m");
    for (addr, rows) in [("rs1", low), ("rs2", high)].iter() {
        match rows.is_empty() {
            true => assert!(sender.to_sent(addr).is_empty()),
            false => assert_eq!(&sender.to_sent(addr), &vec![rows.clone()]),
        }
    }
}

#[test]
fn test_scatter_full() {
    let (locator, sender) = (Arc::new(TestLocator::default()), Arc::new(TestSender::default()));
    let mut sb = new_buffer(&locator, &sender);
    sb.set_flush_limit(64);

    set(&mut sb, "a");
    assert!(!sb.is_full());
    for i in 0..10 {
        set(&mut sb, &format!("b{}", i));
    }
    assert!(sb.is_full());
    sb.flush(0).unwrap();
    assert!(!sb.is_full());

    // unlocatable rows fail on set.
    let key = Key::insert(b"", 1, b"q");
    assert!(sb.set(&key, b"x").is_err());
}

#[test]
fn test_scatter_retry() {
    let (locator, sender) = (Arc::new(TestLocator::default()), Arc::new(TestSender::default()));
    sender.push_reply("rs1", reject_first(code::RANGESERVER_RANGE_BUSY));
    sender.push_reply("rs1", reject_first(code::RANGESERVER_OUT_OF_RANGE));
    sender.push_reply(
        "rs2",
        Box::new(|_: &[u8], _: u32| -> Result<UpdateResponse> {
            err_at!(RangeBusy, msg: "compacting")
        }),
    );

    let mut sb = new_buffer(&locator, &sender);
    for row in ["c", "a", "b", "x", "n"].iter() {
        set(&mut sb, row);
    }
    assert!(sb.flush(0).unwrap().is_empty());
    assert_eq!(sb.to_resends(), 2);

    assert_eq!(
        sender.to_sent("rs1"),
        vec![vec!["a", "b", "c"], vec!["a"], vec!["a"]]
    );
    assert_eq!(sender.to_sent("rs2"), vec![vec!["n", "x"], vec!["n", "x"]]);

    let mut invalidated = locator.invalidated.lock().unwrap().clone();
    invalidated.sort();
    let expected: Vec<Vec<u8>> = vec![b"a".to_vec(), b"a".to_vec(), b"n".to_vec(), b"x".to_vec()];
    assert_eq!(invalidated, expected);
}

#[test]
fn test_scatter_failures() {
    let (locator, sender) = (Arc::new(TestLocator::default()), Arc::new(TestSender::default()));
    sender.push_reply("rs1", reject_first(code::RANGESERVER_INVALID_COLUMNFAMILY));
    sender.push_reply(
        "rs2",
        Box::new(|_: &[u8], _: u32| -> Result<UpdateResponse> {
            Ok(UpdateResponse {
                error: code::TABLE_NOT_FOUND,
                ..UpdateResponse::default()
            })
        }),
    );

    let mut sb = new_buffer(&locator, &sender);
    for row in ["b", "a", "y", "x"].iter() {
        set(&mut sb, row);
    }
    let mut failed: Vec<(String, i32)> = sb
        .flush(0)
        .unwrap()
        .into_iter()
        .map(|f| (String::from_utf8(f.key.row).unwrap(), f.error))
        .collect();
    failed.sort();
    assert_eq!(
        failed,
        vec![
            ("a".to_string(), code::RANGESERVER_INVALID_COLUMNFAMILY),
            ("x".to_string(), code::TABLE_NOT_FOUND),
            ("y".to_string(), code::TABLE_NOT_FOUND),
        ]
    );
    assert_eq!(sb.to_resends(), 0);
    assert!(locator.invalidated.lock().unwrap().is_empty());
}

#[test]
fn test_scatter_timeout() {
    let (locator, sender) = (Arc::new(TestLocator::default()), Arc::new(TestSender::default()));
    for _ in 0..1000 {
        sender.push_reply("rs1", reject_first(code::RANGESERVER_RANGE_BUSY));
    }

    let mut sb = new_buffer(&locator, &sender);
    sb.set_timeout(time::Duration::from_millis(50))
        .set_retry_interval(time::Duration::from_millis(5));
    set(&mut sb, "a");
    set(&mut sb, "b");

    let failed = sb.flush(0).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].key.row, b"a".to_vec());
    assert_eq!(failed[0].value, b"a".to_vec());
    assert_eq!(failed[0].error, code::REQUEST_TIMEOUT);
    assert!(sb.to_resends() > 0);
    assert!(sb.is_empty());
}

#[test]
fn test_scatter_relocate_failure() {
    let locator = Arc::new(TestLocator {
        lost: vec![b"a".to_vec()],
        ..TestLocator::default()
    });
    let sender = Arc::new(TestSender::default());
    sender.push_reply("rs1", reject_first(code::RANGESERVER_OUT_OF_RANGE));
    sender.push_reply("rs2", reject_first(code::RANGESERVER_RANGE_BUSY));

    let mut sb = new_buffer(&locator, &sender);
    for row in ["a", "b", "x", "y"].iter() {
        set(&mut sb, row);
    }
    let failed = sb.flush(0).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].key.row, b"a".to_vec());
    assert_eq!(failed[0].value, b"a".to_vec());
    assert_eq!(failed[0].error, code::TABLE_NOT_FOUND);

    assert_eq!(sb.to_resends(), 1);
    assert!(sb.is_empty());
    assert_eq!(sender.to_sent("rs1"), vec![vec!["a", "b"]]);
    assert_eq!(sender.to_sent("rs2"), vec![vec!["x", "y"], vec!["x"]]);
}
