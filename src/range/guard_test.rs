use rand::{prelude::random, rngs::SmallRng, Rng, SeedableRng};

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering::SeqCst},
        mpsc, Arc,
    },
    thread,
    time::{Duration, Instant},
};

use super::*;
use crate::Error;

#[test]
fn test_guard_busy() {
    let guard = RangeMaintenanceGuard::new();
    guard.activate().unwrap();

    let start = Instant::now();
    match guard.activate() {
        Err(err @ Error::RangeBusy(_, _)) => {
            assert_eq!(err.to_code(), crate::error::code::RANGESERVER_RANGE_BUSY)
        }
        res => panic!("unexpected {:?}", res),
    }
    assert!(start.elapsed() < Duration::from_secs(1));

    guard.deactivate().unwrap();
    assert_eq!(guard.to_state().unwrap(), GuardState::Idle);
    assert!(guard.deactivate().is_err());
}

#[test]
fn test_guard_wait_disable() {
    let guard = Arc::new(RangeMaintenanceGuard::new());
    guard.activate().unwrap();

    let (tx, rx) = mpsc::channel();
    let handle = {
        let guard = Arc::clone(&guard);
        thread::spawn(move || {
            guard.wait_for_complete(true).unwrap();
            tx.send(()).unwrap();
        })
    };

    // waiter stays blocked while the guard is active.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    guard.deactivate().unwrap();
    rx.recv_timeout(Duration::from_secs(10)).unwrap();
    handle.join().unwrap();

    assert_eq!(guard.to_state().unwrap(), GuardState::Disabled);
    match guard.activate() {
        Err(Error::RangeNotActive(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }

    guard.enable().unwrap();
    guard.activate().unwrap();
    assert!(guard.in_progress());
}

#[test]
fn test_guard_wait_idle() {
    let guard = RangeMaintenanceGuard::new();
    guard.wait_for_complete(false).unwrap();
    assert_eq!(guard.to_state().unwrap(), GuardState::Idle);
    guard.wait_for_complete(true).unwrap();
    assert!(guard.is_disabled());
}

#[test]
fn test_guard_activator() {
    let guard = RangeMaintenanceGuard::new();
    {
        let _a = guard.activator().unwrap();
        assert!(guard.activator().is_err());
    }
    assert_eq!(guard.to_state().unwrap(), GuardState::Idle);
}

#[test]
fn test_guard_exclusion() {
    let seed: u64 = random();
    let mut rng = SmallRng::seed_from_u64(seed);
    println!("test_guard_exclusion {}", seed);

    let n_threads = [2, 4, 8][rng.gen::<usize>() % 3];
    let guard = Arc::new(RangeMaintenanceGuard::new());
    let holders = Arc::new(AtomicUsize::new(0));
    let acquired = Arc::new(AtomicUsize::new(0));

    let mut handles = vec![];
    for _ in 0..n_threads {
        let (guard, holders, acquired) =
            (Arc::clone(&guard), Arc::clone(&holders), Arc::clone(&acquired));
        handles.push(thread::spawn(move || {
            for _ in 0..1000 {
                if guard.activate().is_ok() {
                    assert_eq!(holders.fetch_add(1, SeqCst), 0);
                    acquired.fetch_add(1, SeqCst);
                    thread::yield_now();
                    holders.fetch_sub(1, SeqCst);
                    guard.deactivate().unwrap();
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap()
    }
    assert!(acquired.load(SeqCst) > 0);
    assert_eq!(guard.to_state().unwrap(), GuardState::Idle);
}
