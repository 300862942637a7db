//! Module implement the revision clock.
//!
//! Revisions are 64-bit nanosecond timestamps. Every mutation applied to a
//! range is stamped with a revision, and replay during recovery happens in
//! revision order.

use std::sync::atomic::{AtomicI64, Ordering::SeqCst};

/// Minimum revision, no mutation shall carry this revision.
pub const REVISION_MIN: i64 = i64::MIN + 2;
/// Revision value used to mean "no revision seen so far".
pub const REVISION_NULL: i64 = i64::MIN;

/// Issue strictly increasing revision numbers derived from wall clock.
///
/// `next()` returns `max(now, last + 1)`, hence returned values keep
/// increasing even when the wall clock stalls or jumps backward.
pub struct RevisionClock {
    last: AtomicI64,
}

impl Default for RevisionClock {
    fn default() -> RevisionClock {
        RevisionClock::new()
    }
}

impl RevisionClock {
    pub fn new() -> RevisionClock {
        RevisionClock {
            last: AtomicI64::new(REVISION_NULL),
        }
    }

    /// Return the next revision.
    pub fn next(&self) -> i64 {
        self.next_with(wall_clock_nanos())
    }

    fn next_with(&self, now: i64) -> i64 {
        let mut last = self.last.load(SeqCst);
        loop {
            let rev = std::cmp::max(now, last.saturating_add(1));
            match self.last.compare_exchange(last, rev, SeqCst, SeqCst) {
                Ok(_) => break rev,
                Err(val) => last = val,
            }
        }
    }

    /// Make sure subsequent revisions are greater than `revision`. Used
    /// when revisions are learnt from replayed logs or supplied by clients.
    pub fn observe(&self, revision: i64) {
        self.last.fetch_max(revision, SeqCst);
    }

    /// Return the last issued, or observed, revision.
    pub fn to_last(&self) -> i64 {
        self.last.load(SeqCst)
    }
}

/// Current wall-clock time, in nanoseconds since UNIX EPOCH.
pub fn wall_clock_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos()
}

#[cfg(test)]
#[path = "clock_test.rs"]
mod clock_test;
