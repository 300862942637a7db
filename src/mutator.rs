//! Module implement client side scatter of mutations across servers.
//!
//! [ScatterBuffer] groups mutations by the server holding their range,
//! as told by a [RangeLocator], and sends per server batches in parallel
//! through a [RangeSender]. Mutations sent back as busy or out-of-range
//! are re-located and resent, until they succeed or the buffer's timeout
//! expires. Other rejections are returned to the caller.

use log::{debug, warn};

use std::{
    collections::BTreeMap,
    mem,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread, time,
};

use crate::{
    error::code,
    key::{encode_mutation, Key, Mutation, Mutations},
    table::TableIdentifier,
    update::UpdateResponse,
    Result,
};

/// Default size, in bytes, of a per server batch before the buffer is
/// reported full.
pub const FLUSH_LIMIT: usize = 1024 * 1024;
/// Default timeout for flushing a buffer, including resends.
pub const TIMEOUT: time::Duration = time::Duration::from_secs(60);
/// Default interval between resends.
pub const RETRY_INTERVAL: time::Duration = time::Duration::from_millis(100);

/// Return true if mutations rejected with `error` shall be resent.
pub fn is_retryable_code(error: i32) -> bool {
    matches!(
        error,
        code::RANGESERVER_RANGE_BUSY
            | code::RANGESERVER_OUT_OF_RANGE
            | code::RANGESERVER_RANGE_NOT_FOUND
    )
}

#[derive(Default)]
struct CounterState {
    outstanding: usize,
    retries: bool,
    errors: bool,
}

/// Count outstanding batches, waking up waiters when all of them are
/// done.
#[derive(Default)]
pub struct CompletionCounter {
    state: Mutex<CounterState>,
    cond: Condvar,
}

impl CompletionCounter {
    pub fn new() -> CompletionCounter {
        CompletionCounter::default()
    }

    fn lock_state(&self) -> Result<MutexGuard<CounterState>> {
        err_at!(Fatal, self.state.lock())
    }

    /// Start a new round with `n` outstanding batches, clearing the
    /// retry and error marks.
    pub fn set(&self, n: usize) -> Result<()> {
        let mut state = self.lock_state()?;
        *state = CounterState {
            outstanding: n,
            ..CounterState::default()
        };
        if n == 0 {
            self.cond.notify_all();
        }
        Ok(())
    }

    pub fn increment(&self) -> Result<()> {
        self.lock_state()?.outstanding += 1;
        Ok(())
    }

    /// Mark a batch as done, return true if it was the last one.
    pub fn decrement(&self) -> Result<bool> {
        let mut state = self.lock_state()?;
        match state.outstanding {
            0 => err_at!(Fatal, msg: "completion counter underflow"),
            1 => {
                state.outstanding = 0;
                self.cond.notify_all();
                Ok(true)
            }
            _ => {
                state.outstanding -= 1;
                Ok(false)
            }
        }
    }

    pub fn set_retries(&self) -> Result<()> {
        self.lock_state()?.retries = true;
        Ok(())
    }

    pub fn set_errors(&self) -> Result<()> {
        self.lock_state()?.errors = true;
        Ok(())
    }

    pub fn has_retries(&self) -> bool {
        self.state.lock().map(|s| s.retries).unwrap_or(false)
    }

    pub fn has_errors(&self) -> bool {
        self.state.lock().map(|s| s.errors).unwrap_or(true)
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().map(|s| s.outstanding == 0).unwrap_or(false)
    }

    /// Wait for outstanding batches, at most `timeout`. Return false if
    /// timed out.
    pub fn wait_for_completion(&self, timeout: time::Duration) -> Result<bool> {
        let deadline = time::Instant::now() + timeout;
        let mut state = self.lock_state()?;
        while state.outstanding > 0 {
            let now = time::Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (s, _) = err_at!(Fatal, self.cond.wait_timeout(state, deadline - now))?;
            state = s;
        }
        Ok(true)
    }
}

/// Locate servers for rows of a table.
pub trait RangeLocator: Send + Sync {
    /// Return the address of the server holding `row` of `table`.
    fn locate(&self, table: &TableIdentifier, row: &[u8]) -> Result<String>;

    /// Forget any cached location for `row` of `table`.
    fn invalidate(&self, table: &TableIdentifier, row: &[u8]);
}

/// Deliver update batches to servers.
pub trait RangeSender: Send + Sync {
    fn send(
        &self,
        addr: &str,
        table: &TableIdentifier,
        buffer: Vec<u8>,
        count: u32,
        flags: u32,
    ) -> Result<UpdateResponse>;
}

/// Mutation rejected by a server.
#[derive(Clone, Debug, PartialEq)]
pub struct FailedMutation {
    pub key: Key,
    pub value: Vec<u8>,
    pub error: i32,
}

#[derive(Default)]
struct SendBuffer {
    accum: Vec<u8>,
    count: u32,
}

// Outcome of sending one batch.
struct Sent {
    addr: String,
    buffer: Vec<u8>,
    res: Result<UpdateResponse>,
}

/// Buffer mutations of a table, scattering them across servers on flush.
pub struct ScatterBuffer {
    table: TableIdentifier,
    locator: Arc<dyn RangeLocator>,
    sender: Arc<dyn RangeSender>,
    counter: Arc<CompletionCounter>,

    buffers: BTreeMap<String, SendBuffer>,
    memory_used: usize,
    full: bool,

    flush_limit: usize,
    timeout: time::Duration,
    retry_interval: time::Duration,
    n_resends: usize,
}

impl ScatterBuffer {
    pub fn new(
        table: TableIdentifier,
        locator: Arc<dyn RangeLocator>,
        sender: Arc<dyn RangeSender>,
    ) -> ScatterBuffer {
        ScatterBuffer {
            table,
            locator,
            sender,
            counter: Arc::new(CompletionCounter::new()),

            buffers: BTreeMap::new(),
            memory_used: 0,
            full: false,

            flush_limit: FLUSH_LIMIT,
            timeout: TIMEOUT,
            retry_interval: RETRY_INTERVAL,
            n_resends: 0,
        }
    }

    pub fn set_flush_limit(&mut self, limit: usize) -> &mut Self {
        self.flush_limit = limit;
        self
    }

    pub fn set_timeout(&mut self, timeout: time::Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    pub fn set_retry_interval(&mut self, interval: time::Duration) -> &mut Self {
        self.retry_interval = interval;
        self
    }

    /// Buffer mutation `key`, `value` for the server holding its row.
    pub fn set(&mut self, key: &Key, value: &[u8]) -> Result<()> {
        let addr = self.locator.locate(&self.table, &key.row)?;
        let sb = self.buffers.entry(addr).or_insert_with(SendBuffer::default);
        self.memory_used += encode_mutation(&mut sb.accum, key, value)?;
        sb.count += 1;
        if sb.accum.len() > self.flush_limit {
            self.full = true;
        }
        Ok(())
    }

    /// Return true if a per server batch went beyond the flush limit.
    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn to_memory_used(&self) -> usize {
        self.memory_used
    }

    /// Number of resend rounds so far.
    pub fn to_resends(&self) -> usize {
        self.n_resends
    }

    /// Send all buffered mutations, resending those the servers asked to
    /// retry. Return mutations that failed for good.
    pub fn flush(&mut self, flags: u32) -> Result<Vec<FailedMutation>> {
        let deadline = time::Instant::now() + self.timeout;
        let mut failed = vec![];

        while !self.buffers.is_empty() {
            let retries = self.send(flags, &mut failed)?;
            if retries.is_empty() {
                break;
            }
            if time::Instant::now() + self.retry_interval >= deadline {
                warn!(
                    target: "rangesrv",
                    "{}, giving up on {} mutations after {} resends",
                    self.table, retries.len(), self.n_resends
                );
                failed.extend(retries.into_iter().map(|(key, value)| FailedMutation {
                    key,
                    value,
                    error: code::REQUEST_TIMEOUT,
                }));
                break;
            }

            self.n_resends += 1;
            thread::sleep(self.retry_interval);
            for (key, value) in retries.into_iter() {
                self.locator.invalidate(&self.table, &key.row);
                if let Err(err) = self.set(&key, &value) {
                    warn!(target: "rangesrv", "{}, relocate failed {}", self.table, err);
                    failed.push(FailedMutation {
                        key,
                        value,
                        error: err.to_code(),
                    });
                }
            }
        }

        self.memory_used = 0;
        Ok(failed)
    }

    // Send one round of batches, in parallel. Return mutations to resend.
    fn send(&mut self, flags: u32, failed: &mut Vec<FailedMutation>) -> Result<Vec<(Key, Vec<u8>)>> {
        let buffers = mem::take(&mut self.buffers);
        self.full = false;
        self.counter.set(buffers.len())?;

        let results: Arc<Mutex<Vec<Sent>>> = Arc::new(Mutex::new(vec![]));
        for (addr, sb) in buffers.into_iter() {
            let buffer = sort_by_row(&sb.accum)?;
            let (table, count) = (self.table.clone(), sb.count);
            let sender = Arc::clone(&self.sender);
            let counter = Arc::clone(&self.counter);
            let results = Arc::clone(&results);

            debug!(target: "rangesrv", "{}, sending {} mutations to {}", table, count, addr);
            let name = format!("scatter-{}", addr);
            let res = thread::Builder::new().name(name).spawn(move || {
                let res = sender.send(&addr, &table, buffer.clone(), count, flags);
                if let Ok(mut results) = results.lock() {
                    results.push(Sent { addr, buffer, res });
                }
                counter.decrement().ok();
            });
            err_at!(ThreadFail, res)?;
        }

        if !self.counter.wait_for_completion(self.timeout)? {
            err_at!(Timeout, msg: "{}, batches outstanding after {:?}", self.table, self.timeout)?
        }

        let sent = mem::take(&mut *err_at!(Fatal, results.lock())?);
        let mut retries = vec![];
        for Sent { addr, buffer, res } in sent.into_iter() {
            let (error, send_back) = match res {
                Ok(resp) if resp.error == code::OK => (code::OK, resp.send_back),
                Ok(resp) => (resp.error, vec![]),
                Err(err) => (err.to_code(), vec![]),
            };
            if error != code::OK {
                debug!(target: "rangesrv", "{}, {} rejected batch {}", self.table, addr, code::to_text(error));
                self.collect(error, &buffer, &mut retries, failed)?;
                continue;
            }
            for rec in send_back.into_iter() {
                let (start, end) = (rec.offset as usize, (rec.offset + rec.len) as usize);
                match buffer.get(start..end) {
                    Some(part) => self.collect(rec.error, part, &mut retries, failed)?,
                    None => err_at!(DecodeFail, msg: "{} send-back {} out of bounds", addr, rec)?,
                }
            }
        }
        Ok(retries)
    }

    fn collect(
        &self,
        error: i32,
        buf: &[u8],
        retries: &mut Vec<(Key, Vec<u8>)>,
        failed: &mut Vec<FailedMutation>,
    ) -> Result<()> {
        let retry = is_retryable_code(error);
        match retry {
            true => self.counter.set_retries()?,
            false => self.counter.set_errors()?,
        }
        for item in Mutations::new(buf) {
            let m = item?;
            let (key, value) = (m.key.clone(), m.value.to_vec());
            match retry {
                true => retries.push((key, value)),
                false => failed.push(FailedMutation { key, value, error }),
            }
        }
        Ok(())
    }
}

// Re-order mutations in `buf` by row, mutations to the same row keep their
// order.
fn sort_by_row(buf: &[u8]) -> Result<Vec<u8>> {
    let mut mutations: Vec<Mutation> = Mutations::new(buf).collect::<Result<Vec<Mutation>>>()?;
    mutations.sort_by(|a, b| a.key.row.cmp(&b.key.row));

    let mut out = Vec::with_capacity(buf.len());
    for m in mutations.iter() {
        out.extend_from_slice(&buf[m.offset..(m.offset + m.length)]);
    }
    Ok(out)
}

#[cfg(test)]
#[path = "mutator_test.rs"]
mod mutator_test;
