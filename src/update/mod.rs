//! Module implement the update pipeline's request and bookkeeping types.
//!
//! An [UpdateRequest] carries a buffer of serialized mutations for a
//! single table. The pipeline groups requests into an [UpdateContext],
//! partitions every request's mutations across the destination ranges,
//! logs them, applies them and answers each request through its
//! [ResponseSink]. Mutations that can't be applied are reported back as
//! [SendBackRec] records, identifying the rejected part of the request
//! buffer.

use std::{collections::BTreeMap, fmt, sync::mpsc, sync::Arc, time};

use crate::{
    range::{Range, TransferInfo},
    table::{RangeSpec, TableIdentifier, TableInfo},
    util, Error, Result,
};

mod pipeline;
mod qualify;

pub use pipeline::UpdatePipeline;

/// Don't sync the commit log for this request.
pub const NO_LOG_SYNC: u32 = 0x1;
/// Skip, instead of rejecting, mutations for unknown column families.
pub const IGNORE_UNKNOWN_CFS: u32 = 0x2;
/// Sync the commit log even if the request holds no mutations.
pub const FORCE_SYNC: u32 = 0x4;

/// Compose the payload for a commit log data block. Payload starts with
/// the table identifier followed by serialized mutations.
pub fn encode_commit_header(buf: &mut Vec<u8>, table: &TableIdentifier) -> Result<usize> {
    table.encode(buf)
}

/// Split commit log payload into table identifier and mutations.
pub fn decode_commit_payload(payload: &[u8]) -> Result<(TableIdentifier, &[u8])> {
    let mut buf = payload;
    let table = TableIdentifier::decode(&mut buf)?;
    Ok((table, buf))
}

/// Rejected mutations within a request buffer, `count` mutations starting
/// at byte `offset` spanning `len` bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendBackRec {
    pub error: i32,
    pub count: u32,
    pub offset: u32,
    pub len: u32,
}

impl fmt::Display for SendBackRec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}@{}+{}",
            crate::error::code::to_text(self.error),
            self.count,
            self.offset,
            self.len
        )
    }
}

impl SendBackRec {
    pub const LENGTH: usize = 16;

    pub fn new(error: i32, count: u32, offset: u32, len: u32) -> SendBackRec {
        SendBackRec {
            error,
            count,
            offset,
            len,
        }
    }
}

/// Add `rec` to the send-back vector, merging it into the last record when
/// both carry the same error and are contiguous.
pub fn push_send_back(recs: &mut Vec<SendBackRec>, rec: SendBackRec) {
    match recs.last_mut() {
        Some(last) if last.error == rec.error && (last.offset + last.len) == rec.offset => {
            last.count += rec.count;
            last.len += rec.len;
        }
        _ => recs.push(rec),
    }
}

/// Encode send-back vector as four little-endian i32 per record.
pub fn encode_send_back(recs: &[SendBackRec]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(recs.len() * SendBackRec::LENGTH);
    for rec in recs.iter() {
        util::encode_i32(&mut buf, rec.error);
        util::encode_i32(&mut buf, rec.count as i32);
        util::encode_i32(&mut buf, rec.offset as i32);
        util::encode_i32(&mut buf, rec.len as i32);
    }
    buf
}

pub fn decode_send_back(mut buf: &[u8]) -> Result<Vec<SendBackRec>> {
    if buf.len() % SendBackRec::LENGTH != 0 {
        err_at!(DecodeFail, msg: "send-back vector length {}", buf.len())?
    }
    let mut recs = vec![];
    while !buf.is_empty() {
        recs.push(SendBackRec {
            error: util::decode_i32(&mut buf)?,
            count: util::decode_i32(&mut buf)? as u32,
            offset: util::decode_i32(&mut buf)? as u32,
            len: util::decode_i32(&mut buf)? as u32,
        });
    }
    Ok(recs)
}

/// Answer to an [UpdateRequest]. A request level failure is reported in
/// `error`, partial failures in `send_back`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateResponse {
    pub id: u64,
    pub error: i32,
    pub message: String,
    pub send_back: Vec<SendBackRec>,
}

impl UpdateResponse {
    pub fn is_ok(&self) -> bool {
        self.error == crate::error::code::OK && self.send_back.is_empty()
    }

    /// Number of mutations rejected through send-back records.
    pub fn to_rejected(&self) -> u32 {
        self.send_back.iter().map(|r| r.count).sum()
    }
}

/// Continuation receiving the response for an update request.
pub trait ResponseSink: Send {
    fn respond(&self, resp: UpdateResponse) -> Result<()>;
}

impl ResponseSink for mpsc::Sender<UpdateResponse> {
    fn respond(&self, resp: UpdateResponse) -> Result<()> {
        err_at!(IPCFail, self.send(resp))
    }
}

/// Update request for `table`, holding `count` serialized mutations.
pub struct UpdateRequest {
    pub id: u64,
    pub table: TableIdentifier,
    pub buffer: Vec<u8>,
    pub count: u32,
    pub flags: u32,
    pub expire: time::Instant,
    pub sink: Box<dyn ResponseSink>,
}

impl fmt::Debug for UpdateRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "UpdateRequest<{},{},count:{},len:{},flags:{:#x}>",
            self.id,
            self.table,
            self.count,
            self.buffer.len(),
            self.flags
        )
    }
}

impl UpdateRequest {
    pub fn new(
        id: u64,
        table: TableIdentifier,
        buffer: Vec<u8>,
        count: u32,
        flags: u32,
        timeout: time::Duration,
        sink: Box<dyn ResponseSink>,
    ) -> UpdateRequest {
        UpdateRequest {
            id,
            table,
            buffer,
            count,
            flags,
            expire: time::Instant::now() + timeout,
            sink,
        }
    }

    pub fn is_expired(&self) -> bool {
        time::Instant::now() > self.expire
    }
}

// Request within a pipeline, along with its outcome so far.
pub(crate) struct RequestState {
    pub(crate) request: UpdateRequest,
    pub(crate) send_back: Vec<SendBackRec>,
    pub(crate) error: Option<Error>,
}

impl RequestState {
    fn new(request: UpdateRequest) -> RequestState {
        RequestState {
            request,
            send_back: vec![],
            error: None,
        }
    }

    pub(crate) fn reject(&mut self, error: i32, count: u32, offset: usize, len: usize) {
        let rec = SendBackRec::new(error, count, offset as u32, len as u32);
        push_send_back(&mut self.send_back, rec);
    }

    pub(crate) fn into_response(self) -> (Box<dyn ResponseSink>, UpdateResponse) {
        let (error, message) = match self.error {
            Some(err) => (err.to_code(), err.to_message()),
            None => (crate::error::code::OK, String::new()),
        };
        let resp = UpdateResponse {
            id: self.request.id,
            error,
            message,
            send_back: self.send_back,
        };
        (self.request.sink, resp)
    }
}

/// Stamped mutations for a range, `len` bytes at `offset` of the table's
/// commit buffer, or of the range's transfer buffer when `transfer` is
/// set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateRecRange {
    pub request: usize,
    pub offset: usize,
    pub len: usize,
    pub count: usize,
    pub transfer: bool,
}

/// All updates in a context destined to one range.
pub struct UpdateRecRangeList {
    pub range: Arc<Range>,
    pub spec: RangeSpec,
    pub transfer: Option<TransferInfo>,
    /// Stamped mutations for rows being transferred, prefixed with the
    /// commit header.
    pub transfer_buf: Vec<u8>,
    pub transfer_buf_reset_offset: usize,
    pub updates: Vec<UpdateRecRange>,
    pub starting_update_count: usize,
    pub starting_revision: i64,
    /// Latest revision assigned to this range in this context.
    pub latest_revision: i64,
    pub last_request: Option<usize>,
    /// Update lease held on the range, released after apply.
    pub leased: bool,
    pub error: Option<Error>,
}

impl UpdateRecRangeList {
    pub(crate) fn new(range: Arc<Range>, spec: RangeSpec) -> UpdateRecRangeList {
        let latest_revision = range.to_latest_revision();
        UpdateRecRangeList {
            range,
            spec,
            transfer: None,
            transfer_buf: vec![],
            transfer_buf_reset_offset: 0,
            updates: vec![],
            starting_update_count: 0,
            starting_revision: latest_revision,
            latest_revision,
            last_request: None,
            leased: false,
            error: None,
        }
    }

    // Mark the start of request `index`'s contribution to this list.
    pub(crate) fn begin_request(&mut self, index: usize) {
        if self.last_request != Some(index) {
            self.last_request = Some(index);
            self.starting_update_count = self.updates.len();
            self.transfer_buf_reset_offset = self.transfer_buf.len();
            self.starting_revision = self.latest_revision;
        }
    }

    /// Drop everything added on behalf of request `index`.
    pub fn reset_updates(&mut self, index: usize) {
        if self.last_request == Some(index) {
            self.updates.truncate(self.starting_update_count);
            self.transfer_buf.truncate(self.transfer_buf_reset_offset);
            self.latest_revision = self.starting_revision;
        }
    }

    // Record `count` mutations at `offset`, extending the last record when
    // contiguous within the same request and buffer.
    pub(crate) fn add_update(&mut self, request: usize, offset: usize, len: usize, transfer: bool) {
        match self.updates.last_mut() {
            Some(last)
                if last.request == request
                    && last.transfer == transfer
                    && (last.offset + last.len) == offset =>
            {
                last.len += len;
                last.count += 1;
            }
            _ => self.updates.push(UpdateRecRange {
                request,
                offset,
                len,
                count: 1,
                transfer,
            }),
        }
    }

    /// Return true if the transfer buffer holds mutations.
    pub fn has_transfer_updates(&self) -> bool {
        self.updates.iter().any(|u| u.transfer)
    }
}

/// Bookkeeping for all requests of one table within a context.
pub struct UpdateRecTable {
    pub table: TableIdentifier,
    pub info: Option<Arc<TableInfo>>,
    pub(crate) requests: Vec<RequestState>,
    /// Range lists keyed by the range's end row.
    pub range_lists: BTreeMap<Vec<u8>, UpdateRecRangeList>,
    /// Stamped mutations for the commit log, prefixed with the commit
    /// header.
    pub go_buf: Vec<u8>,
    pub go_buf_reset_offset: usize,
    /// Latest revision in `go_buf`.
    pub go_revision: i64,
    /// (mutations, bytes) accepted.
    pub totals: (usize, usize),
    pub commit_interval: time::Duration,
    pub flags: u32,
    pub error: Option<Error>,
    pub system: bool,
}

impl UpdateRecTable {
    pub(crate) fn new(table: TableIdentifier, commit_interval: time::Duration) -> UpdateRecTable {
        let system = table.is_system();
        UpdateRecTable {
            table,
            info: None,
            requests: vec![],
            range_lists: BTreeMap::new(),
            go_buf: vec![],
            go_buf_reset_offset: 0,
            go_revision: crate::clock::REVISION_NULL,
            totals: (0, 0),
            commit_interval,
            flags: 0,
            error: None,
            system,
        }
    }

    /// Return true if commit buffer holds mutations beyond its header.
    pub fn has_commit_updates(&self) -> bool {
        self.range_lists
            .values()
            .any(|rl| rl.updates.iter().any(|u| !u.transfer))
    }

    pub fn needs_sync(&self) -> bool {
        (self.flags & FORCE_SYNC) != 0
            || (self.has_commit_updates() && (self.flags & NO_LOG_SYNC) == 0)
    }

    /// Fail every request in this table with `err`.
    pub fn fail(&mut self, err: &Error) {
        for req in self.requests.iter_mut() {
            if req.error.is_none() {
                req.error = Some(err.clone())
            }
        }
        self.error = Some(err.clone());
    }
}

/// Batch of requests moving through the pipeline together.
pub struct UpdateContext {
    pub tables: Vec<UpdateRecTable>,
    pub total_bytes: usize,
    pub commit_interval: time::Duration,
    pub expire: time::Instant,
}

impl UpdateContext {
    pub(crate) fn new() -> UpdateContext {
        UpdateContext {
            tables: vec![],
            total_bytes: 0,
            commit_interval: time::Duration::from_secs(0),
            expire: time::Instant::now(),
        }
    }

    pub fn to_request_count(&self) -> usize {
        self.tables.iter().map(|t| t.requests.len()).sum()
    }

    pub fn needs_sync(&self) -> bool {
        self.tables.iter().any(|t| t.needs_sync())
    }
}
