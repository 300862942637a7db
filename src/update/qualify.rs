//! First pipeline stage, qualify requests and partition their mutations
//! across ranges, assigning revisions on the way.

use log::{debug, warn};

use std::{collections::BTreeMap, sync::Arc, thread};

use crate::{
    clock::wall_clock_nanos,
    context::Context,
    error::code,
    key::{encode_mutation, stamp_revision, Flag, Mutation, Mutations},
    range::Range,
    table::{RangeSpec, Schema, TableInfo},
    update::{
        encode_commit_header, RequestState, UpdateContext, UpdateRecRangeList, UpdateRecTable,
        UpdateRequest, IGNORE_UNKNOWN_CFS,
    },
    Error, Result,
};

// Attempts to locate a range whose boundary moved under a lookup.
const LOCATE_ATTEMPTS: usize = 3;

/// Group `requests` by table, in arrival order, and qualify them.
pub(crate) fn qualify(ctx: &Context, requests: Vec<UpdateRequest>) -> UpdateContext {
    let mut uc = UpdateContext::new();
    uc.expire = requests
        .iter()
        .map(|r| r.expire)
        .min()
        .unwrap_or(uc.expire);

    for request in requests.into_iter() {
        uc.total_bytes += request.buffer.len();
        let pos = uc.tables.iter().position(|t| t.table == request.table);
        let rec = match pos {
            Some(pos) => &mut uc.tables[pos],
            None => {
                let rec = UpdateRecTable::new(request.table.clone(), ctx.config.commit_interval);
                uc.tables.push(rec);
                let n = uc.tables.len();
                &mut uc.tables[n - 1]
            }
        };
        rec.flags |= request.flags;
        rec.requests.push(RequestState::new(request));
    }

    for rec in uc.tables.iter_mut() {
        if let Err(err) = qualify_table(ctx, rec) {
            warn!(target: "pipeline", "{}, qualify failed {}", rec.table, err);
            rec.fail(&err);
        }
    }
    uc.commit_interval = uc
        .tables
        .iter()
        .map(|t| t.commit_interval)
        .min()
        .unwrap_or(ctx.config.commit_interval);
    uc
}

fn qualify_table(ctx: &Context, rec: &mut UpdateRecTable) -> Result<()> {
    if !rec.system && ctx.state.to_snapshot()?.readonly {
        err_at!(ReadOnly, msg: "rejecting updates to {}", rec.table)?
    }
    let info = match ctx.tables.get(&rec.table.id)? {
        Some(info) => info,
        None => err_at!(TableNotFound, msg: "{}", rec.table)?,
    };
    let schema = info.to_schema()?;
    if schema.generation != rec.table.generation {
        err_at!(
            GenerationMismatch,
            msg: "{} schema generation {}", rec.table, schema.generation
        )?
    }

    encode_commit_header(&mut rec.go_buf, &rec.table)?;

    let UpdateRecTable {
        table,
        requests,
        range_lists,
        go_buf,
        go_buf_reset_offset,
        go_revision,
        totals,
        ..
    } = &mut *rec;

    for (index, req) in requests.iter_mut().enumerate() {
        *go_buf_reset_offset = go_buf.len();
        let mut q = Qualifier {
            ctx,
            info: &info,
            schema: &schema,
            range_lists: &mut *range_lists,
            go_buf: &mut *go_buf,
            go_revision: &mut *go_revision,
        };
        match q.qualify_request(index, req) {
            Ok((n, bytes)) => {
                totals.0 += n;
                totals.1 += bytes;
            }
            Err(err) => {
                debug!(target: "pipeline", "{}, request {} aborted {}", table, req.request.id, err);
                go_buf.truncate(*go_buf_reset_offset);
                for rl in range_lists.values_mut() {
                    rl.reset_updates(index);
                }
                req.send_back.clear();
                req.error = Some(err);
            }
        }
    }

    for rl in range_lists.values() {
        rl.range.observe_revision(rl.latest_revision);
    }
    rec.info = Some(info);
    Ok(())
}

struct Qualifier<'a> {
    ctx: &'a Context,
    info: &'a TableInfo,
    schema: &'a Schema,
    range_lists: &'a mut BTreeMap<Vec<u8>, UpdateRecRangeList>,
    go_buf: &'a mut Vec<u8>,
    go_revision: &'a mut i64,
}

impl<'a> Qualifier<'a> {
    // Return (accepted-mutations, accepted-bytes). Error aborts the whole
    // request, caller shall undo its partial work.
    fn qualify_request(&mut self, index: usize, req: &mut RequestState) -> Result<(usize, usize)> {
        let buffer = std::mem::take(&mut req.request.buffer);
        let res = self.qualify_mutations(index, req, &buffer);
        req.request.buffer = buffer;
        res
    }

    fn qualify_mutations(
        &mut self,
        index: usize,
        req: &mut RequestState,
        buffer: &[u8],
    ) -> Result<(usize, usize)> {
        let mutations: Vec<Mutation> = Mutations::new(buffer).collect::<Result<Vec<Mutation>>>()?;
        if mutations.len() != (req.request.count as usize) {
            err_at!(
                DecodeFail,
                msg: "request {} count {} != {}", req.request.id, req.request.count, mutations.len()
            )?
        }

        let skew = self.ctx.config.max_clock_skew.as_nanos() as i64;
        let ignore_unknown_cfs = (req.request.flags & IGNORE_UNKNOWN_CFS) != 0;
        let (mut n, mut bytes) = (0, 0);

        for (i, m) in mutations.iter().enumerate() {
            if m.key.row.first().map(|b| *b == 0).unwrap_or(true) {
                let remaining = (mutations.len() - i) as u32;
                req.reject(code::BAD_KEY, remaining, m.offset, buffer.len() - m.offset);
                break;
            }
            if m.key.flag != Flag::DeleteRow && self.schema.to_family(m.key.family).is_none() {
                if !ignore_unknown_cfs {
                    req.reject(code::RANGESERVER_INVALID_COLUMNFAMILY, 1, m.offset, m.length);
                }
                continue;
            }

            let rl = match locate(self.ctx, self.info, &mut *self.range_lists, &m.key.row) {
                Ok(rl) => rl,
                Err(err) => {
                    req.reject(err.to_code(), 1, m.offset, m.length);
                    continue;
                }
            };
            rl.begin_request(index);

            let now = wall_clock_nanos();
            if rl.latest_revision > now.saturating_add(skew) {
                err_at!(
                    ClockSkew,
                    msg: "{} revision {} ahead of clock {}", rl.range, rl.latest_revision, now
                )?
            }
            let revision = match m.key.revision {
                Some(revision) if revision < rl.latest_revision => err_at!(
                    RevisionOrder,
                    msg: "{} supplied revision {} < {}", rl.range, revision, rl.latest_revision
                )?,
                Some(revision) => revision,
                None => {
                    self.ctx.clock.observe(rl.latest_revision);
                    self.ctx.clock.next()
                }
            };
            rl.latest_revision = std::cmp::max(rl.latest_revision, revision);

            let mut key = m.key.clone();
            stamp_revision(&mut key, revision);

            let transferring = rl
                .transfer
                .as_ref()
                .map(|t| t.transferring(&key.row))
                .unwrap_or(false);
            if transferring {
                let offset = rl.transfer_buf.len();
                let len = encode_mutation(&mut rl.transfer_buf, &key, m.value)?;
                rl.add_update(index, offset, len, true);
            } else {
                let offset = self.go_buf.len();
                let len = encode_mutation(self.go_buf, &key, m.value)?;
                rl.add_update(index, offset, len, false);
                *self.go_revision = std::cmp::max(*self.go_revision, revision);
            }
            n += 1;
            bytes += m.length;
        }

        Ok((n, bytes))
    }
}

// Return the range list for `row`, creating it, and taking the update lease
// on its range, if missing. Failures to lease a range are remembered, so
// that subsequent mutations to the range fail fast.
fn locate<'b>(
    ctx: &Context,
    info: &TableInfo,
    range_lists: &'b mut BTreeMap<Vec<u8>, UpdateRecRangeList>,
    row: &[u8],
) -> Result<&'b mut UpdateRecRangeList> {
    let found = range_lists
        .iter()
        .find(|(_, rl)| rl.spec.contains(row))
        .map(|(end_row, _)| end_row.clone());
    if let Some(end_row) = found {
        return match range_lists.get_mut(&end_row) {
            Some(rl) => match rl.error.as_ref() {
                Some(err) => Err(err.clone()),
                None => Ok(rl),
            },
            None => err_at!(Fatal, msg: "missing range list"),
        };
    }

    for _ in 0..LOCATE_ATTEMPTS {
        let (range, spec) = match info.find_containing_range(row)? {
            Some(item) => item,
            None => err_at!(
                OutOfRange,
                msg: "{} row {:?}", info.to_id(), String::from_utf8_lossy(row)
            )?,
        };
        if let Some(err) = range.to_error()? {
            return insert_failed(range_lists, range, spec, err);
        }
        if let Err(err) = take_lease(ctx, &range) {
            return insert_failed(range_lists, range, spec, err);
        }

        // boundaries could have moved before the lease was granted.
        let spec = range.to_spec()?;
        if !spec.contains(row) {
            range.decrement_update_counter()?;
            continue;
        }

        let mut rl = UpdateRecRangeList::new(range, spec.clone());
        rl.leased = true;
        rl.transfer = rl.range.to_transfer()?;
        if rl.transfer.is_some() {
            encode_commit_header(&mut rl.transfer_buf, &rl.range.to_table())?;
        }
        range_lists.insert(spec.end_row.clone(), rl);
        return match range_lists.get_mut(&spec.end_row) {
            Some(rl) => Ok(rl),
            None => err_at!(Fatal, msg: "missing range list"),
        };
    }

    err_at!(RangeBusy, msg: "{} row boundaries keep moving", info.to_id())
}

fn insert_failed<'b>(
    range_lists: &'b mut BTreeMap<Vec<u8>, UpdateRecRangeList>,
    range: Arc<Range>,
    spec: RangeSpec,
    err: Error,
) -> Result<&'b mut UpdateRecRangeList> {
    debug!(target: "pipeline", "{}, {}", range, err);
    let mut rl = UpdateRecRangeList::new(range, spec.clone());
    rl.error = Some(err.clone());
    range_lists.insert(spec.end_row, rl);
    Err(err)
}

// Take update lease on `range`, retrying while maintenance holds it.
fn take_lease(ctx: &Context, range: &Range) -> Result<()> {
    let config = &ctx.config;
    let mut attempt = 0;
    loop {
        match range.increment_update_counter() {
            Ok(()) => break Ok(()),
            Err(Error::RangeBusy(p, m)) if attempt >= config.busy_retry_limit => {
                break Err(Error::RangeBusy(p, m))
            }
            Err(Error::RangeBusy(_, _)) => {
                attempt += 1;
                thread::sleep(config.busy_retry_interval);
            }
            Err(err) => break Err(err),
        }
    }
}
