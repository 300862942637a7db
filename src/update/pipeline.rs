//! Module implement the three stage update pipeline.
//!
//! ```text
//! submit -> [qualify] -> [commit] -> [respond] -> ResponseSink
//! ```
//!
//! * qualify, coalesce pending requests into a context, partition them
//!   across ranges and stamp revisions.
//! * commit, append contexts to commit logs and sync once per group.
//! * respond, apply mutations to ranges, release update leases and
//!   answer requests.
//!
//! Each stage is a single thread, hence contexts leave every stage in the
//! order they entered it, and revision order, log order and apply order
//! are the same.

use log::{debug, error, info, warn};

use std::{
    sync::{mpsc, Arc},
    thread, time,
};

use crate::{
    commit_log::CommitLog,
    context::Context,
    key::{Flag, Mutations},
    range::maintenance::{self, Msg},
    update::{
        qualify::qualify, UpdateContext, UpdateRecRangeList, UpdateRecTable, UpdateRequest,
        UpdateResponse, FORCE_SYNC,
    },
    util::thread::{Rx, Thread, Tx},
    Error, Result,
};

/// Update pipeline, shutdown with [UpdatePipeline::close].
pub struct UpdatePipeline {
    // fields are dropped in declaration order, upstream stages first.
    qualify: Thread<UpdateRequest, (), ()>,
    commit: Thread<UpdateContext, (), ()>,
    respond: Thread<UpdateContext, (), ()>,
}

impl UpdatePipeline {
    /// Start pipeline stages. When `scheduler` is supplied, ranges found
    /// needing maintenance after an update trigger a maintenance check.
    pub fn new(ctx: Arc<Context>, scheduler: Option<Tx<Msg, ()>>) -> Result<UpdatePipeline> {
        let respond = {
            let ctx = Arc::clone(&ctx);
            Thread::new("update-respond", move |rx: Rx<UpdateContext, ()>| {
                move || respond_loop(ctx, rx, scheduler)
            })?
        };
        let commit = {
            let (ctx, tx) = (Arc::clone(&ctx), respond.to_tx()?);
            Thread::new("update-commit", move |rx: Rx<UpdateContext, ()>| {
                move || commit_loop(ctx, rx, tx)
            })?
        };
        let qualify = {
            let (ctx, tx) = (Arc::clone(&ctx), commit.to_tx()?);
            Thread::new("update-qualify", move |rx: Rx<UpdateRequest, ()>| {
                move || qualify_loop(ctx, rx, tx)
            })?
        };

        info!(target: "pipeline", "update pipeline started");
        Ok(UpdatePipeline {
            qualify,
            commit,
            respond,
        })
    }

    /// Submit a request, its response is delivered through the request's
    /// sink. Empty requests are answered right away, unless they ask for a
    /// sync.
    pub fn submit(&self, request: UpdateRequest) -> Result<()> {
        if request.buffer.is_empty() && (request.flags & FORCE_SYNC) == 0 {
            let resp = UpdateResponse {
                id: request.id,
                ..UpdateResponse::default()
            };
            return request.sink.respond(resp);
        }
        self.qualify.to_tx()?.post(request)
    }

    /// Drain in-flight requests and stop all stages.
    pub fn close(self) -> Result<()> {
        self.qualify.join()?;
        self.commit.join()?;
        self.respond.join()?;
        info!(target: "pipeline", "update pipeline stopped");
        Ok(())
    }
}

fn qualify_loop(ctx: Arc<Context>, rx: Rx<UpdateRequest, ()>, tx: Tx<UpdateContext, ()>) {
    let limit = ctx.config.coalesce_limit;
    while let Ok((request, _)) = rx.recv() {
        let mut bytes = request.buffer.len();
        let mut requests = vec![request];
        while bytes < limit {
            match rx.try_recv() {
                Ok((request, _)) => {
                    bytes += request.buffer.len();
                    requests.push(request);
                }
                Err(_) => break,
            }
        }

        let uc = qualify(&ctx, requests);
        debug!(
            target: "pipeline",
            "qualified {} requests {} bytes", uc.to_request_count(), uc.total_bytes
        );
        if let Err(err) = tx.post(uc) {
            error!(target: "pipeline", "qualify, commit stage gone {}", err);
            break;
        }
    }
}

fn commit_loop(ctx: Arc<Context>, rx: Rx<UpdateContext, ()>, tx: Tx<UpdateContext, ()>) {
    let limit = ctx.config.coalesce_limit;
    while let Ok((uc, _)) = rx.recv() {
        let mut deadline = time::Instant::now() + uc.commit_interval;
        let mut bytes = uc.total_bytes;
        let mut group = vec![uc];

        // group contexts, waiting for more only when a sync is due.
        while bytes < limit {
            let wait = group.iter().any(|uc| uc.needs_sync());
            let now = time::Instant::now();
            let res = match wait && now < deadline {
                true => rx.recv_timeout(deadline - now),
                false => rx.try_recv().map_err(|_| mpsc::RecvTimeoutError::Timeout),
            };
            match res {
                Ok((uc, _)) => {
                    bytes += uc.total_bytes;
                    deadline = std::cmp::min(deadline, now + uc.commit_interval);
                    group.push(uc);
                }
                Err(_) => break,
            }
        }

        commit_group(&ctx, &mut group);

        for uc in group.into_iter() {
            if let Err(err) = tx.post(uc) {
                error!(target: "pipeline", "commit, respond stage gone {}", err);
                return;
            }
        }
    }
}

// Append every context in `group` to its commit logs and sync once.
fn commit_group(ctx: &Context, group: &mut [UpdateContext]) {
    let cluster_id = ctx.config.cluster_id;
    let (mut user_sync, mut system_sync) = (false, false);
    let mut transfer_logs: Vec<Arc<CommitLog>> = vec![];

    for uc in group.iter_mut() {
        for rec in uc.tables.iter_mut().filter(|rec| rec.error.is_none()) {
            if rec.has_commit_updates() {
                let log = ctx.to_commit_log(&rec.table);
                if let Err(err) = log.append(cluster_id, &rec.go_buf, rec.go_revision, rec.system) {
                    error!(target: "pipeline", "{}, commit log append {}", rec.table, err);
                    fail_table(rec, &err);
                    continue;
                }
            }
            if rec.needs_sync() {
                match rec.system {
                    true => system_sync = true,
                    false => user_sync = true,
                }
            }
            if let Err(err) = append_transfers(cluster_id, rec, &mut transfer_logs) {
                error!(target: "pipeline", "{}, transfer log append {}", rec.table, err);
                fail_table(rec, &err);
            }
        }
    }

    let config = &ctx.config;
    let mut attempt = 0;
    loop {
        let res = sync_logs(ctx, user_sync, system_sync, &transfer_logs);
        match res {
            Ok(()) => break,
            Err(err) if attempt < config.sync_retry_limit => {
                attempt += 1;
                warn!(target: "pipeline", "sync attempt {} failed {}", attempt, err);
                thread::sleep(config.sync_retry_interval);
            }
            Err(err) => {
                error!(target: "pipeline", "sync failed after {} attempts {}", attempt, err);
                for uc in group.iter_mut() {
                    for rec in uc.tables.iter_mut().filter(|rec| rec.error.is_none()) {
                        fail_table(rec, &err);
                    }
                }
                break;
            }
        }
    }
}

fn append_transfers(
    cluster_id: u64,
    rec: &UpdateRecTable,
    logs: &mut Vec<Arc<CommitLog>>,
) -> Result<()> {
    for rl in rec.range_lists.values().filter(|rl| rl.has_transfer_updates()) {
        if let Some(transfer) = rl.transfer.as_ref() {
            transfer
                .log
                .append(cluster_id, &rl.transfer_buf, rl.latest_revision, false)?;
            if !logs.iter().any(|log| Arc::ptr_eq(log, &transfer.log)) {
                logs.push(Arc::clone(&transfer.log))
            }
        }
    }
    Ok(())
}

fn sync_logs(
    ctx: &Context,
    user_sync: bool,
    system_sync: bool,
    transfer_logs: &[Arc<CommitLog>],
) -> Result<()> {
    if user_sync {
        ctx.user_log.sync()?;
    }
    if system_sync {
        ctx.system_log.sync()?;
    }
    for log in transfer_logs.iter() {
        log.sync()?;
    }
    Ok(())
}

// Commit failure, fail every request of the table and mark its ranges
// unavailable.
fn fail_table(rec: &mut UpdateRecTable, err: &Error) {
    rec.fail(err);
    for rl in rec.range_lists.values().filter(|rl| !rl.updates.is_empty()) {
        rl.range.mark_unavailable(err).ok();
    }
}

fn respond_loop(ctx: Arc<Context>, rx: Rx<UpdateContext, ()>, scheduler: Option<Tx<Msg, ()>>) {
    while let Ok((uc, _)) = rx.recv() {
        let check = respond(&ctx, uc);
        if let (true, Some(scheduler)) = (check, scheduler.as_ref()) {
            scheduler.post(Msg::Check).ok();
        }
    }
}

// Apply and answer all requests in `uc`, return true if any of the
// updated ranges needs maintenance.
fn respond(ctx: &Context, uc: UpdateContext) -> bool {
    let mut check = false;

    for rec in uc.tables.into_iter() {
        let UpdateRecTable {
            table,
            mut requests,
            range_lists,
            go_buf,
            error,
            ..
        } = rec;

        for rl in range_lists.values() {
            if error.is_none() && rl.error.is_none() {
                for (index, err) in apply(ctx, &table.id, &go_buf, rl).into_iter() {
                    if let Some(req) = requests.get_mut(index) {
                        req.error.get_or_insert(err);
                    }
                }
                match maintenance::needs_maintenance(ctx, &rl.range) {
                    Ok(flags) if !flags.is_empty() => check = true,
                    _ => (),
                }
            }
            if rl.leased {
                if let Err(err) = rl.range.decrement_update_counter() {
                    error!(target: "pipeline", "{}, releasing lease {}", rl.range, err);
                }
            }
        }

        for mut req in requests.into_iter() {
            if req.error.is_none() && req.request.is_expired() {
                let err: Result<()> = err_at!(Timeout, msg: "request {}", req.request.id);
                req.error = err.err();
            }
            let (sink, resp) = req.into_response();
            if let Err(err) = sink.respond(resp) {
                warn!(target: "pipeline", "{}, respond {}", table, err);
            }
        }
    }

    check
}

// Add stamped mutations to the range and invalidate cached queries for
// the updated rows. Return failed requests.
fn apply(
    ctx: &Context,
    table_id: &str,
    go_buf: &[u8],
    rl: &UpdateRecRangeList,
) -> Vec<(usize, Error)> {
    let mut failed = vec![];
    for update in rl.updates.iter() {
        let buf = match update.transfer {
            true => &rl.transfer_buf[update.offset..(update.offset + update.len)],
            false => &go_buf[update.offset..(update.offset + update.len)],
        };
        if let Err(err) = rl.range.add_mutations(buf, false) {
            error!(target: "pipeline", "{}, apply {}", rl.range, err);
            rl.range.mark_unavailable(&err).ok();
            failed.push((update.request, err));
            continue;
        }
        if let Some(cache) = ctx.query_cache.as_ref() {
            for m in Mutations::new(buf).filter_map(|m| m.ok()) {
                let families = match m.key.flag {
                    Flag::DeleteRow => vec![],
                    _ => vec![m.key.family],
                };
                cache.invalidate(table_id, &m.key.row, &families).ok();
            }
        }
    }
    failed
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
