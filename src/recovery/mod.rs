//! Module implement commit log replay and phantom range recovery.
//!
//! When a server fails, the master assigns its ranges to surviving
//! servers and drives each of them through a two phase handoff:
//!
//! * `load`, create a phantom range, and its phantom log, for every range
//!   of the failed server assigned to this server.
//! * `update`, receive the failed server's commit log, fragment by
//!   fragment. A completed fragment is logged to the phantom log and
//!   applied to the phantom range.
//! * `prepare`, link phantom logs into the local commit logs.
//! * `commit`, make the phantom ranges live.
//!
//! Completion of prepare and commit is notified to the master through
//! [MasterClient]. Every step can be retried by the master, repeating a
//! step that already completed is harmless.

use log::{debug, error, info, warn};

use std::{
    collections::{BTreeMap, HashMap},
    fmt, fs, path,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    clock::REVISION_NULL,
    commit_log::{self, CommitLogBase, CommitLogReader},
    context::Context,
    key::{encode_mutation, Mutations},
    range::Range,
    table::{RangeSpec, TableIdentifier},
    Result,
};

pub mod params;
pub mod phantom;
pub mod transfer;

use params::{CompleteParams, PhantomCommitComplete, PhantomPrepareComplete, PhantomUpdate};
use phantom::{PhantomRange, PhantomRangeMap, PhantomState};

/// Replay mutations, falling within `range`, from commit log at `log_dir`.
/// Mutations already present in the range are skipped. Return the number
/// of cells added.
pub fn replay_into_range(
    log_dir: &path::Path,
    config: commit_log::Config,
    range: &Range,
) -> Result<usize> {
    let table = range.to_table();
    let spec = range.to_spec()?;
    let mut reader = CommitLogReader::open(log_dir, config)?;

    let (mut n, mut buf) = (0, vec![]);
    while let Some(block) = reader.next_block()? {
        let (tid, payload) = crate::update::decode_commit_payload(&block.payload)?;
        if tid.id != table.id {
            continue;
        }
        buf.clear();
        for item in Mutations::new(payload) {
            let m = item?;
            if spec.contains(&m.key.row) {
                encode_mutation(&mut buf, &m.key, m.value)?;
            }
        }
        if !buf.is_empty() {
            n += range.add_mutations(&buf, true)?;
        }
    }

    debug!(target: "recovery", "{}, replayed {} cells from {:?}", range, n, log_dir);
    Ok(n)
}

/// Replay commit log at `log_dir` into live ranges of `ctx`, typically
/// after a restart. Mutations for unknown tables or rows outside loaded
/// ranges are skipped. The revision clock is advanced past every replayed
/// block. Return the number of cells added.
pub fn replay_commit_log(ctx: &Context, log_dir: &path::Path) -> Result<usize> {
    let mut reader = CommitLogReader::open(log_dir, ctx.config.commit_log.clone())?;

    let (mut n, mut skipped) = (0, 0);
    while let Some(block) = reader.next_block()? {
        ctx.clock.observe(block.header.revision);

        let (table, payload) = crate::update::decode_commit_payload(&block.payload)?;
        let info = match ctx.tables.get(&table.id)? {
            Some(info) => info,
            None => {
                skipped += Mutations::new(payload).count();
                continue;
            }
        };

        // bucket mutations per range, preserving log order.
        let mut buckets: BTreeMap<Vec<u8>, (Arc<Range>, Vec<u8>)> = BTreeMap::new();
        for item in Mutations::new(payload) {
            let m = item?;
            match info.find_containing_range(&m.key.row)? {
                Some((range, spec)) => {
                    let (_, buf) = buckets.entry(spec.end_row).or_insert((range, vec![]));
                    encode_mutation(buf, &m.key, m.value)?;
                }
                None => skipped += 1,
            }
        }
        for (_, (range, buf)) in buckets.into_iter() {
            n += range.add_mutations(&buf, true)?;
        }
    }

    let (blocks, truncated, corrupt) = reader.to_stats();
    info!(
        target: "recovery",
        "{:?}, replayed {} cells from {} blocks, skipped {} truncated:{} corrupt:{}",
        log_dir, n, blocks, skipped, truncated, corrupt
    );
    Ok(n)
}

/// Adopt transfer logs of `table` left behind by an earlier run. Split
/// transfer logs not yet linked into the commit log are replayed into
/// live ranges and then linked, or removed when empty. Phantom logs not
/// yet linked belong to an unfinished recovery and are removed, the
/// master restarts that recovery. Return the number of cells replayed.
pub fn recover_transfer_logs(ctx: &Context, table: &TableIdentifier) -> Result<usize> {
    let log = ctx.to_commit_log(table);
    let linked = log.to_linked_logs()?;

    let mut n = 0;
    for (log_dir, name) in transfer::list_transfer_logs(&ctx.config.dir, &table.id)? {
        if linked.contains(&log_dir) {
            continue;
        }
        match name {
            transfer::TransferLogName::Split { .. } => {
                n += replay_commit_log(ctx, &log_dir)?;
                let mut reader = CommitLogReader::open(&log_dir, ctx.config.commit_log.clone())?;
                reader.scan()?;
                match reader.to_latest_revision() {
                    REVISION_NULL => remove_log(&log_dir),
                    _ => log.link_log(ctx.config.cluster_id, &reader)?,
                }
                info!(target: "recovery", "{}, adopted transfer log {:?}", table, log_dir);
            }
            transfer::TransferLogName::Phantom { op_id, .. } => {
                warn!(
                    target: "recovery",
                    "{}, removing phantom log {:?} of op:{}", table, log_dir, op_id
                );
                remove_log(&log_dir);
            }
        }
    }
    Ok(n)
}

/// Master side of the recovery handoff.
pub trait MasterClient: Send + Sync {
    fn phantom_prepare_complete(&self, params: PhantomPrepareComplete) -> Result<()>;

    fn phantom_commit_complete(&self, params: PhantomCommitComplete) -> Result<()>;
}

/// Range of a table, as addressed by the master.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QualifiedRangeSpec {
    pub table: TableIdentifier,
    pub spec: RangeSpec,
}

impl fmt::Display for QualifiedRangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", self.table.id, self.spec)
    }
}

impl QualifiedRangeSpec {
    pub fn new(table: TableIdentifier, spec: RangeSpec) -> QualifiedRangeSpec {
        QualifiedRangeSpec { table, spec }
    }
}

/// Phantom range recovery, for any number of failed servers, keyed by
/// the failed server's location.
pub struct Recovery {
    master: Arc<dyn MasterClient>,
    maps: Mutex<HashMap<String, PhantomRangeMap>>,
}

impl Recovery {
    pub fn new(master: Arc<dyn MasterClient>) -> Recovery {
        Recovery {
            master,
            maps: Mutex::new(HashMap::new()),
        }
    }

    fn lock_maps(&self) -> Result<MutexGuard<HashMap<String, PhantomRangeMap>>> {
        err_at!(Fatal, self.maps.lock())
    }

    /// Return the plan generation and phantom ranges under recovery for
    /// failed server `location`.
    pub fn to_status(&self, location: &str) -> Result<Option<(i32, Vec<PhantomState>)>> {
        let mut maps = self.lock_maps()?;
        let status = maps.get_mut(location).map(|map| {
            let states = map.iter_mut().map(|p| p.to_state()).collect();
            (map.plan_generation, states)
        });
        Ok(status)
    }

    /// Load phantom ranges `specs` of failed server `location`, expecting
    /// commit log `fragments`. Loads from an older plan generation are
    /// ignored, a newer plan generation discards ranges loaded so far.
    /// Ranges already live on this server are skipped.
    pub fn load(
        &self,
        ctx: &Context,
        op_id: i64,
        location: &str,
        plan_generation: i32,
        fragments: &[u32],
        specs: &[QualifiedRangeSpec],
    ) -> Result<()> {
        info!(
            target: "recovery",
            "phantom load op:{} location:{} plan:{} fragments:{} ranges:{}",
            op_id, location, plan_generation, fragments.len(), specs.len()
        );

        let mut maps = self.lock_maps()?;
        let map = maps
            .entry(location.to_string())
            .or_insert_with(|| PhantomRangeMap::new(op_id, plan_generation));

        if plan_generation < map.plan_generation {
            warn!(
                target: "recovery",
                "{}, ignoring load for stale plan {} < {}",
                location, plan_generation, map.plan_generation
            );
            return Ok(());
        } else if plan_generation > map.plan_generation {
            info!(
                target: "recovery",
                "{}, plan {} replaces plan {}", location, plan_generation, map.plan_generation
            );
            discard(ctx, map.iter_mut());
            *map = PhantomRangeMap::new(op_id, plan_generation);
        }

        for qs in specs.iter() {
            if map.contains(&qs.table, &qs.spec) || is_live(ctx, qs)? {
                continue;
            }
            let phantom = load_phantom(ctx, op_id, qs, fragments)?;
            info!(target: "recovery", "{}, loaded", phantom);
            map.insert(phantom);
        }
        Ok(())
    }

    /// Feed phantom updates to the addressed phantom range. Return true
    /// if the update completed its fragment and got applied.
    pub fn update(&self, ctx: &Context, update: &PhantomUpdate) -> Result<bool> {
        let mut maps = self.lock_maps()?;
        let map = match maps.get_mut(&update.location) {
            Some(map) => map,
            None => err_at!(
                PhantomMapNotFound,
                msg: "no phantom range map for recovery of {}", update.location
            )?,
        };
        map.check_generation(update.plan_generation)?;

        if !map.contains(&update.table, &update.spec) {
            let qs = QualifiedRangeSpec::new(update.table.clone(), update.spec.clone());
            if is_live(ctx, &qs)? {
                debug!(target: "recovery", "{}, live, ignoring phantom update", qs);
                return Ok(false);
            }
        }
        let phantom = map.get_mut(&update.table, &update.spec)?;
        if phantom.to_state() >= PhantomState::Replayed {
            return Ok(false);
        }
        let cluster_id = ctx.config.cluster_id;
        phantom.add(cluster_id, update.fragment, update.more, update.payload.clone())
    }

    /// Link phantom logs of replayed ranges into the commit log and
    /// notify the master. Return the outcome notified.
    pub fn prepare(
        &self,
        ctx: &Context,
        op_id: i64,
        location: &str,
        plan_generation: i32,
        specs: &[QualifiedRangeSpec],
    ) -> Result<()> {
        info!(
            target: "recovery",
            "phantom prepare op:{} location:{} plan:{} ranges:{}",
            op_id, location, plan_generation, specs.len()
        );

        let res = self.do_prepare(ctx, location, plan_generation, specs);
        if let Err(err) = &res {
            error!(target: "recovery", "{}, prepare failed {}", location, err);
        }
        let notice = CompleteParams::new(op_id, location, plan_generation, &res);
        if let Err(err) = self.master.phantom_prepare_complete(notice) {
            error!(target: "recovery", "{}, notify prepare-complete {}", location, err);
        }
        res
    }

    fn do_prepare(
        &self,
        ctx: &Context,
        location: &str,
        plan_generation: i32,
        specs: &[QualifiedRangeSpec],
    ) -> Result<()> {
        let mut maps = self.lock_maps()?;
        let map = match maps.get_mut(location) {
            Some(map) => map,
            None => err_at!(PhantomMapNotFound, msg: "no phantom range map for {}", location)?,
        };
        map.check_generation(plan_generation)?;

        for qs in specs.iter() {
            if !map.contains(&qs.table, &qs.spec) && is_live(ctx, qs)? {
                continue;
            }
            let phantom = map.get_mut(&qs.table, &qs.spec)?;
            match phantom.to_state() {
                PhantomState::Loaded => err_at!(
                    RangeNotActive,
                    msg: "{}, fragments pending, can't prepare", phantom
                )?,
                PhantomState::Replayed => (),
                PhantomState::Prepared | PhantomState::Committed => continue,
            }

            phantom.log.close()?;
            match phantom.log.to_latest_revision() {
                REVISION_NULL => remove_log(&phantom.log_dir),
                _ => {
                    // linked fragments must outlive the commit, the
                    // phantom range's cells are not live until then.
                    let revision = phantom.range.to_earliest_cached_revision()?;
                    ctx.pin_revision(&phantom.to_pin(), &phantom.table, revision)?;
                    let log = ctx.to_commit_log(&phantom.table);
                    log.link_log(ctx.config.cluster_id, phantom.log.as_ref())?;
                }
            }
            phantom.set_state(PhantomState::Prepared)?;
            info!(target: "recovery", "{}, prepared", phantom);
        }
        Ok(())
    }

    /// Make prepared phantom ranges live and notify the master. Once all
    /// phantom ranges of `location` are live, its map is dropped. Return
    /// the outcome notified.
    pub fn commit(
        &self,
        ctx: &Context,
        op_id: i64,
        location: &str,
        plan_generation: i32,
        specs: &[QualifiedRangeSpec],
    ) -> Result<()> {
        info!(
            target: "recovery",
            "phantom commit op:{} location:{} plan:{} ranges:{}",
            op_id, location, plan_generation, specs.len()
        );

        let res = self.do_commit(ctx, location, plan_generation, specs);
        if let Err(err) = &res {
            error!(target: "recovery", "{}, commit failed {}", location, err);
        }
        let notice = CompleteParams::new(op_id, location, plan_generation, &res);
        if let Err(err) = self.master.phantom_commit_complete(notice) {
            error!(target: "recovery", "{}, notify commit-complete {}", location, err);
        }
        res
    }

    fn do_commit(
        &self,
        ctx: &Context,
        location: &str,
        plan_generation: i32,
        specs: &[QualifiedRangeSpec],
    ) -> Result<()> {
        let mut maps = self.lock_maps()?;

        let mut all_live = true;
        for qs in specs.iter() {
            all_live = all_live && is_live(ctx, qs)?;
        }
        if all_live {
            // retried commit, already done.
            maps.remove(location);
            return Ok(());
        }

        let map = match maps.get_mut(location) {
            Some(map) => map,
            None => err_at!(PhantomMapNotFound, msg: "no phantom range map for {}", location)?,
        };
        map.check_generation(plan_generation)?;

        for qs in specs.iter() {
            if !map.contains(&qs.table, &qs.spec) && is_live(ctx, qs)? {
                continue;
            }
            let phantom = map.get_mut(&qs.table, &qs.spec)?;
            match phantom.to_state() {
                PhantomState::Prepared => (),
                PhantomState::Committed => continue,
                _ => err_at!(RangeNotActive, msg: "{}, not prepared", phantom)?,
            }
            let info = match ctx.tables.get(&phantom.table.id)? {
                Some(info) => info,
                None => err_at!(TableNotFound, msg: "{}", phantom.table)?,
            };
            info.add_range(Arc::clone(&phantom.range))?;
            ctx.unpin_revision(&phantom.to_pin())?;
            phantom.set_state(PhantomState::Committed)?;
            info!(target: "recovery", "{}, committed", phantom);
        }

        if map.all_in(PhantomState::Committed) {
            info!(target: "recovery", "{}, recovery complete", location);
            maps.remove(location);
        }
        Ok(())
    }
}

fn is_live(ctx: &Context, qs: &QualifiedRangeSpec) -> Result<bool> {
    match ctx.tables.get(&qs.table.id)? {
        Some(info) => Ok(info.get_range(&qs.spec)?.is_some()),
        None => Ok(false),
    }
}

fn load_phantom(
    ctx: &Context,
    op_id: i64,
    qs: &QualifiedRangeSpec,
    fragments: &[u32],
) -> Result<PhantomRange> {
    let info = match ctx.tables.get(&qs.table.id)? {
        Some(info) => info,
        None => err_at!(TableNotFound, msg: "phantom load {}", qs)?,
    };
    let mut table = qs.table.clone();
    let generation = info.to_schema()?.generation;
    if generation > table.generation {
        warn!(
            target: "recovery",
            "{}, upgrading generation {} to {}", qs, table.generation, generation
        );
        table.generation = generation;
    }

    let range_dir = ctx.to_range_dir(&table.id, &qs.spec.end_row);
    let range = Range::new(table.clone(), qs.spec.clone(), &range_dir)?;

    let log_dir = transfer::to_phantom_log_dir(&ctx.config.dir, &table.id, &qs.spec.end_row, op_id);
    let log = transfer::create_phantom_log(&log_dir, ctx.config.commit_log.clone())?;

    let phantom = PhantomRange::new(
        table,
        qs.spec.clone(),
        Arc::new(range),
        log_dir,
        Arc::new(log),
        fragments,
    );
    Ok(phantom)
}

// Abandon phantom ranges of a superseded plan, along with their logs.
fn discard<'a, I>(ctx: &Context, phantoms: I)
where
    I: Iterator<Item = &'a mut PhantomRange>,
{
    for phantom in phantoms {
        if phantom.to_state() >= PhantomState::Prepared {
            // linked logs are left to the next plan's recovery.
            ctx.unpin_revision(&phantom.to_pin()).ok();
            continue;
        }
        phantom.purge_incomplete_fragments();
        phantom.log.close().ok();
        remove_log(&phantom.log_dir);
    }
}

fn remove_log(log_dir: &path::Path) {
    match fs::remove_dir_all(log_dir) {
        Ok(_) => debug!(target: "recovery", "removed phantom log {:?}", log_dir),
        Err(err) => warn!(target: "recovery", "remove {:?} {}", log_dir, err),
    }
}

#[cfg(test)]
#[path = "recovery_test.rs"]
mod recovery_test;
