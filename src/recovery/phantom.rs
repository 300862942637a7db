use log::{debug, info};

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, path,
    sync::Arc,
};

use crate::{
    clock::REVISION_NULL,
    commit_log::CommitLog,
    key::{encode_mutation, Mutations},
    range::Range,
    table::{RangeSpec, TableIdentifier},
    update::encode_commit_header,
    Result,
};

/// Life cycle of a phantom range, from load to going live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PhantomState {
    Loaded,
    /// All fragments are applied to the range and its phantom log.
    Replayed,
    /// Phantom log is linked into the commit log.
    Prepared,
    /// Range is live.
    Committed,
}

impl fmt::Display for PhantomState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PhantomState::Loaded => write!(f, "loaded"),
            PhantomState::Replayed => write!(f, "replayed"),
            PhantomState::Prepared => write!(f, "prepared"),
            PhantomState::Committed => write!(f, "committed"),
        }
    }
}

/// Payloads received for one commit log fragment of the failed server.
#[derive(Default)]
pub struct FragmentData {
    payloads: Vec<Vec<u8>>,
    footprint: usize,
}

impl FragmentData {
    pub fn add(&mut self, payload: Vec<u8>) {
        self.footprint += payload.len();
        self.payloads.push(payload);
    }

    pub fn clear(&mut self) {
        self.payloads.clear();
        self.footprint = 0;
    }

    pub fn footprint(&self) -> usize {
        self.footprint
    }

    /// Decode all payloads and re-encode their mutations in revision
    /// order, into `buf`. Return (mutations, latest-revision). Nothing is
    /// written into `buf` if any payload is malformed.
    pub fn merge(&self, buf: &mut Vec<u8>) -> Result<(usize, i64)> {
        let mut mutations = vec![];
        for payload in self.payloads.iter() {
            for item in Mutations::new(payload) {
                let m = item?;
                if m.key.revision.is_none() {
                    err_at!(DecodeFail, msg: "phantom mutation without revision {:?}", m.key)?
                }
                mutations.push(m);
            }
        }
        // stable, mutations sharing a revision keep their order.
        mutations.sort_by_key(|m| m.key.to_revision());

        let mut data = vec![];
        let mut latest = REVISION_NULL;
        for m in mutations.iter() {
            encode_mutation(&mut data, &m.key, m.value)?;
            latest = std::cmp::max(latest, m.key.to_revision());
        }
        buf.extend_from_slice(&data);
        Ok((mutations.len(), latest))
    }
}

/// Range under recovery, receiving replayed mutations from the failed
/// server's commit log, fragment by fragment.
pub struct PhantomRange {
    pub table: TableIdentifier,
    pub spec: RangeSpec,
    pub range: Arc<Range>,
    pub log_dir: path::PathBuf,
    pub log: Arc<CommitLog>,
    state: PhantomState,
    fragments: BTreeMap<u32, FragmentData>,
    applied: BTreeSet<u32>,
}

impl PhantomRange {
    /// Name to pin commit log revisions with.
    pub fn to_pin(&self) -> String {
        format!("phantom:{}{}", self.table.id, self.spec)
    }
}

impl fmt::Display for PhantomRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "phantom<{}{},{}>", self.table.id, self.spec, self.state)
    }
}

impl PhantomRange {
    pub fn new(
        table: TableIdentifier,
        spec: RangeSpec,
        range: Arc<Range>,
        log_dir: path::PathBuf,
        log: Arc<CommitLog>,
        fragments: &[u32],
    ) -> PhantomRange {
        let fragments = fragments
            .iter()
            .map(|num| (*num, FragmentData::default()))
            .collect();
        let mut phantom = PhantomRange {
            table,
            spec,
            range,
            log_dir,
            log,
            state: PhantomState::Loaded,
            fragments,
            applied: BTreeSet::new(),
        };
        if phantom.fragments.is_empty() {
            phantom.state = PhantomState::Replayed;
        }
        phantom
    }

    pub fn to_state(&self) -> PhantomState {
        self.state
    }

    pub fn set_state(&mut self, state: PhantomState) -> Result<()> {
        if state < self.state {
            err_at!(InvalidInput, msg: "{} can't move back to {}", self, state)?
        }
        self.state = state;
        Ok(())
    }

    pub fn is_replayed(&self) -> bool {
        self.state >= PhantomState::Replayed
    }

    /// Bytes buffered for fragments not yet applied.
    pub fn footprint(&self) -> usize {
        self.fragments.values().map(|f| f.footprint()).sum()
    }

    /// Add `payload` for `fragment`. When `more` is false the fragment is
    /// complete, its mutations are logged to the phantom log and applied
    /// to the range, all or nothing. Payloads for an already applied
    /// fragment are ignored. Return true if the fragment got applied.
    pub fn add(&mut self, cluster_id: u64, fragment: u32, more: bool, payload: Vec<u8>) -> Result<bool> {
        if self.applied.contains(&fragment) {
            debug!(target: "recovery", "{}, fragment {} already applied", self, fragment);
            return Ok(false);
        }
        match self.fragments.get_mut(&fragment) {
            Some(data) => data.add(payload),
            None => err_at!(InvalidInput, msg: "{} unexpected fragment {}", self, fragment)?,
        }
        if more {
            return Ok(false);
        }

        let res = self.apply(cluster_id, fragment);
        if let Some(data) = self.fragments.get_mut(&fragment) {
            data.clear();
        }
        res?;

        self.applied.insert(fragment);
        if self.applied.len() == self.fragments.len() {
            self.state = PhantomState::Replayed;
            info!(target: "recovery", "{}, all {} fragments replayed", self, self.applied.len());
        }
        Ok(true)
    }

    fn apply(&self, cluster_id: u64, fragment: u32) -> Result<()> {
        let data = match self.fragments.get(&fragment) {
            Some(data) => data,
            None => err_at!(Fatal, msg: "{} missing fragment {}", self, fragment)?,
        };

        let mut buf = vec![];
        let header_len = encode_commit_header(&mut buf, &self.table)?;
        let (n, revision) = data.merge(&mut buf)?;
        if n == 0 {
            return Ok(());
        }

        self.log.append(cluster_id, &buf, revision, true)?;
        let added = self.range.add_mutations(&buf[header_len..], true)?;
        debug!(
            target: "recovery",
            "{}, fragment {} applied {}/{} cells", self, fragment, added, n
        );
        Ok(())
    }

    /// Drop payloads of fragments still waiting for completion.
    pub fn purge_incomplete_fragments(&mut self) {
        let applied = &self.applied;
        self.fragments
            .iter_mut()
            .filter(|(num, _)| !applied.contains(num))
            .for_each(|(_, data)| data.clear());
    }
}

/// Phantom ranges recovered from one failed server, under one recovery
/// plan generation.
pub struct PhantomRangeMap {
    pub op_id: i64,
    pub plan_generation: i32,
    ranges: BTreeMap<(String, Vec<u8>), PhantomRange>,
}

impl PhantomRangeMap {
    pub fn new(op_id: i64, plan_generation: i32) -> PhantomRangeMap {
        PhantomRangeMap {
            op_id,
            plan_generation,
            ranges: BTreeMap::new(),
        }
    }

    fn to_key(table: &TableIdentifier, spec: &RangeSpec) -> (String, Vec<u8>) {
        (table.id.clone(), spec.end_row.clone())
    }

    /// Fail with PlanGenerationMismatch unless `plan_generation` matches.
    pub fn check_generation(&self, plan_generation: i32) -> Result<()> {
        if plan_generation != self.plan_generation {
            err_at!(
                PlanGenerationMismatch,
                msg: "plan generation {} != {}", plan_generation, self.plan_generation
            )?
        }
        Ok(())
    }

    pub fn insert(&mut self, phantom: PhantomRange) -> Option<PhantomRange> {
        let key = Self::to_key(&phantom.table, &phantom.spec);
        self.ranges.insert(key, phantom)
    }

    pub fn contains(&self, table: &TableIdentifier, spec: &RangeSpec) -> bool {
        self.ranges.contains_key(&Self::to_key(table, spec))
    }

    pub fn get_mut(&mut self, table: &TableIdentifier, spec: &RangeSpec) -> Result<&mut PhantomRange> {
        match self.ranges.get_mut(&Self::to_key(table, spec)) {
            Some(phantom) if phantom.spec == *spec => Ok(phantom),
            _ => err_at!(RangeNotFound, msg: "phantom range {}{}", table.id, spec),
        }
    }

    pub fn remove(&mut self, table: &TableIdentifier, spec: &RangeSpec) -> Option<PhantomRange> {
        self.ranges.remove(&Self::to_key(table, spec))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PhantomRange> {
        self.ranges.values_mut()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Return true if every phantom range is in `state` or beyond.
    pub fn all_in(&self, state: PhantomState) -> bool {
        self.ranges.values().all(|p| p.to_state() >= state)
    }
}

#[cfg(test)]
#[path = "phantom_test.rs"]
mod phantom_test;
