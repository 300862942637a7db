//! Module implement server wide state variables.
//!
//! State is published as an immutable snapshot, readers clone the current
//! [Arc] and never observe a partial update. Writers install a new
//! snapshot only if the generation they based their update on is still
//! current.

use log::info;

use std::sync::{Arc, Mutex};

use crate::Result;

/// Snapshot of server wide variables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerState {
    /// Incremented for every published change.
    pub generation: u64,
    /// Reject updates to user tables.
    pub readonly: bool,
    /// Skip scheduled maintenance for all tables.
    pub maintenance_disabled: bool,
}

impl ServerState {
    pub fn set_readonly(mut self, readonly: bool) -> ServerState {
        self.readonly = readonly;
        self
    }

    pub fn set_maintenance_disabled(mut self, disabled: bool) -> ServerState {
        self.maintenance_disabled = disabled;
        self
    }
}

/// Holder of the current [ServerState] snapshot.
#[derive(Default)]
pub struct StateCell {
    current: Mutex<Arc<ServerState>>,
}

impl StateCell {
    pub fn new() -> StateCell {
        StateCell::default()
    }

    /// Return the current snapshot.
    pub fn to_snapshot(&self) -> Result<Arc<ServerState>> {
        Ok(Arc::clone(&*err_at!(Fatal, self.current.lock())?))
    }

    /// Publish `state` provided the current generation equals
    /// `state.generation`. On success the published snapshot carries the
    /// next generation, on mismatch GenerationMismatch is returned and
    /// caller shall retry with a fresh snapshot.
    pub fn compare_and_set(&self, state: ServerState) -> Result<Arc<ServerState>> {
        let mut current = err_at!(Fatal, self.current.lock())?;
        if current.generation != state.generation {
            err_at!(
                GenerationMismatch,
                msg: "state generation {} != {}", state.generation, current.generation
            )?
        }

        let state = ServerState {
            generation: state.generation + 1,
            ..state
        };
        info!(target: "rangesrv", "server state {:?}", state);
        *current = Arc::new(state);
        Ok(Arc::clone(&current))
    }

    /// Apply `update` on the latest snapshot, retrying on concurrent
    /// changes.
    pub fn update<F>(&self, update: F) -> Result<Arc<ServerState>>
    where
        F: Fn(ServerState) -> ServerState,
    {
        loop {
            let snapshot = self.to_snapshot()?;
            match self.compare_and_set(update(snapshot.as_ref().clone())) {
                Ok(state) => break Ok(state),
                Err(crate::Error::GenerationMismatch(_, _)) => continue,
                Err(err) => break Err(err),
            }
        }
    }
}

#[cfg(test)]
#[path = "state_test.rs"]
mod state_test;
