use std::{
    fmt,
    sync::{Condvar, Mutex, MutexGuard},
};

use crate::Result;

/// State of a [RangeMaintenanceGuard].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardState {
    Idle,
    Active,
    /// Terminal, until explicitly enabled again.
    Disabled,
}

impl fmt::Display for GuardState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GuardState::Idle => write!(f, "idle"),
            GuardState::Active => write!(f, "active"),
            GuardState::Disabled => write!(f, "disabled"),
        }
    }
}

/// Single owner mutual exclusion between foreground updates and background
/// maintenance on a range.
///
/// [RangeMaintenanceGuard::activate] never blocks, it fails with
/// [crate::Error::RangeBusy] when the guard is already held and with
/// [crate::Error::RangeNotActive] when the guard is disabled. Waiting is
/// explicit, via [RangeMaintenanceGuard::wait_for_complete].
pub struct RangeMaintenanceGuard {
    state: Mutex<GuardState>,
    cond: Condvar,
}

impl Default for RangeMaintenanceGuard {
    fn default() -> RangeMaintenanceGuard {
        RangeMaintenanceGuard::new()
    }
}

impl RangeMaintenanceGuard {
    pub fn new() -> RangeMaintenanceGuard {
        RangeMaintenanceGuard {
            state: Mutex::new(GuardState::Idle),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<GuardState>> {
        err_at!(Fatal, self.state.lock())
    }

    /// IDLE -> ACTIVE.
    pub fn activate(&self) -> Result<()> {
        let mut state = self.lock()?;
        match *state {
            GuardState::Idle => {
                *state = GuardState::Active;
                Ok(())
            }
            GuardState::Active => err_at!(RangeBusy, msg: "maintenance in progress"),
            GuardState::Disabled => err_at!(RangeNotActive, msg: "maintenance disabled"),
        }
    }

    /// ACTIVE -> IDLE, wake up all waiters.
    pub fn deactivate(&self) -> Result<()> {
        let mut state = self.lock()?;
        match *state {
            GuardState::Active => {
                *state = GuardState::Idle;
                self.cond.notify_all();
                Ok(())
            }
            s => err_at!(Fatal, msg: "deactivate on {} guard", s),
        }
    }

    /// Block until the guard leaves ACTIVE. With `disable`, the guard
    /// moves to DISABLED in the same critical section, so that no
    /// activation can sneak in after the wait returns.
    pub fn wait_for_complete(&self, disable: bool) -> Result<()> {
        let mut state = self.lock()?;
        while *state == GuardState::Active {
            state = err_at!(Fatal, self.cond.wait(state))?;
        }
        if disable {
            *state = GuardState::Disabled;
        }
        Ok(())
    }

    /// DISABLED -> IDLE, no-op in other states.
    pub fn enable(&self) -> Result<()> {
        let mut state = self.lock()?;
        if *state == GuardState::Disabled {
            *state = GuardState::Idle;
        }
        Ok(())
    }

    pub fn to_state(&self) -> Result<GuardState> {
        Ok(*self.lock()?)
    }

    pub fn in_progress(&self) -> bool {
        matches!(self.to_state(), Ok(GuardState::Active))
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self.to_state(), Ok(GuardState::Disabled))
    }

    /// Activate the guard and return a handle that deactivates it when
    /// dropped.
    pub fn activator(&self) -> Result<Activator> {
        self.activate()?;
        Ok(Activator { guard: self })
    }
}

/// Handle returned by [RangeMaintenanceGuard::activator].
pub struct Activator<'a> {
    guard: &'a RangeMaintenanceGuard,
}

impl<'a> Drop for Activator<'a> {
    fn drop(&mut self) {
        self.guard.deactivate().ok();
    }
}

#[cfg(test)]
#[path = "guard_test.rs"]
mod guard_test;
