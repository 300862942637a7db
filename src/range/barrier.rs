use std::sync::{Condvar, Mutex, MutexGuard};

use crate::Result;

/// Reference counted barrier between scans and maintenance.
///
/// Imagine a door leading into a room:
///
/// * Any number of scans can [Barrier::enter] the room while the door is
///   open, and [Barrier::exit] on their way out.
/// * Maintenance closes the door by calling [Barrier::put_up], which
///   blocks until every scan inside the room has left. While the door is
///   closed new entrants wait outside.
/// * [Barrier::take_down] opens the door and lets waiting scans in.
pub struct Barrier {
    inner: Mutex<Door>,
    cond: Condvar,
}

struct Door {
    counter: usize,
    hold: bool,
}

impl Default for Barrier {
    fn default() -> Barrier {
        Barrier::new()
    }
}

impl Barrier {
    pub fn new() -> Barrier {
        Barrier {
            inner: Mutex::new(Door {
                counter: 0,
                hold: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<Door>> {
        err_at!(Fatal, self.inner.lock())
    }

    pub fn enter(&self) -> Result<()> {
        let mut door = self.lock()?;
        while door.hold {
            door = err_at!(Fatal, self.cond.wait(door))?;
        }
        door.counter += 1;
        Ok(())
    }

    pub fn exit(&self) -> Result<()> {
        let mut door = self.lock()?;
        match door.counter {
            0 => err_at!(Fatal, msg: "barrier exit without enter")?,
            _ => door.counter -= 1,
        }
        if door.counter == 0 {
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Close the door and wait for scans inside to exit. Concurrent
    /// callers are serialized, the second waits for the first to take the
    /// barrier down.
    pub fn put_up(&self) -> Result<()> {
        let mut door = self.lock()?;
        while door.hold {
            door = err_at!(Fatal, self.cond.wait(door))?;
        }
        door.hold = true;
        while door.counter > 0 {
            door = err_at!(Fatal, self.cond.wait(door))?;
        }
        Ok(())
    }

    pub fn take_down(&self) -> Result<()> {
        let mut door = self.lock()?;
        door.hold = false;
        self.cond.notify_all();
        Ok(())
    }

    /// Return number of scans in the room.
    pub fn to_count(&self) -> Result<usize> {
        Ok(self.lock()?.counter)
    }

    /// Enter, and exit when the returned handle is dropped.
    pub fn scoped_enter(&self) -> Result<Entered> {
        self.enter()?;
        Ok(Entered { barrier: self })
    }

    /// Put up, and take down when the returned handle is dropped.
    pub fn scoped_put_up(&self) -> Result<Held> {
        self.put_up()?;
        Ok(Held { barrier: self })
    }
}

pub struct Entered<'a> {
    barrier: &'a Barrier,
}

impl<'a> Drop for Entered<'a> {
    fn drop(&mut self) {
        self.barrier.exit().ok();
    }
}

pub struct Held<'a> {
    barrier: &'a Barrier,
}

impl<'a> Drop for Held<'a> {
    fn drop(&mut self) {
        self.barrier.take_down().ok();
    }
}

#[cfg(test)]
#[path = "barrier_test.rs"]
mod barrier_test;
