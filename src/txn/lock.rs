//! Reentrant reader/writer lock held per collection
//!
//! - many readers or one writer
//! - reentrant per thread for both modes
//! - the writer may also take read locks
//! - a sole reader may upgrade to write
//! - acquisition is bounded by a timeout; expiry is a `Locking` error
//!
//! Locks registered on a transaction are released by `release_for` with the
//! owning thread recorded at registration time.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::errors::{StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug, Default)]
struct LockState {
    readers: HashMap<ThreadId, usize>,
    writer: Option<ThreadId>,
    write_count: usize,
}

impl LockState {
    fn can_acquire(&self, owner: ThreadId, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => self.writer.is_none() || self.writer == Some(owner),
            LockMode::Write => {
                let writer_ok = self.writer.is_none() || self.writer == Some(owner);
                let readers_ok = self.readers.keys().all(|t| *t == owner);
                writer_ok && readers_ok
            }
        }
    }
}

#[derive(Debug)]
pub struct ReentrantLock {
    name: String,
    state: Mutex<LockState>,
    released: Condvar,
}

impl ReentrantLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> StorageResult<MutexGuard<'_, LockState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::locking(format!("lock {} poisoned", self.name)))
    }

    /// Acquire for the calling thread.
    pub fn acquire(&self, mode: LockMode, timeout: Duration) -> StorageResult<()> {
        let owner = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut state = self.state()?;

        while !state.can_acquire(owner, mode) {
            let now = Instant::now();
            if now >= deadline {
                return Err(StorageError::locking(format!(
                    "timed out after {}ms waiting for {:?} lock on {}",
                    timeout.as_millis(),
                    mode,
                    self.name
                )));
            }
            let (guard, _) = self
                .released
                .wait_timeout(state, deadline - now)
                .map_err(|_| StorageError::locking(format!("lock {} poisoned", self.name)))?;
            state = guard;
        }

        match mode {
            LockMode::Read => *state.readers.entry(owner).or_insert(0) += 1,
            LockMode::Write => {
                state.writer = Some(owner);
                state.write_count += 1;
            }
        }
        Ok(())
    }

    /// Release one hold of the calling thread.
    pub fn release(&self, mode: LockMode) -> StorageResult<()> {
        self.release_for(thread::current().id(), mode)
    }

    /// Release one hold taken by `owner`.
    pub fn release_for(&self, owner: ThreadId, mode: LockMode) -> StorageResult<()> {
        let mut state = self.state()?;
        match mode {
            LockMode::Read => {
                let count = state.readers.get_mut(&owner).ok_or_else(|| {
                    StorageError::locking(format!("read lock on {} not held", self.name))
                })?;
                *count -= 1;
                if *count == 0 {
                    state.readers.remove(&owner);
                }
            }
            LockMode::Write => {
                if state.writer != Some(owner) {
                    return Err(StorageError::locking(format!(
                        "write lock on {} not held",
                        self.name
                    )));
                }
                state.write_count -= 1;
                if state.write_count == 0 {
                    state.writer = None;
                }
            }
        }
        self.released.notify_all();
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.state()
            .map(|s| s.writer.is_some() || !s.readers.is_empty())
            .unwrap_or(true)
    }

    pub fn is_write_locked_by_current_thread(&self) -> bool {
        let me = thread::current().id();
        self.state().map(|s| s.writer == Some(me)).unwrap_or(false)
    }
}
