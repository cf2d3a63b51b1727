//! Transaction manager and transaction handles
//!
//! A `Txn` owns the collection locks registered on it; they are released
//! only when the transaction commits or aborts, which keeps concurrent
//! structural changes off a collection until the work is final. A `Txn`
//! dropped while still open releases its locks as an abort would.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use super::journal::{Journal, JournalRecord, Lsn};
use super::lock::{LockMode, ReentrantLock};
use crate::errors::{StorageError, StorageResult};
use crate::observability::{log_event_with_fields, Event, Logger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Started,
    Committed,
    Aborted,
}

struct HeldLock {
    lock: Arc<ReentrantLock>,
    mode: LockMode,
    owner: ThreadId,
}

pub struct Txn {
    id: u64,
    state: TxnState,
    locks: Vec<HeldLock>,
}

impl Txn {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: TxnState::Started,
            locks: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == TxnState::Started
    }

    /// Acquire `lock` and hold it until commit or abort.
    pub fn acquire_lock(
        &mut self,
        lock: &Arc<ReentrantLock>,
        mode: LockMode,
        timeout: Duration,
    ) -> StorageResult<()> {
        self.ensure_open()?;
        lock.acquire(mode, timeout)?;
        self.register_lock(lock, mode);
        Ok(())
    }

    /// Hand an already held lock to the transaction for deferred release.
    pub fn register_lock(&mut self, lock: &Arc<ReentrantLock>, mode: LockMode) {
        self.locks.push(HeldLock {
            lock: Arc::clone(lock),
            mode,
            owner: thread::current().id(),
        });
    }

    pub fn held_locks(&self) -> usize {
        self.locks.len()
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StorageError::transaction(format!(
                "transaction {} is already {:?}",
                self.id, self.state
            )))
        }
    }

    fn release_locks(&mut self) {
        for held in self.locks.drain(..).rev() {
            if let Err(e) = held.lock.release_for(held.owner, held.mode) {
                Logger::warn(
                    "TXN_LOCK_RELEASE_FAILED",
                    &[("lock", held.lock.name()), ("error", &e.to_string())],
                );
            }
        }
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if self.is_open() {
            Logger::warn("TXN_DROPPED_OPEN", &[("txn", &self.id.to_string())]);
            self.state = TxnState::Aborted;
        }
        self.release_locks();
    }
}

pub struct TransactionManager {
    journal: Option<Mutex<Journal>>,
    next_txn: AtomicU64,
}

impl TransactionManager {
    /// Journaled manager rooted at `data_dir`
    pub fn open(data_dir: &Path) -> StorageResult<Self> {
        Ok(Self {
            journal: Some(Mutex::new(Journal::open(data_dir)?)),
            next_txn: AtomicU64::new(1),
        })
    }

    /// Manager that hands out transactions but writes no journal
    pub fn non_transactional() -> Self {
        Self {
            journal: None,
            next_txn: AtomicU64::new(1),
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.journal.is_some()
    }

    fn journal(&self) -> StorageResult<Option<MutexGuard<'_, Journal>>> {
        match &self.journal {
            Some(j) => j
                .lock()
                .map(Some)
                .map_err(|_| StorageError::transaction("journal mutex poisoned")),
            None => Ok(None),
        }
    }

    pub fn begin(&self) -> StorageResult<Txn> {
        let id = self.next_txn.fetch_add(1, Ordering::SeqCst);
        self.write_to_log(Some(id), JournalRecord::TxnStart)?;
        Ok(Txn::new(id))
    }

    pub fn commit(&self, mut txn: Txn) -> StorageResult<()> {
        txn.ensure_open()?;
        let logged = self.write_to_log(Some(txn.id), JournalRecord::TxnCommit);
        if let Err(e) = logged {
            txn.state = TxnState::Aborted;
            txn.release_locks();
            return Err(StorageError::transaction(format!(
                "commit of {} failed: {}",
                txn.id, e
            )));
        }
        txn.state = TxnState::Committed;
        txn.release_locks();
        Ok(())
    }

    pub fn abort(&self, mut txn: Txn) -> StorageResult<()> {
        txn.ensure_open()?;
        txn.state = TxnState::Aborted;
        txn.release_locks();
        self.write_to_log(Some(txn.id), JournalRecord::TxnAbort)?;
        Ok(())
    }

    /// Journal a record; a no-op returning 0 when non-transactional.
    pub fn write_to_log(&self, txn_id: Option<u64>, record: JournalRecord) -> StorageResult<Lsn> {
        match self.journal()? {
            Some(mut journal) => journal.write_to_log(txn_id, record),
            None => Ok(0),
        }
    }

    pub fn flush_to_log(&self, force: bool, sync: bool) -> StorageResult<()> {
        match self.journal()? {
            Some(mut journal) => journal.flush_to_log(force, sync),
            None => Ok(()),
        }
    }

    /// Record a checkpoint; with `force` the journal before it is discarded.
    pub fn checkpoint(&self, force: bool) -> StorageResult<()> {
        if let Some(mut journal) = self.journal()? {
            journal.flush_to_log(true, true)?;
            if force {
                journal.truncate()?;
            }
            let lsn = journal.write_to_log(None, JournalRecord::Checkpoint)?;
            log_event_with_fields(
                Event::Checkpoint,
                &[("lsn", &lsn.to_string()), ("truncated", &force.to_string())],
            );
        }
        Ok(())
    }

    pub fn journal_path(&self) -> Option<std::path::PathBuf> {
        self.journal()
            .ok()
            .flatten()
            .map(|j| j.path().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::journal::read_journal;
    use tempfile::TempDir;

    const T: Duration = Duration::from_millis(50);

    #[test]
    fn test_commit_releases_registered_locks() {
        let manager = TransactionManager::non_transactional();
        let lock = Arc::new(ReentrantLock::new("/db/a"));
        let mut txn = manager.begin().unwrap();
        txn.acquire_lock(&lock, LockMode::Write, T).unwrap();
        assert!(lock.is_locked());
        manager.commit(txn).unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_lock_held_until_abort() {
        let manager = TransactionManager::non_transactional();
        let lock = Arc::new(ReentrantLock::new("/db/b"));
        let mut txn = manager.begin().unwrap();
        txn.acquire_lock(&lock, LockMode::Write, T).unwrap();

        let other = Arc::clone(&lock);
        let blocked = thread::spawn(move || other.acquire(LockMode::Write, T))
            .join()
            .unwrap();
        assert!(blocked.is_err());

        manager.abort(txn).unwrap();
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_drop_releases_locks() {
        let manager = TransactionManager::non_transactional();
        let lock = Arc::new(ReentrantLock::new("/db/c"));
        {
            let mut txn = manager.begin().unwrap();
            txn.acquire_lock(&lock, LockMode::Read, T).unwrap();
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_boundaries_are_journaled() {
        let temp = TempDir::new().unwrap();
        let manager = TransactionManager::open(temp.path()).unwrap();
        let txn = manager.begin().unwrap();
        let id = txn.id();
        manager.commit(txn).unwrap();

        let path = manager.journal_path().unwrap();
        let entries = read_journal(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].txn_id, Some(id));
        assert_eq!(entries[1].record, JournalRecord::TxnCommit);
    }

    #[test]
    fn test_forced_checkpoint_truncates() {
        let temp = TempDir::new().unwrap();
        let manager = TransactionManager::open(temp.path()).unwrap();
        let txn = manager.begin().unwrap();
        manager.commit(txn).unwrap();
        manager.checkpoint(true).unwrap();

        let entries = read_journal(&manager.journal_path().unwrap()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record, JournalRecord::Checkpoint);
    }
}
