//! Broker pool
//!
//! Hands out brokers to threads. A thread that already holds a broker gets
//! the same broker back with its reference count raised, so nested
//! acquisitions never take a second broker and can't deadlock each other on
//! a saturated pool.
//!
//! All bookkeeping sits behind one mutex. Every release wakes every waiter
//! through a single condition variable; waiters re-check their own
//! condition (a free broker, room to create one, service mode cleared).
//!
//! Maintenance (syncs, checkpoints) only runs when no broker is checked
//! out. A request arriving while brokers are busy is parked and run by the
//! release that empties the active set.

mod broker;
mod instance;
mod lock_file;
mod scheduler;

pub use broker::Broker;
pub use instance::{InstanceManager, DEFAULT_INSTANCE};
pub use lock_file::{DataDirLock, LockOwner, LOCK_FILE_NAME};

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Instant;

use serde::Serialize;

use crate::config::DatabaseConfig;
use crate::errors::{StorageError, StorageResult};
use crate::observability::{log_event_with_fields, Event, Logger, MetricsRegistry, MetricsSnapshot};
use crate::security::{SecurityManager, Subject};
use crate::storage::{HookSet, NativeStore, StoreStats, SyncKind};
use crate::txn::TransactionManager;

use scheduler::SyncScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Operating,
    ServiceMode,
    ShuttingDown,
    Shutdown,
}

impl PoolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolStatus::Operating => "operating",
            PoolStatus::ServiceMode => "service_mode",
            PoolStatus::ShuttingDown => "shutting_down",
            PoolStatus::Shutdown => "shutdown",
        }
    }
}

/// Everything an operator wants to see about one instance
#[derive(Debug, Clone, Serialize)]
pub struct PoolReport {
    pub name: String,
    pub status: PoolStatus,
    pub active_brokers: usize,
    pub available_brokers: usize,
    pub total_brokers: usize,
    pub max_brokers: usize,
    pub service_mode_owner: Option<String>,
    pub metrics: MetricsSnapshot,
    pub store: StoreStats,
}

struct Checkout {
    broker: Arc<Broker>,
    refcount: usize,
}

struct PoolState {
    active: HashMap<ThreadId, Checkout>,
    idle: Vec<Arc<Broker>>,
    total: usize,
    next_id: u64,
    service_owner: Option<String>,
    in_service_mode: bool,
    pending_sync: Option<SyncKind>,
    checkpoint_pending: bool,
    shutting_down: bool,
    shut_down: bool,
}

fn poisoned<T>(_: T) -> StorageError {
    StorageError::locking("broker pool state poisoned")
}

fn merge_sync(pending: Option<SyncKind>, kind: SyncKind) -> SyncKind {
    match (pending, kind) {
        (Some(SyncKind::Major), _) | (_, SyncKind::Major) => SyncKind::Major,
        _ => SyncKind::Minor,
    }
}

pub struct BrokerPool {
    name: String,
    config: DatabaseConfig,
    store: Arc<NativeStore>,
    txn_manager: Arc<TransactionManager>,
    metrics: Arc<MetricsRegistry>,
    state: Mutex<PoolState>,
    changed: Condvar,
    scheduler: Mutex<Option<SyncScheduler>>,
    data_lock: Mutex<Option<DataDirLock>>,
}

impl std::fmt::Debug for BrokerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerPool").field("name", &self.name).finish()
    }
}

impl BrokerPool {
    /// Open the stores under `config.data_dir` and start the instance.
    ///
    /// A writable instance takes the data directory lock first. `min_brokers`
    /// brokers are created up front; the maintenance scheduler starts when
    /// `sync_period_ms` is non-zero.
    pub fn open(
        name: &str,
        config: DatabaseConfig,
        security: Arc<dyn SecurityManager>,
        hooks: HookSet,
    ) -> StorageResult<Arc<Self>> {
        config.validate()?;

        let data_lock = if config.read_only {
            None
        } else {
            Some(DataDirLock::acquire(&config.data_dir)?)
        };

        let txn_manager = Arc::new(if config.transactional && !config.read_only {
            TransactionManager::open(&config.data_dir)?
        } else {
            TransactionManager::non_transactional()
        });
        let metrics = Arc::new(MetricsRegistry::new());
        let store = Arc::new(NativeStore::open(
            &config,
            security,
            Arc::clone(&txn_manager),
            hooks,
            Arc::clone(&metrics),
        )?);

        let mut idle = Vec::with_capacity(config.max_brokers);
        for id in 1..=config.min_brokers as u64 {
            idle.push(Arc::new(Broker::new(id, Arc::clone(&store))));
            metrics.increment_brokers_created();
        }

        let state = PoolState {
            active: HashMap::new(),
            idle,
            total: config.min_brokers,
            next_id: config.min_brokers as u64 + 1,
            service_owner: None,
            in_service_mode: false,
            pending_sync: None,
            checkpoint_pending: false,
            shutting_down: false,
            shut_down: false,
        };

        let pool = Arc::new(Self {
            name: name.to_string(),
            config,
            store,
            txn_manager,
            metrics,
            state: Mutex::new(state),
            changed: Condvar::new(),
            scheduler: Mutex::new(None),
            data_lock: Mutex::new(data_lock),
        });

        log_event_with_fields(
            Event::PoolConfigured,
            &[
                ("data_dir", &pool.config.data_dir.display().to_string()),
                ("max_brokers", &pool.config.max_brokers.to_string()),
                ("min_brokers", &pool.config.min_brokers.to_string()),
                ("name", &pool.name),
            ],
        );

        if let Some(period) = pool.config.sync_period() {
            let scheduler = SyncScheduler::start(Arc::downgrade(&pool), period, pool.config.major_sync_period());
            if let Ok(mut slot) = pool.scheduler.lock() {
                *slot = Some(scheduler);
            }
        }

        log_event_with_fields(Event::PoolOperating, &[("name", &pool.name)]);
        Ok(pool)
    }

    fn state(&self) -> StorageResult<MutexGuard<'_, PoolState>> {
        self.state.lock().map_err(poisoned)
    }

    /// Block on the condition variable, failing once `deadline` has passed.
    fn wait<'a>(
        &self,
        guard: MutexGuard<'a, PoolState>,
        deadline: Option<Instant>,
    ) -> StorageResult<MutexGuard<'a, PoolState>> {
        match deadline {
            None => self.changed.wait(guard).map_err(poisoned),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(StorageError::locking(format!(
                        "timed out waiting for a broker of instance '{}'",
                        self.name
                    )));
                }
                let (guard, _) = self.changed.wait_timeout(guard, deadline - now).map_err(poisoned)?;
                Ok(guard)
            }
        }
    }

    fn create_broker(&self, state: &mut PoolState) -> Arc<Broker> {
        let id = state.next_id;
        state.next_id += 1;
        state.total += 1;
        self.metrics.increment_brokers_created();
        Logger::trace(
            Event::BrokerCreated.as_str(),
            &[("id", &id.to_string()), ("name", &self.name), ("total", &state.total.to_string())],
        );
        Arc::new(Broker::new(id, Arc::clone(&self.store)))
    }

    /// Check out a broker for the calling thread, running as `subject`.
    pub fn acquire(&self, subject: &Subject) -> StorageResult<Arc<Broker>> {
        let me = thread::current().id();
        let mut state = self.state()?;

        if let Some(checkout) = state.active.get_mut(&me) {
            checkout.refcount += 1;
            let broker = Arc::clone(&checkout.broker);
            drop(state);
            broker.push_subject(subject.clone())?;
            self.metrics.increment_acquisitions();
            return Ok(broker);
        }

        let deadline = self.config.acquire_timeout().map(|t| Instant::now() + t);
        let mut waited = false;
        let broker = loop {
            if state.shutting_down {
                return Err(StorageError::locking(format!(
                    "instance '{}' is shutting down",
                    self.name
                )));
            }
            let admitted = state
                .service_owner
                .as_deref()
                .map_or(true, |owner| owner == subject.name());
            if admitted {
                if let Some(broker) = state.idle.pop() {
                    break broker;
                }
                if state.total < self.config.max_brokers {
                    break self.create_broker(&mut state);
                }
            }
            if !waited {
                waited = true;
                self.metrics.increment_acquisition_waits();
            }
            state = self.wait(state, deadline)?;
        };

        if let Err(e) = broker.reset_subjects(subject.clone()) {
            state.idle.push(broker);
            return Err(e);
        }
        state.active.insert(
            me,
            Checkout {
                broker: Arc::clone(&broker),
                refcount: 1,
            },
        );
        self.metrics.increment_acquisitions();
        Ok(broker)
    }

    /// Give back one acquisition. The last one returns the broker to the idle set.
    pub fn release(&self, broker: &Arc<Broker>) -> StorageResult<()> {
        let me = thread::current().id();
        let mut state = self.state()?;

        let remaining = match state.active.get_mut(&me) {
            Some(checkout) if checkout.broker.id() == broker.id() => {
                checkout.refcount -= 1;
                checkout.refcount
            }
            _ => {
                return Err(StorageError::invalid(format!(
                    "broker {} is not held by this thread",
                    broker.id()
                )))
            }
        };
        if remaining > 0 {
            drop(state);
            broker.pop_subject()?;
            return Ok(());
        }

        state.active.remove(&me);
        let releasing = broker.subject();
        broker.clear_subjects()?;
        state.idle.push(Arc::clone(broker));

        if state.active.is_empty() {
            if let Some(kind) = state.pending_sync.take() {
                let checkpoint = std::mem::take(&mut state.checkpoint_pending);
                if let Err(e) = self.run_sync(kind, checkpoint) {
                    Logger::error(
                        "SYNC_FAILED",
                        &[("error", &e.to_string()), ("name", &self.name)],
                    );
                }
            }
            let flip = state
                .service_owner
                .as_deref()
                .map_or(false, |owner| owner != releasing.name());
            if flip {
                state.in_service_mode = true;
            }
        }

        self.changed.notify_all();
        Ok(())
    }

    /// Acquire, run `f`, release.
    pub fn with_broker<T>(
        &self,
        subject: &Subject,
        f: impl FnOnce(&Broker) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let broker = self.acquire(subject)?;
        let result = f(&broker);
        let released = self.release(&broker);
        let value = result?;
        released?;
        Ok(value)
    }

    /// Only called while no broker is checked out.
    fn run_sync(&self, kind: SyncKind, checkpoint: bool) -> StorageResult<()> {
        self.store.sync(kind)?;
        if kind == SyncKind::Major {
            self.txn_manager.checkpoint(checkpoint)?;
        }
        Ok(())
    }

    /// Sync now if the instance is idle, otherwise on the next idle release.
    pub fn trigger_sync(&self, kind: SyncKind) -> StorageResult<()> {
        let mut state = self.state()?;
        if state.shutting_down {
            return Ok(());
        }
        if state.active.is_empty() {
            debug_assert_eq!(state.idle.len(), state.total);
            self.run_sync(kind, false)
        } else {
            state.pending_sync = Some(merge_sync(state.pending_sync, kind));
            Ok(())
        }
    }

    /// Major sync plus a forced checkpoint, now or on the next idle release.
    pub fn trigger_checkpoint(&self) -> StorageResult<()> {
        let mut state = self.state()?;
        if state.shutting_down {
            return Ok(());
        }
        if state.active.is_empty() {
            self.run_sync(SyncKind::Major, true)
        } else {
            state.pending_sync = Some(SyncKind::Major);
            state.checkpoint_pending = true;
            Ok(())
        }
    }

    /// Wait for every broker to come back, then hold the instance for `subject`.
    ///
    /// Other subjects block in `acquire` until `exit_service_mode`. The
    /// returned broker belongs to `subject` and must be released as usual.
    pub fn enter_service_mode(&self, subject: &Subject) -> StorageResult<Arc<Broker>> {
        if !self.store.security().has_admin_role(subject) {
            return Err(StorageError::permission_denied(format!(
                "only administrators may switch instance '{}' to service mode",
                self.name
            )));
        }

        let me = thread::current().id();
        {
            let mut state = self.state()?;
            if state.active.contains_key(&me) {
                return Err(StorageError::invalid(
                    "the calling thread still holds a broker; release it before entering service mode",
                ));
            }
            if let Some(owner) = state.service_owner.as_deref() {
                if owner != subject.name() {
                    return Err(StorageError::locking(format!(
                        "service mode of instance '{}' is held by '{}'",
                        self.name, owner
                    )));
                }
            }
            state.service_owner = Some(subject.name().to_string());

            let deadline = self.config.acquire_timeout().map(|t| Instant::now() + t);
            while !(state.in_service_mode || state.active.is_empty()) {
                if state.shutting_down {
                    state.service_owner = None;
                    self.changed.notify_all();
                    return Err(StorageError::locking(format!(
                        "instance '{}' is shutting down",
                        self.name
                    )));
                }
                state = match self.wait(state, deadline) {
                    Ok(state) => state,
                    Err(e) => {
                        self.abandon_service_mode();
                        return Err(e);
                    }
                };
            }
            state.in_service_mode = true;

            if let Err(e) = self.run_sync(SyncKind::Major, true) {
                Logger::error(
                    "SYNC_FAILED",
                    &[("error", &e.to_string()), ("name", &self.name)],
                );
            }
        }

        log_event_with_fields(
            Event::ServiceModeEnter,
            &[("name", &self.name), ("subject", subject.name())],
        );
        self.acquire(subject)
    }

    fn abandon_service_mode(&self) {
        if let Ok(mut state) = self.state() {
            state.service_owner = None;
            state.in_service_mode = false;
        }
        self.changed.notify_all();
    }

    pub fn exit_service_mode(&self, subject: &Subject) -> StorageResult<()> {
        let mut state = self.state()?;
        if state.service_owner.as_deref() != Some(subject.name()) {
            return Err(StorageError::permission_denied(format!(
                "service mode of instance '{}' is not held by '{}'",
                self.name,
                subject.name()
            )));
        }
        state.service_owner = None;
        state.in_service_mode = false;
        drop(state);

        self.changed.notify_all();
        log_event_with_fields(
            Event::ServiceModeExit,
            &[("name", &self.name), ("subject", subject.name())],
        );
        Ok(())
    }

    /// Stop the instance. Only the first call does anything.
    ///
    /// Brokers still checked out after `max_shutdown_wait_ms` are logged and
    /// abandoned; the stores are closed regardless.
    pub fn shutdown(&self, killed: bool) -> StorageResult<()> {
        {
            let mut state = self.state()?;
            if state.shutting_down {
                return Ok(());
            }
            state.shutting_down = true;
        }
        self.changed.notify_all();
        log_event_with_fields(
            Event::ShutdownStart,
            &[("killed", &killed.to_string()), ("name", &self.name)],
        );

        let scheduler = self.scheduler.lock().ok().and_then(|mut slot| slot.take());
        if let Some(scheduler) = scheduler {
            scheduler.stop();
        }

        if self.txn_manager.is_transactional() {
            if let Err(e) = self.txn_manager.flush_to_log(true, true) {
                Logger::error(
                    "JOURNAL_FLUSH_FAILED",
                    &[("error", &e.to_string()), ("name", &self.name)],
                );
            }
        }

        let deadline = Instant::now() + self.config.max_shutdown_wait();
        let mut state = self.state()?;
        while !state.active.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                log_event_with_fields(
                    Event::ShutdownHangingBrokers,
                    &[("active", &state.active.len().to_string()), ("name", &self.name)],
                );
                break;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(state, deadline - now)
                .map_err(poisoned)?;
            state = guard;
        }

        let closed = self.store.close();
        state.shut_down = true;
        drop(state);

        let lock = self.data_lock.lock().ok().and_then(|mut slot| slot.take());
        if let Some(lock) = lock {
            if let Err(e) = lock.release() {
                Logger::warn(
                    "DATA_LOCK_RELEASE_FAILED",
                    &[("error", &e.to_string()), ("name", &self.name)],
                );
            }
        }

        log_event_with_fields(Event::ShutdownComplete, &[("name", &self.name)]);
        closed
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn store(&self) -> &NativeStore {
        &self.store
    }

    pub fn active_brokers(&self) -> usize {
        self.state().map(|s| s.active.len()).unwrap_or(0)
    }

    pub fn available_brokers(&self) -> usize {
        self.state().map(|s| s.idle.len()).unwrap_or(0)
    }

    pub fn total_brokers(&self) -> usize {
        self.state().map(|s| s.total).unwrap_or(0)
    }

    pub fn max_brokers(&self) -> usize {
        self.config.max_brokers
    }

    pub fn is_in_service_mode(&self) -> bool {
        self.state().map(|s| s.in_service_mode).unwrap_or(false)
    }

    pub fn status(&self) -> PoolStatus {
        match self.state() {
            Ok(s) if s.shut_down => PoolStatus::Shutdown,
            Ok(s) if s.shutting_down => PoolStatus::ShuttingDown,
            Ok(s) if s.in_service_mode => PoolStatus::ServiceMode,
            Ok(_) => PoolStatus::Operating,
            Err(_) => PoolStatus::Shutdown,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn report(&self) -> StorageResult<PoolReport> {
        let (active, available, total, owner) = {
            let state = self.state()?;
            (
                state.active.len(),
                state.idle.len(),
                state.total,
                state.service_owner.clone(),
            )
        };
        Ok(PoolReport {
            name: self.name.clone(),
            status: self.status(),
            active_brokers: active,
            available_brokers: available,
            total_brokers: total,
            max_brokers: self.config.max_brokers,
            service_mode_owner: owner,
            metrics: self.metrics(),
            store: self.store.stats()?,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::security::{UnixSecurityManager, DBA_GROUP};
    use tempfile::TempDir;

    pub fn pool_config(temp: &TempDir) -> DatabaseConfig {
        let mut config = DatabaseConfig::new(temp.path());
        config.sync_period_ms = 0;
        config.lock_timeout_ms = 2_000;
        config.max_shutdown_wait_ms = 500;
        config
    }

    pub fn open_pool(config: DatabaseConfig) -> Arc<BrokerPool> {
        BrokerPool::open("test", config, Arc::new(UnixSecurityManager), HookSet::new()).unwrap()
    }

    pub fn admin() -> Subject {
        Subject::new("admin", &[DBA_GROUP])
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    // =========================================================================
    // Checkout
    // =========================================================================

    /// Nested acquisitions on one thread share a broker and a subject stack.
    #[test]
    fn test_nested_acquire_reuses_broker() {
        let temp = TempDir::new().unwrap();
        let pool = open_pool(pool_config(&temp));
        let alice = Subject::new("alice", &["users"]);

        let outer = pool.acquire(&admin()).unwrap();
        let inner = pool.acquire(&alice).unwrap();
        assert_eq!(outer.id(), inner.id());
        assert_eq!(inner.subject().name(), "alice");
        assert_eq!(pool.active_brokers(), 1);

        pool.release(&inner).unwrap();
        assert_eq!(outer.subject().name(), "admin");
        assert_eq!(pool.active_brokers(), 1);

        pool.release(&outer).unwrap();
        assert_eq!(pool.active_brokers(), 0);
        assert_eq!(pool.available_brokers(), pool.total_brokers());
    }

    #[test]
    fn test_min_brokers_created_up_front() {
        let temp = TempDir::new().unwrap();
        let mut config = pool_config(&temp);
        config.min_brokers = 3;
        config.max_brokers = 4;
        let pool = open_pool(config);

        assert_eq!(pool.total_brokers(), 3);
        assert_eq!(pool.available_brokers(), 3);
        assert_eq!(pool.metrics().brokers_created, 3);
    }

    #[test]
    fn test_release_from_wrong_thread_rejected() {
        let temp = TempDir::new().unwrap();
        let pool = open_pool(pool_config(&temp));
        let broker = pool.acquire(&admin()).unwrap();

        let other = Arc::clone(&pool);
        let b = Arc::clone(&broker);
        let err = std::thread::spawn(move || other.release(&b)).join().unwrap().unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));

        pool.release(&broker).unwrap();
    }

    /// With a timeout configured, a saturated pool fails instead of blocking forever.
    #[test]
    fn test_acquire_timeout() {
        let temp = TempDir::new().unwrap();
        let mut config = pool_config(&temp);
        config.max_brokers = 1;
        config.acquire_timeout_ms = Some(100);
        let pool = open_pool(config);
        let held = pool.acquire(&admin()).unwrap();

        let other = Arc::clone(&pool);
        let err = std::thread::spawn(move || other.acquire(&admin()).map(|_| ()))
            .join()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, StorageError::Locking(_)));
        assert_eq!(pool.metrics().acquisition_waits, 1);

        pool.release(&held).unwrap();
    }

    #[test]
    fn test_with_broker_releases_on_error() {
        let temp = TempDir::new().unwrap();
        let pool = open_pool(pool_config(&temp));

        let result: StorageResult<()> =
            pool.with_broker(&Subject::guest(), |b| b.get_or_create_collection("/db/x").map(|_| ()));
        assert!(result.unwrap_err().is_permission_denied());
        assert_eq!(pool.active_brokers(), 0);
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// A sync requested while a broker is out runs on the emptying release.
    #[test]
    fn test_sync_deferred_until_idle() {
        let temp = TempDir::new().unwrap();
        let pool = open_pool(pool_config(&temp));

        pool.trigger_sync(SyncKind::Minor).unwrap();
        assert_eq!(pool.metrics().syncs_minor, 1);

        let broker = pool.acquire(&admin()).unwrap();
        pool.trigger_sync(SyncKind::Minor).unwrap();
        pool.trigger_checkpoint().unwrap();
        assert_eq!(pool.metrics().syncs_minor, 1);
        assert_eq!(pool.metrics().syncs_major, 0);

        pool.release(&broker).unwrap();
        assert_eq!(pool.metrics().syncs_minor, 1);
        assert_eq!(pool.metrics().syncs_major, 1);
    }

    #[test]
    fn test_scheduler_runs_minor_syncs() {
        let temp = TempDir::new().unwrap();
        let mut config = pool_config(&temp);
        config.sync_period_ms = 20;
        let pool = open_pool(config);

        std::thread::sleep(Duration::from_millis(200));
        assert!(pool.metrics().syncs_minor >= 1);
        pool.shutdown(false).unwrap();
    }

    // =========================================================================
    // Service mode
    // =========================================================================

    #[test]
    fn test_service_mode_requires_admin() {
        let temp = TempDir::new().unwrap();
        let pool = open_pool(pool_config(&temp));

        let err = pool.enter_service_mode(&Subject::new("bob", &["users"])).unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied(_)));
        assert!(!pool.is_in_service_mode());
    }

    #[test]
    fn test_exit_service_mode_requires_owner() {
        let temp = TempDir::new().unwrap();
        let pool = open_pool(pool_config(&temp));

        let broker = pool.enter_service_mode(&admin()).unwrap();
        assert_eq!(pool.status(), PoolStatus::ServiceMode);
        assert_eq!(pool.metrics().syncs_major, 1);

        let other_admin = Subject::new("root", &[crate::security::DBA_GROUP]);
        let err = pool.exit_service_mode(&other_admin).unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied(_)));

        pool.release(&broker).unwrap();
        pool.exit_service_mode(&admin()).unwrap();
        assert_eq!(pool.status(), PoolStatus::Operating);
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    #[test]
    fn test_shutdown_is_terminal() {
        let temp = TempDir::new().unwrap();
        let pool = open_pool(pool_config(&temp));
        assert!(temp.path().join(LOCK_FILE_NAME).exists());

        pool.shutdown(false).unwrap();
        assert_eq!(pool.status(), PoolStatus::Shutdown);
        assert!(!temp.path().join(LOCK_FILE_NAME).exists());
        assert!(pool.store().is_closed());

        let err = pool.acquire(&admin()).unwrap_err();
        assert!(matches!(err, StorageError::Locking(_)));
        pool.shutdown(false).unwrap();
    }

    /// A broker that never comes back delays shutdown by at most the configured wait.
    #[test]
    fn test_shutdown_tolerates_hanging_broker() {
        let temp = TempDir::new().unwrap();
        let pool = open_pool(pool_config(&temp));
        let _held = pool.acquire(&admin()).unwrap();

        let start = Instant::now();
        pool.shutdown(true).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert_eq!(pool.status(), PoolStatus::Shutdown);
    }

    #[test]
    fn test_second_writable_instance_refused() {
        let temp = TempDir::new().unwrap();
        let _pool = open_pool(pool_config(&temp));

        let err = BrokerPool::open(
            "second",
            pool_config(&temp),
            Arc::new(crate::security::UnixSecurityManager),
            HookSet::new(),
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::Locking(_)));
    }
}
