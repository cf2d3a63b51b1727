//! Periodic maintenance
//!
//! A background thread asks the pool for a minor sync every sync period and
//! escalates to a major sync once the major period has elapsed. The pool
//! decides whether the sync runs immediately or waits for the next idle
//! moment.

use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::observability::Logger;
use crate::storage::SyncKind;

use super::BrokerPool;

pub(crate) struct SyncScheduler {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl SyncScheduler {
    pub(crate) fn start(pool: Weak<BrokerPool>, period: Duration, major_period: Duration) -> Self {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("xmlstore-sync".to_string())
            .spawn(move || run(pool, signal, period, major_period));

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                Logger::error("SCHEDULER_START_FAILED", &[("error", &e.to_string())]);
                None
            }
        };

        Self { stop, handle }
    }

    /// Signal the thread and wait for it, unless called from the thread itself.
    pub(crate) fn stop(mut self) {
        let (flag, cvar) = &*self.stop;
        if let Ok(mut stopped) = flag.lock() {
            *stopped = true;
        }
        cvar.notify_all();

        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                Logger::error("SCHEDULER_PANICKED", &[]);
            }
        }
    }
}

fn run(pool: Weak<BrokerPool>, stop: Arc<(Mutex<bool>, Condvar)>, period: Duration, major_period: Duration) {
    let (flag, cvar) = &*stop;
    let mut last_major = Instant::now();

    loop {
        {
            let Ok(guard) = flag.lock() else { return };
            let Ok((stopped, _)) = cvar.wait_timeout_while(guard, period, |stopped| !*stopped) else {
                return;
            };
            if *stopped {
                return;
            }
        }

        let Some(pool) = pool.upgrade() else { return };
        let kind = if last_major.elapsed() >= major_period {
            last_major = Instant::now();
            SyncKind::Major
        } else {
            SyncKind::Minor
        };
        if let Err(e) = pool.trigger_sync(kind) {
            Logger::warn("SCHEDULED_SYNC_FAILED", &[("error", &e.to_string())]);
        }
    }
}
