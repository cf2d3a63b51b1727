//! Cooperative cancellation for index scans

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::errors::{StorageError, StorageResult};

/// Polled between collections and between records of a scan. A scan that
/// sees `proceed()` fail stops and returns `Terminated`.
#[derive(Debug, Default)]
pub struct Watchdog {
    terminated: AtomicBool,
    deadline: Option<Instant>,
    max_results: Option<usize>,
    results: AtomicUsize,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            ..Self::default()
        }
    }

    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = Some(max);
        self
    }

    /// Request cancellation; safe from any thread.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn add_results(&self, n: usize) {
        self.results.fetch_add(n, Ordering::Relaxed);
    }

    pub fn proceed(&self) -> StorageResult<()> {
        if self.is_terminated() {
            return Err(StorageError::Terminated("query terminated".into()));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(StorageError::Terminated("query timed out".into()));
            }
        }
        if let Some(max) = self.max_results {
            if self.results.load(Ordering::Relaxed) > max {
                return Err(StorageError::Terminated(format!(
                    "result limit of {} exceeded",
                    max
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminate() {
        let dog = Watchdog::new();
        assert!(dog.proceed().is_ok());
        dog.terminate();
        assert!(matches!(dog.proceed(), Err(StorageError::Terminated(_))));
    }

    #[test]
    fn test_deadline() {
        let dog = Watchdog::with_timeout(Duration::from_millis(0));
        assert!(dog.proceed().is_err());
    }

    #[test]
    fn test_result_limit() {
        let dog = Watchdog::new().with_max_results(2);
        dog.add_results(2);
        assert!(dog.proceed().is_ok());
        dog.add_results(1);
        assert!(dog.proceed().is_err());
    }
}
