//! Operational counters
//!
//! - Counters only, monotonic, reset on process start
//! - Relaxed atomics; values are exact once writers are quiescent

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    brokers_created: AtomicU64,
    acquisitions: AtomicU64,
    acquisition_waits: AtomicU64,
    syncs_minor: AtomicU64,
    syncs_major: AtomicU64,
    index_flushes: AtomicU64,
    index_keys_written: AtomicU64,
    index_key_failures: AtomicU64,
    documents_stored: AtomicU64,
    documents_removed: AtomicU64,
    collections_created: AtomicU64,
    collections_removed: AtomicU64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub brokers_created: u64,
    pub acquisitions: u64,
    pub acquisition_waits: u64,
    pub syncs_minor: u64,
    pub syncs_major: u64,
    pub index_flushes: u64,
    pub index_keys_written: u64,
    pub index_key_failures: u64,
    pub documents_stored: u64,
    pub documents_removed: u64,
    pub collections_created: u64,
    pub collections_removed: u64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_brokers_created(&self) {
        self.brokers_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_acquisitions(&self) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    /// An acquisition had to block on a saturated pool or on service mode.
    pub fn increment_acquisition_waits(&self) {
        self.acquisition_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_syncs_minor(&self) {
        self.syncs_minor.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_syncs_major(&self) {
        self.syncs_major.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_index_flushes(&self) {
        self.index_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_index_keys_written(&self, keys: u64) {
        self.index_keys_written.fetch_add(keys, Ordering::Relaxed);
    }

    pub fn add_index_key_failures(&self, keys: u64) {
        self.index_key_failures.fetch_add(keys, Ordering::Relaxed);
    }

    pub fn increment_documents_stored(&self) {
        self.documents_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_documents_removed(&self) {
        self.documents_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_collections_created(&self) {
        self.collections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_collections_removed(&self) {
        self.collections_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            brokers_created: self.brokers_created.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            acquisition_waits: self.acquisition_waits.load(Ordering::Relaxed),
            syncs_minor: self.syncs_minor.load(Ordering::Relaxed),
            syncs_major: self.syncs_major.load(Ordering::Relaxed),
            index_flushes: self.index_flushes.load(Ordering::Relaxed),
            index_keys_written: self.index_keys_written.load(Ordering::Relaxed),
            index_key_failures: self.index_key_failures.load(Ordering::Relaxed),
            documents_stored: self.documents_stored.load(Ordering::Relaxed),
            documents_removed: self.documents_removed.load(Ordering::Relaxed),
            collections_created: self.collections_created.load(Ordering::Relaxed),
            collections_removed: self.collections_removed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_counters_start_at_zero() {
        assert_eq!(MetricsRegistry::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_concurrent_increments_are_exact() {
        let metrics = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        m.increment_acquisitions();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.snapshot().acquisitions, 4000);
    }

    #[test]
    fn test_add_index_keys() {
        let metrics = MetricsRegistry::new();
        metrics.add_index_keys_written(7);
        metrics.add_index_key_failures(2);
        let snap = metrics.snapshot();
        assert_eq!(snap.index_keys_written, 7);
        assert_eq!(snap.index_key_failures, 2);
    }
}
