//! Named lifecycle events
//!
//! Every state transition of the pool and every structural change of the
//! collection tree is logged under one of these names.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Instance lifecycle
    PoolConfigured,
    PoolOperating,
    ShutdownStart,
    ShutdownHangingBrokers,
    ShutdownComplete,

    // Broker pool
    BrokerCreated,
    ServiceModeEnter,
    ServiceModeExit,

    // Maintenance
    SyncMinor,
    SyncMajor,
    Checkpoint,

    // Collections and documents
    CollectionCreated,
    CollectionRemoved,
    CollectionMoved,
    CollectionCopied,
    DocumentStored,
    DocumentRemoved,

    // Indexes
    IndexFlush,
    IndexReindex,
    IndexDrop,

    /// Document id space exhausted, instance switched to read-only
    ReadOnlyEntered,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::PoolConfigured => "POOL_CONFIGURED",
            Event::PoolOperating => "POOL_OPERATING",
            Event::ShutdownStart => "SHUTDOWN_START",
            Event::ShutdownHangingBrokers => "SHUTDOWN_HANGING_BROKERS",
            Event::ShutdownComplete => "SHUTDOWN_COMPLETE",
            Event::BrokerCreated => "BROKER_CREATED",
            Event::ServiceModeEnter => "SERVICE_MODE_ENTER",
            Event::ServiceModeExit => "SERVICE_MODE_EXIT",
            Event::SyncMinor => "SYNC_MINOR",
            Event::SyncMajor => "SYNC_MAJOR",
            Event::Checkpoint => "CHECKPOINT",
            Event::CollectionCreated => "COLLECTION_CREATED",
            Event::CollectionRemoved => "COLLECTION_REMOVED",
            Event::CollectionMoved => "COLLECTION_MOVED",
            Event::CollectionCopied => "COLLECTION_COPIED",
            Event::DocumentStored => "DOCUMENT_STORED",
            Event::DocumentRemoved => "DOCUMENT_REMOVED",
            Event::IndexFlush => "INDEX_FLUSH",
            Event::IndexReindex => "INDEX_REINDEX",
            Event::IndexDrop => "INDEX_DROP",
            Event::ReadOnlyEntered => "READ_ONLY_ENTERED",
        }
    }

    /// Events that indicate degraded operation
    pub fn is_warning(&self) -> bool {
        matches!(self, Event::ShutdownHangingBrokers | Event::ReadOnlyEntered)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
