//! xmlstore - storage core of a hierarchical XML document database
//!
//! - `pool`: instances and the thread-bound broker pool
//! - `storage`: collections, documents, node records, binary resources
//! - `index`: range-searchable value index and structural index
//! - `txn`: transactions, collection locks, the recovery journal

pub mod btree;
pub mod cli;
pub mod config;
pub mod dom;
pub mod errors;
pub mod index;
pub mod observability;
pub mod pool;
pub mod security;
pub mod storage;
pub mod txn;

pub use config::DatabaseConfig;
pub use errors::{StorageError, StorageResult};
pub use pool::{Broker, BrokerPool, InstanceManager};
