//! Page and B-tree store capability
//!
//! - `BTreeStore`: ordered byte keys, range and prefix scans, per-file lock
//! - `DomFile`: address-chained node records
//!
//! Both live in memory and are persisted as checksummed snapshots on sync.

pub mod checksum;
mod dom;
mod snapshot;
mod store;

pub use dom::{DomFile, DomRecord, NodeAddress, SLOTS_PER_PAGE};
pub use store::{BTreeStore, IndexQuery};
