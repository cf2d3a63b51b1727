//! Transactions, journal and collection locks

mod journal;
mod lock;
mod manager;

pub use journal::{read_journal, Journal, JournalEntry, JournalRecord, Lsn};
pub use lock::{LockMode, ReentrantLock};
pub use manager::{TransactionManager, Txn, TxnState};
