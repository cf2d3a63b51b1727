//! Write-ahead journal
//!
//! Records filesystem renames, binary resource mutations and transaction
//! boundaries so a crashed instance can be replayed.
//!
//! Frame layout:
//!
//! ```text
//! payload len u32 LE | crc32 u32 LE | JSON payload
//! ```
//!
//! Every append is fsynced before it is acknowledged. A frame cut short at
//! the end of the file is a torn write and ends the log; a checksum mismatch
//! anywhere is corruption.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::btree::checksum::{compute_checksum, verify_checksum};
use crate::errors::{StorageError, StorageResult};

/// Log sequence number
pub type Lsn = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalRecord {
    TxnStart,
    TxnCommit,
    TxnAbort,
    Checkpoint,
    RenameBinaryDir { from: String, to: String },
    RenameBinary { from: String, to: String },
    StoreBinary { path: String, digest: String },
    RemoveBinary { path: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub lsn: Lsn,
    pub txn_id: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub record: JournalRecord,
}

pub struct Journal {
    path: PathBuf,
    file: File,
    next_lsn: Lsn,
}

impl Journal {
    /// Open or create `<data_dir>/journal/journal.log`.
    pub fn open(data_dir: &Path) -> StorageResult<Self> {
        let dir = data_dir.join("journal");
        fs::create_dir_all(&dir)?;
        let path = dir.join("journal.log");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let next_lsn = read_journal(&path)?.last().map(|e| e.lsn + 1).unwrap_or(1);
        Ok(Self {
            path,
            file,
            next_lsn,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    pub fn write_to_log(&mut self, txn_id: Option<u64>, record: JournalRecord) -> StorageResult<Lsn> {
        let lsn = self.next_lsn;
        let entry = JournalEntry {
            lsn,
            txn_id,
            timestamp: Utc::now(),
            record,
        };
        let payload = serde_json::to_vec(&entry)?;
        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&compute_checksum(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        self.file.write_all(&frame).map_err(|e| {
            StorageError::storage(format!("journal append failed at lsn {}: {}", lsn, e))
        })?;
        self.file.sync_all().map_err(|e| {
            StorageError::storage(format!("journal fsync failed at lsn {}: {}", lsn, e))
        })?;
        self.next_lsn += 1;
        Ok(lsn)
    }

    pub fn flush_to_log(&mut self, force: bool, sync: bool) -> StorageResult<()> {
        self.file.flush()?;
        if force || sync {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Discard every record; sequence numbers keep increasing.
    pub fn truncate(&mut self) -> StorageResult<()> {
        let file = OpenOptions::new().write(true).truncate(true).open(&self.path)?;
        file.sync_all()?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        Ok(())
    }
}

/// Read every intact entry of a journal file.
pub fn read_journal(path: &Path) -> StorageResult<Vec<JournalEntry>> {
    let mut data = Vec::new();
    match File::open(path) {
        Ok(mut f) => {
            f.read_to_end(&mut data)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    }

    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos + 8 <= data.len() {
        let len = u32::from_le_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]) as usize;
        let crc = u32::from_le_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
        let start = pos + 8;
        if start + len > data.len() {
            break;
        }
        let payload = &data[start..start + len];
        if !verify_checksum(payload, crc) {
            return Err(StorageError::storage(format!(
                "journal corruption at offset {} in {}",
                pos,
                path.display()
            )));
        }
        entries.push(serde_json::from_slice(payload)?);
        pos = start + len;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_replay() {
        let temp = TempDir::new().unwrap();
        let mut journal = Journal::open(temp.path()).unwrap();
        journal.write_to_log(Some(1), JournalRecord::TxnStart).unwrap();
        journal
            .write_to_log(
                Some(1),
                JournalRecord::RenameBinaryDir {
                    from: "fs/db/a".into(),
                    to: "fs/db/b".into(),
                },
            )
            .unwrap();
        journal.write_to_log(Some(1), JournalRecord::TxnCommit).unwrap();

        let entries = read_journal(journal.path()).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].lsn, 2);
        assert!(matches!(entries[1].record, JournalRecord::RenameBinaryDir { .. }));
    }

    #[test]
    fn test_reopen_continues_lsn() {
        let temp = TempDir::new().unwrap();
        {
            let mut journal = Journal::open(temp.path()).unwrap();
            journal.write_to_log(None, JournalRecord::Checkpoint).unwrap();
        }
        let journal = Journal::open(temp.path()).unwrap();
        assert_eq!(journal.next_lsn(), 2);
    }

    #[test]
    fn test_torn_tail_ends_log() {
        let temp = TempDir::new().unwrap();
        let path = {
            let mut journal = Journal::open(temp.path()).unwrap();
            journal.write_to_log(None, JournalRecord::TxnStart).unwrap();
            journal.path().to_path_buf()
        };
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[200, 0, 0, 0, 1, 2]).unwrap();

        assert_eq!(read_journal(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_corruption_detected() {
        let temp = TempDir::new().unwrap();
        let path = {
            let mut journal = Journal::open(temp.path()).unwrap();
            journal.write_to_log(None, JournalRecord::TxnStart).unwrap();
            journal.path().to_path_buf()
        };
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 2;
        raw[last] ^= 0x20;
        fs::write(&path, raw).unwrap();
        assert!(read_journal(&path).is_err());
    }

    #[test]
    fn test_truncate_keeps_sequence() {
        let temp = TempDir::new().unwrap();
        let mut journal = Journal::open(temp.path()).unwrap();
        journal.write_to_log(None, JournalRecord::TxnStart).unwrap();
        journal.truncate().unwrap();
        let lsn = journal.write_to_log(None, JournalRecord::Checkpoint).unwrap();
        assert_eq!(lsn, 2);
        assert_eq!(read_journal(journal.path()).unwrap().len(), 1);
    }
}
