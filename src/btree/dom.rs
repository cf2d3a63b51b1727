//! Address-chained node records
//!
//! Every stored node of every document lives here as one record. Records of
//! a document form a doubly linked chain in document order, so sequential
//! inserts are appends and a subtree can be read by walking `next` from its
//! first node. Addresses are `page << 16 | slot`; a page holds
//! `SLOTS_PER_PAGE` records. Records never move on update.

use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use super::store::BTreeStore;
use crate::errors::{StorageError, StorageResult};

pub const SLOTS_PER_PAGE: u64 = 256;
const FIRST_PAGE: u64 = 1;
const NO_ADDRESS: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress(u64);

impl NodeAddress {
    pub fn new(page: u64, slot: u64) -> Self {
        NodeAddress((page << 16) | (slot & 0xFFFF))
    }

    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw == NO_ADDRESS {
            None
        } else {
            Some(NodeAddress(raw))
        }
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn page(&self) -> u64 {
        self.0 >> 16
    }

    pub fn slot(&self) -> u64 {
        self.0 & 0xFFFF
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page(), self.slot())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomRecord {
    pub doc_id: u32,
    pub prev: Option<NodeAddress>,
    pub next: Option<NodeAddress>,
    pub payload: Vec<u8>,
}

impl DomRecord {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(20 + self.payload.len());
        out.extend_from_slice(&self.doc_id.to_be_bytes());
        out.extend_from_slice(&self.prev.map(|a| a.raw()).unwrap_or(NO_ADDRESS).to_be_bytes());
        out.extend_from_slice(&self.next.map(|a| a.raw()).unwrap_or(NO_ADDRESS).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    fn decode(data: &[u8]) -> StorageResult<Self> {
        if data.len() < 20 {
            return Err(StorageError::storage("dom record header truncated"));
        }
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[at..at + 8]);
            u64::from_be_bytes(b)
        };
        Ok(Self {
            doc_id: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            prev: NodeAddress::from_raw(u64_at(4)),
            next: NodeAddress::from_raw(u64_at(12)),
            payload: data[20..].to_vec(),
        })
    }
}

pub struct DomFile {
    records: BTreeStore,
    /// Next free address; serialized under this mutex
    next_free: Mutex<NodeAddress>,
}

impl DomFile {
    pub fn in_memory() -> Self {
        Self {
            records: BTreeStore::in_memory("dom"),
            next_free: Mutex::new(NodeAddress::new(FIRST_PAGE, 0)),
        }
    }

    pub fn open(dir: &Path) -> StorageResult<Self> {
        let records = BTreeStore::open(dir, "dom")?;
        let next_free = match records.last_key()? {
            Some(key) => Self::successor(Self::address_of(&key)?),
            None => NodeAddress::new(FIRST_PAGE, 0),
        };
        Ok(Self {
            records,
            next_free: Mutex::new(next_free),
        })
    }

    fn successor(addr: NodeAddress) -> NodeAddress {
        if addr.slot() + 1 >= SLOTS_PER_PAGE {
            NodeAddress::new(addr.page() + 1, 0)
        } else {
            NodeAddress::new(addr.page(), addr.slot() + 1)
        }
    }

    fn address_of(key: &[u8]) -> StorageResult<NodeAddress> {
        let bytes: [u8; 8] = key
            .try_into()
            .map_err(|_| StorageError::storage("dom key is not an address"))?;
        NodeAddress::from_raw(u64::from_be_bytes(bytes))
            .ok_or_else(|| StorageError::storage("dom key is the null address"))
    }

    fn allocate(&self) -> StorageResult<NodeAddress> {
        let mut next = self
            .next_free
            .lock()
            .map_err(|_| StorageError::locking("dom allocator poisoned"))?;
        let addr = *next;
        *next = Self::successor(addr);
        Ok(addr)
    }

    pub fn store(&self) -> &BTreeStore {
        &self.records
    }

    pub fn get(&self, addr: NodeAddress) -> StorageResult<Option<DomRecord>> {
        match self.records.get(&addr.raw().to_be_bytes())? {
            Some(raw) => Ok(Some(DomRecord::decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn require(&self, addr: NodeAddress) -> StorageResult<DomRecord> {
        self.get(addr)?
            .ok_or_else(|| StorageError::storage(format!("dangling node address {}", addr)))
    }

    fn put(&self, addr: NodeAddress, record: &DomRecord) -> StorageResult<()> {
        self.records.put(addr.raw().to_be_bytes().to_vec(), record.encode())
    }

    /// Store a record directly after `prev` in its chain, or as the head of a
    /// new chain when `prev` is None.
    pub fn insert_after(
        &self,
        doc_id: u32,
        prev: Option<NodeAddress>,
        payload: Vec<u8>,
    ) -> StorageResult<NodeAddress> {
        let addr = self.allocate()?;
        let mut record = DomRecord {
            doc_id,
            prev,
            next: None,
            payload,
        };
        if let Some(prev_addr) = prev {
            let mut prev_record = self.require(prev_addr)?;
            record.next = prev_record.next;
            prev_record.next = Some(addr);
            if let Some(next_addr) = record.next {
                let mut next_record = self.require(next_addr)?;
                next_record.prev = Some(addr);
                self.put(next_addr, &next_record)?;
            }
            self.put(prev_addr, &prev_record)?;
        }
        self.put(addr, &record)?;
        Ok(addr)
    }

    pub fn update(&self, addr: NodeAddress, payload: Vec<u8>) -> StorageResult<()> {
        let mut record = self.require(addr)?;
        record.payload = payload;
        self.put(addr, &record)
    }

    /// Unlink and delete one record.
    pub fn remove(&self, addr: NodeAddress) -> StorageResult<DomRecord> {
        let record = self.require(addr)?;
        if let Some(prev_addr) = record.prev {
            let mut prev_record = self.require(prev_addr)?;
            prev_record.next = record.next;
            self.put(prev_addr, &prev_record)?;
        }
        if let Some(next_addr) = record.next {
            let mut next_record = self.require(next_addr)?;
            next_record.prev = record.prev;
            self.put(next_addr, &next_record)?;
        }
        self.records.remove(&addr.raw().to_be_bytes())?;
        Ok(record)
    }

    /// Walk the chain starting at `first` while `keep_going` accepts records.
    pub fn walk<F>(&self, first: NodeAddress, mut keep_going: F) -> StorageResult<()>
    where
        F: FnMut(NodeAddress, &DomRecord) -> StorageResult<bool>,
    {
        let mut cursor = Some(first);
        while let Some(addr) = cursor {
            let record = self.require(addr)?;
            if !keep_going(addr, &record)? {
                break;
            }
            cursor = record.next;
        }
        Ok(())
    }

    /// Delete a whole chain; returns the number of records removed.
    pub fn remove_chain(&self, first: NodeAddress) -> StorageResult<usize> {
        let mut addresses = Vec::new();
        self.walk(first, |addr, _| {
            addresses.push(addr);
            Ok(true)
        })?;
        for addr in &addresses {
            self.records.remove(&addr.raw().to_be_bytes())?;
        }
        Ok(addresses.len())
    }

    pub fn sync(&self) -> StorageResult<bool> {
        self.records.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chain(dom: &DomFile, first: NodeAddress) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        dom.walk(first, |_, r| {
            out.push(r.payload.clone());
            Ok(true)
        })
        .unwrap();
        out
    }

    #[test]
    fn test_append_builds_chain() {
        let dom = DomFile::in_memory();
        let a = dom.insert_after(7, None, b"a".to_vec()).unwrap();
        let b = dom.insert_after(7, Some(a), b"b".to_vec()).unwrap();
        dom.insert_after(7, Some(b), b"c".to_vec()).unwrap();
        assert_eq!(chain(&dom, a), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_insert_in_middle_and_remove() {
        let dom = DomFile::in_memory();
        let a = dom.insert_after(1, None, b"a".to_vec()).unwrap();
        let c = dom.insert_after(1, Some(a), b"c".to_vec()).unwrap();
        let b = dom.insert_after(1, Some(a), b"b".to_vec()).unwrap();
        assert_eq!(chain(&dom, a), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        dom.remove(b).unwrap();
        assert_eq!(chain(&dom, a), vec![b"a".to_vec(), b"c".to_vec()]);
        assert_eq!(dom.get(c).unwrap().unwrap().prev, Some(a));
    }

    #[test]
    fn test_addresses_roll_over_pages() {
        let dom = DomFile::in_memory();
        let mut prev = None;
        let mut last = NodeAddress::new(0, 0);
        for _ in 0..(SLOTS_PER_PAGE + 1) {
            last = dom.insert_after(1, prev, vec![]).unwrap();
            prev = Some(last);
        }
        assert_eq!(last.page(), FIRST_PAGE + 1);
        assert_eq!(last.slot(), 0);
    }

    #[test]
    fn test_reopen_continues_allocation() {
        let temp = TempDir::new().unwrap();
        let first = {
            let dom = DomFile::open(temp.path()).unwrap();
            let a = dom.insert_after(1, None, b"x".to_vec()).unwrap();
            dom.sync().unwrap();
            a
        };
        let dom = DomFile::open(temp.path()).unwrap();
        let next = dom.insert_after(2, None, b"y".to_vec()).unwrap();
        assert!(next > first);
        assert_eq!(dom.remove_chain(first).unwrap(), 1);
    }
}
