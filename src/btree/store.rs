//! Ordered byte-key store backing every index and metadata file
//!
//! Keys sort bytewise, so composite keys built from big-endian fields sort
//! field by field. Each store carries its own reader/writer lock: any number
//! of readers or one writer. Query callbacks run under the read lock and must
//! not write to the same store.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::snapshot::{read_snapshot, write_snapshot};
use crate::errors::{StorageError, StorageResult};

/// Scan operator, evaluated within a key prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexQuery {
    Eq(Vec<u8>),
    Lt(Vec<u8>),
    Leq(Vec<u8>),
    Gt(Vec<u8>),
    Geq(Vec<u8>),
    Neq(Vec<u8>),
    /// Keys starting with the given bytes
    TruncRight(Vec<u8>),
    All,
}

pub struct BTreeStore {
    name: String,
    path: Option<PathBuf>,
    tree: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    read_only: AtomicBool,
    dirty: AtomicBool,
}

impl BTreeStore {
    /// A store that never touches disk
    pub fn in_memory(name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: None,
            tree: RwLock::new(BTreeMap::new()),
            read_only: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        }
    }

    /// Open `<dir>/<name>.dbx`, loading the last snapshot if present.
    pub fn open(dir: &Path, name: &str) -> StorageResult<Self> {
        let path = dir.join(format!("{}.dbx", name));
        let tree = if path.exists() {
            read_snapshot(&path)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            name: name.to_string(),
            path: Some(path),
            tree: RwLock::new(tree),
            read_only: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Release);
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>> {
        self.tree
            .read()
            .map_err(|_| StorageError::locking(format!("{}: lock poisoned", self.name)))
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>> {
        if self.is_read_only() {
            return Err(StorageError::read_only(format!("{} is read-only", self.name)));
        }
        let guard = self
            .tree
            .write()
            .map_err(|_| StorageError::locking(format!("{}: lock poisoned", self.name)))?;
        self.dirty.store(true, Ordering::Release);
        Ok(guard)
    }

    pub fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.read()?.get(key).cloned())
    }

    pub fn contains(&self, key: &[u8]) -> StorageResult<bool> {
        Ok(self.read()?.contains_key(key))
    }

    /// Insert or overwrite
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.write()?.insert(key, value);
        Ok(())
    }

    /// Append bytes to the value under `key`, creating it if absent.
    pub fn append(&self, key: Vec<u8>, data: &[u8]) -> StorageResult<()> {
        self.write()?.entry(key).or_default().extend_from_slice(data);
        Ok(())
    }

    /// Overwrite an existing value; fails with `NotFound` if absent.
    pub fn update(&self, key: &[u8], value: Vec<u8>) -> StorageResult<()> {
        let mut tree = self.write()?;
        match tree.get_mut(key) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(StorageError::not_found(format!("{}: key not present", self.name))),
        }
    }

    /// Read-modify-write one value under the write lock.
    ///
    /// `f` sees the current value and returns the replacement; `None`
    /// deletes the key. Returns false if the key was absent (`f` not called).
    pub fn rewrite<F>(&self, key: &[u8], f: F) -> StorageResult<bool>
    where
        F: FnOnce(&[u8]) -> StorageResult<Option<Vec<u8>>>,
    {
        let mut tree = self.write()?;
        let Some(current) = tree.get(key) else {
            return Ok(false);
        };
        match f(current)? {
            Some(value) => {
                tree.insert(key.to_vec(), value);
            }
            None => {
                tree.remove(key);
            }
        }
        Ok(true)
    }

    pub fn remove(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.write()?.remove(key))
    }

    /// Remove every key starting with `prefix`; returns how many went.
    pub fn remove_prefix(&self, prefix: &[u8]) -> StorageResult<usize> {
        let mut tree = self.write()?;
        let doomed: Vec<Vec<u8>> = tree
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            tree.remove(key);
        }
        Ok(doomed.len())
    }

    /// Scan keys under `prefix` selected by `query`, in key order.
    ///
    /// The callback returns `Ok(false)` to stop early; an `Err` aborts the
    /// scan and is returned.
    pub fn query<F>(&self, prefix: &[u8], query: &IndexQuery, mut callback: F) -> StorageResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> StorageResult<bool>,
    {
        let tree = self.read()?;
        let lower: Bound<&[u8]> = match query {
            IndexQuery::Gt(k) => Bound::Excluded(k.as_slice()),
            IndexQuery::Eq(k) | IndexQuery::Geq(k) | IndexQuery::TruncRight(k) => {
                Bound::Included(k.as_slice())
            }
            _ => Bound::Included(prefix),
        };

        for (key, value) in tree.range::<[u8], _>((lower, Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                break;
            }
            let selected = match query {
                IndexQuery::Eq(k) => {
                    if key != k {
                        break;
                    }
                    true
                }
                IndexQuery::Lt(k) => {
                    if key >= k {
                        break;
                    }
                    true
                }
                IndexQuery::Leq(k) => {
                    if key > k {
                        break;
                    }
                    true
                }
                IndexQuery::TruncRight(k) => {
                    if !key.starts_with(k) {
                        break;
                    }
                    true
                }
                IndexQuery::Neq(k) => key != k,
                IndexQuery::Gt(_) | IndexQuery::Geq(_) | IndexQuery::All => true,
            };
            if selected && !callback(key, value)? {
                break;
            }
        }
        Ok(())
    }

    /// Every entry under `prefix`
    pub fn query_prefix<F>(&self, prefix: &[u8], callback: F) -> StorageResult<()>
    where
        F: FnMut(&[u8], &[u8]) -> StorageResult<bool>,
    {
        self.query(prefix, &IndexQuery::All, callback)
    }

    /// Collect every key under `prefix`
    pub fn keys_with_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        self.query_prefix(prefix, |k, _| {
            keys.push(k.to_vec());
            Ok(true)
        })?;
        Ok(keys)
    }

    pub fn last_key(&self) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.read()?.keys().next_back().cloned())
    }

    pub fn len(&self) -> StorageResult<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop every entry
    pub fn truncate(&self) -> StorageResult<()> {
        self.write()?.clear();
        Ok(())
    }

    /// Persist a snapshot if anything changed since the last sync.
    pub fn sync(&self) -> StorageResult<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(false);
        }
        let tree = self.read()?;
        write_snapshot(path, &tree)?;
        self.dirty.store(false, Ordering::Release);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with(keys: &[&str]) -> BTreeStore {
        let store = BTreeStore::in_memory("test");
        for k in keys {
            store.put(k.as_bytes().to_vec(), k.as_bytes().to_vec()).unwrap();
        }
        store
    }

    fn scan(store: &BTreeStore, prefix: &str, query: IndexQuery) -> Vec<String> {
        let mut out = Vec::new();
        store
            .query(prefix.as_bytes(), &query, |k, _| {
                out.push(String::from_utf8(k.to_vec()).unwrap());
                Ok(true)
            })
            .unwrap();
        out
    }

    #[test]
    fn test_range_operators_stay_inside_prefix() {
        let store = store_with(&["a1", "a2", "a3", "b1"]);
        assert_eq!(scan(&store, "a", IndexQuery::Eq(b"a2".to_vec())), vec!["a2"]);
        assert_eq!(scan(&store, "a", IndexQuery::Lt(b"a2".to_vec())), vec!["a1"]);
        assert_eq!(scan(&store, "a", IndexQuery::Leq(b"a2".to_vec())), vec!["a1", "a2"]);
        assert_eq!(scan(&store, "a", IndexQuery::Gt(b"a2".to_vec())), vec!["a3"]);
        assert_eq!(scan(&store, "a", IndexQuery::Geq(b"a2".to_vec())), vec!["a2", "a3"]);
        assert_eq!(scan(&store, "a", IndexQuery::Neq(b"a2".to_vec())), vec!["a1", "a3"]);
        assert_eq!(scan(&store, "", IndexQuery::TruncRight(b"b".to_vec())), vec!["b1"]);
    }

    #[test]
    fn test_append_and_update() {
        let store = BTreeStore::in_memory("test");
        store.append(b"k".to_vec(), b"ab").unwrap();
        store.append(b"k".to_vec(), b"cd").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"abcd".to_vec()));
        store.update(b"k", b"x".to_vec()).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"x".to_vec()));
        assert!(matches!(store.update(b"missing", vec![]), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_rewrite_replaces_or_deletes() {
        let store = store_with(&["k"]);
        assert!(store.rewrite(b"k", |v| Ok(Some([v, b"!"].concat()))).unwrap());
        assert_eq!(store.get(b"k").unwrap(), Some(b"k!".to_vec()));
        assert!(store.rewrite(b"k", |_| Ok(None)).unwrap());
        assert!(!store.contains(b"k").unwrap());
        assert!(!store.rewrite(b"k", |_| Ok(None)).unwrap());
    }

    #[test]
    fn test_remove_prefix() {
        let store = store_with(&["c1/a", "c1/b", "c2/a"]);
        assert_eq!(store.remove_prefix(b"c1/").unwrap(), 2);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let store = BTreeStore::in_memory("test");
        store.set_read_only(true);
        let err = store.put(b"k".to_vec(), vec![]).unwrap_err();
        assert!(err.is_permission_denied());
    }

    #[test]
    fn test_callback_error_aborts_scan() {
        let store = store_with(&["a", "b", "c"]);
        let mut seen = 0;
        let result = store.query_prefix(b"", |_, _| {
            seen += 1;
            Err(StorageError::Terminated("stop".into()))
        });
        assert!(result.is_err());
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_sync_and_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let store = BTreeStore::open(temp.path(), "collections").unwrap();
            store.put(b"/db".to_vec(), b"root".to_vec()).unwrap();
            assert!(store.sync().unwrap());
            assert!(!store.sync().unwrap());
        }
        let reopened = BTreeStore::open(temp.path(), "collections").unwrap();
        assert_eq!(reopened.get(b"/db").unwrap(), Some(b"root".to_vec()));
    }
}
