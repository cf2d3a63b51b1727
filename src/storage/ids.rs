//! Id allocation for collections and documents
//!
//! Freed ids are reused before the counter advances. The free list is not
//! persisted: on open it is rebuilt from the gaps between the ids in use.

use std::collections::BTreeSet;

/// Largest document id; allocating past it makes the instance read-only
pub const MAX_DOCUMENT_ID: u32 = 0x7FFF_FFFF;
pub const MAX_COLLECTION_ID: u32 = u32::MAX - 1;

#[derive(Debug, Clone)]
pub struct IdAllocator {
    free: BTreeSet<u32>,
    next: u32,
    limit: u32,
}

impl IdAllocator {
    pub fn new(limit: u32) -> Self {
        Self {
            free: BTreeSet::new(),
            next: 1,
            limit,
        }
    }

    /// Allocator continuing after the ids in `used`, with every unused id
    /// below the highest one on the free list.
    pub fn from_used(used: impl IntoIterator<Item = u32>, limit: u32) -> Self {
        let used: BTreeSet<u32> = used.into_iter().collect();
        let next = used.iter().next_back().map(|max| max + 1).unwrap_or(1);
        let free = (1..next).filter(|id| !used.contains(id)).collect();
        Self { free, next, limit }
    }

    /// None once the id space is exhausted
    pub fn allocate(&mut self) -> Option<u32> {
        if let Some(id) = self.free.pop_first() {
            return Some(id);
        }
        if self.next > self.limit {
            return None;
        }
        let id = self.next;
        self.next += 1;
        Some(id)
    }

    pub fn release(&mut self, id: u32) {
        if id < self.next {
            self.free.insert(id);
        }
    }

    pub fn is_in_use(&self, id: u32) -> bool {
        id < self.next && !self.free.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_list_before_counter() {
        let mut ids = IdAllocator::new(100);
        assert_eq!(ids.allocate(), Some(1));
        assert_eq!(ids.allocate(), Some(2));
        assert_eq!(ids.allocate(), Some(3));
        ids.release(2);
        assert_eq!(ids.allocate(), Some(2));
        assert_eq!(ids.allocate(), Some(4));
    }

    #[test]
    fn test_rebuilt_from_gaps() {
        let mut ids = IdAllocator::from_used([1, 4, 5], 100);
        assert_eq!(ids.allocate(), Some(2));
        assert_eq!(ids.allocate(), Some(3));
        assert_eq!(ids.allocate(), Some(6));
        assert!(ids.is_in_use(4));
    }

    #[test]
    fn test_exhaustion() {
        let mut ids = IdAllocator::new(2);
        ids.allocate();
        ids.allocate();
        assert_eq!(ids.allocate(), None);
        ids.release(1);
        assert_eq!(ids.allocate(), Some(1));
    }
}
