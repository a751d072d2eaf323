// src/slab.rs
use std::sync::{Arc, Mutex};

use crate::conn::{HttpConn, SharedConn};

struct Entry {
    conn: SharedConn,
    generation: u64,
    next_free: Option<usize>,
    live: bool,
}

/// Fixed set of connection slots with an intrusive free list. Slots are
/// created once and handed out again after being freed; each hand-out bumps
/// the slot's generation so stale work for a previous tenant can be told
/// apart.
pub struct ConnectionSlab {
    entries: Box<[Entry]>,
    head_free: Option<usize>,
    active_count: usize,
}

impl ConnectionSlab {
    /// Allocate every slot up front. `make` builds the closed connection
    /// for a slot index.
    pub fn new<F>(capacity: usize, mut make: F) -> Self
    where
        F: FnMut(usize) -> HttpConn,
    {
        let entries: Vec<Entry> = (0..capacity)
            .map(|i| Entry {
                conn: Arc::new(Mutex::new(make(i))),
                generation: 0,
                next_free: (i + 1 < capacity).then_some(i + 1),
                live: false,
            })
            .collect();

        Self {
            entries: entries.into_boxed_slice(),
            head_free: (capacity > 0).then_some(0),
            active_count: 0,
        }
    }

    /// O(1) allocation: returns the slot index and its new generation, or
    /// `None` when every slot is taken.
    #[inline(always)]
    pub fn allocate(&mut self) -> Option<(usize, u64)> {
        let idx = self.head_free?;
        let entry = &mut self.entries[idx];
        self.head_free = entry.next_free.take();
        entry.live = true;
        entry.generation = entry.generation.wrapping_add(1);
        self.active_count += 1;
        Some((idx, entry.generation))
    }

    /// O(1) deallocation. Freeing a slot that is not live is a no-op.
    #[inline(always)]
    pub fn free(&mut self, index: usize) -> bool {
        let Some(entry) = self.entries.get_mut(index) else {
            return false;
        };
        if !entry.live {
            return false; // Double free prevention
        }
        entry.live = false;
        entry.next_free = self.head_free;
        self.head_free = Some(index);
        self.active_count -= 1;
        true
    }

    #[inline(always)]
    pub fn get(&self, index: usize) -> Option<&SharedConn> {
        self.entries.get(index).map(|e| &e.conn)
    }

    pub fn is_live(&self, index: usize) -> bool {
        self.entries.get(index).is_some_and(|e| e.live)
    }

    pub fn generation(&self, index: usize) -> Option<u64> {
        self.entries.get(index).map(|e| e.generation)
    }

    /// Indices of every slot currently handed out.
    pub fn live_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.live)
            .map(|(i, _)| i)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.active_count
    }

    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn is_full(&self) -> bool {
        self.head_free.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TriggerMode;
    use crate::conn::ConnSettings;
    use crate::router::RouteTable;
    use crate::store::MemoryStore;
    use crate::syscalls::Epoll;

    fn slab(capacity: usize) -> ConnectionSlab {
        let epoll = Arc::new(Epoll::new().unwrap());
        let settings = Arc::new(ConnSettings {
            doc_root: std::env::temp_dir(),
            trigger: TriggerMode::Level,
            routes: RouteTable::default(),
        });
        let store = Arc::new(MemoryStore::new());
        ConnectionSlab::new(capacity, |i| {
            HttpConn::new(i, epoll.clone(), settings.clone(), store.clone())
        })
    }

    #[test]
    fn test_slab_operations() {
        let mut slab = slab(3);
        assert_eq!(slab.capacity(), 3);
        assert!(slab.is_empty());

        let (idx1, gen1) = slab.allocate().unwrap();
        assert_eq!(idx1, 0);
        assert_eq!(gen1, 1);
        let (idx2, _) = slab.allocate().unwrap();
        assert_eq!(idx2, 1);

        assert!(slab.free(idx1));
        assert!(!slab.free(idx1));
        assert_eq!(slab.len(), 1);

        // Index 0 is reused from the head of the free list, one generation on.
        let (idx3, gen3) = slab.allocate().unwrap();
        assert_eq!(idx3, 0);
        assert_eq!(gen3, 2);
        assert_eq!(slab.generation(0), Some(2));
    }

    #[test]
    fn test_exhaustion_and_live_indices() {
        let mut slab = slab(2);
        slab.allocate().unwrap();
        slab.allocate().unwrap();
        assert!(slab.is_full());
        assert!(slab.allocate().is_none());

        slab.free(0);
        assert_eq!(slab.live_indices().collect::<Vec<_>>(), vec![1]);
        assert!(slab.is_live(1) && !slab.is_live(0) && !slab.is_live(9));
        assert!(!slab.free(9));

        let conn = slab.get(1).unwrap();
        assert_eq!(crate::conn::lock_conn(conn).slot(), 1);
    }

    #[test]
    fn test_empty_slab() {
        let mut slab = slab(0);
        assert!(slab.allocate().is_none());
        assert!(slab.is_full());
    }
}
