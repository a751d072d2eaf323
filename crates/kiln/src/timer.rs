// src/timer.rs
//
// Expiry-ordered doubly linked list of idle timers. Nodes live in an arena
// indexed by connection slot, so a slot has at most one timer and the links
// are plain indices.
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Node {
    expire: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Idle timers, head to tail in non-decreasing expiry order.
#[derive(Debug, Default)]
pub struct TimerList {
    nodes: Vec<Option<Node>>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preallocate arena entries for `slots` connection slots.
    pub fn with_capacity(slots: usize) -> Self {
        Self {
            nodes: vec![None; slots],
            ..Self::default()
        }
    }

    #[inline(always)]
    fn node(&self, slot: usize) -> Option<&Node> {
        self.nodes.get(slot).and_then(Option::as_ref)
    }

    #[inline(always)]
    fn node_mut(&mut self, slot: usize) -> Option<&mut Node> {
        self.nodes.get_mut(slot).and_then(Option::as_mut)
    }

    /// Expiry of a linked slot. `None` means a link points at an empty
    /// arena entry, which breaks the list invariant.
    fn expire_of(&self, slot: usize) -> Option<Instant> {
        let expire = self.node(slot).map(|n| n.expire);
        debug_assert!(expire.is_some(), "timer list links to empty slot {}", slot);
        expire
    }

    pub fn contains(&self, slot: usize) -> bool {
        self.node(slot).is_some()
    }

    pub fn expiry(&self, slot: usize) -> Option<Instant> {
        self.node(slot).map(|n| n.expire)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Arm a timer for `slot`. An existing timer for the slot is replaced.
    pub fn add_timer(&mut self, slot: usize, expire: Instant) {
        if self.contains(slot) {
            self.del_timer(slot);
        }
        if self.nodes.len() <= slot {
            self.nodes.resize(slot + 1, None);
        }
        self.nodes[slot] = Some(Node {
            expire,
            prev: None,
            next: None,
        });
        self.len += 1;

        match self.head {
            Some(head) if self.expire_of(head).is_some_and(|h| expire >= h) => {
                self.insert_from(slot, head)
            }
            _ => self.push_front(slot),
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(slot) {
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(h) => {
                if let Some(node) = self.node_mut(h) {
                    node.prev = Some(slot);
                }
            }
            None => self.tail = Some(slot),
        }
        self.head = Some(slot);
    }

    /// Link an unlinked `slot` somewhere after `anchor`, which must already
    /// precede it. Equal expiries keep arrival order.
    fn insert_from(&mut self, slot: usize, anchor: usize) {
        let Some(expire) = self.expire_of(slot) else {
            return;
        };
        let mut prev = anchor;
        let mut cursor = self.node(anchor).and_then(|n| n.next);

        while let Some(cur) = cursor {
            if self.expire_of(cur).is_some_and(|c| expire < c) {
                self.link_between(slot, Some(prev), Some(cur));
                return;
            }
            prev = cur;
            cursor = self.node(cur).and_then(|n| n.next);
        }
        self.link_between(slot, Some(prev), None);
    }

    fn link_between(&mut self, slot: usize, prev: Option<usize>, next: Option<usize>) {
        if let Some(node) = self.node_mut(slot) {
            node.prev = prev;
            node.next = next;
        }
        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = Some(slot);
                }
            }
            None => self.head = Some(slot),
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = Some(slot);
                }
            }
            None => self.tail = Some(slot),
        }
    }

    /// Detach `slot` from its neighbours, keeping the arena entry.
    fn unlink(&mut self, slot: usize) -> Option<Node> {
        let node = *self.node(slot)?;
        match node.prev {
            Some(p) => {
                if let Some(prev) = self.node_mut(p) {
                    prev.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => {
                if let Some(next) = self.node_mut(n) {
                    next.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        Some(node)
    }

    /// Move a timer's expiry to `expire`. The node is relinked only when the
    /// new expiry would break order with a neighbour. Returns `false` if the
    /// slot has no timer.
    pub fn adjust_timer(&mut self, slot: usize, expire: Instant) -> bool {
        let Some(node) = self.node_mut(slot) else {
            return false;
        };
        node.expire = expire;
        let Node { prev, next, .. } = *node;

        if prev.and_then(|p| self.expire_of(p)).is_some_and(|p| expire < p) {
            // Pulled earlier than its predecessor: rescan from the head.
            self.unlink(slot);
            match self.head {
                Some(head) if self.expire_of(head).is_some_and(|h| expire >= h) => {
                    self.insert_from(slot, head)
                }
                _ => self.push_front(slot),
            }
            return true;
        }

        match next {
            Some(n) if self.expire_of(n).is_some_and(|after| expire >= after) => {
                self.unlink(slot);
                self.insert_from(slot, n);
            }
            _ => {}
        }
        true
    }

    /// Remove the timer for `slot`. No-op when there is none.
    pub fn del_timer(&mut self, slot: usize) -> Option<Instant> {
        let node = self.unlink(slot)?;
        self.nodes[slot] = None;
        self.len -= 1;
        Some(node.expire)
    }

    /// Remove every timer with `expire <= now`, head first, passing each slot
    /// to `evict`. Returns how many fired.
    pub fn tick<F>(&mut self, now: Instant, mut evict: F) -> usize
    where
        F: FnMut(usize),
    {
        let mut fired = 0;
        while let Some(head) = self.head {
            if self.expire_of(head).is_some_and(|e| e > now) {
                break;
            }
            self.del_timer(head);
            evict(head);
            fired += 1;
        }
        fired
    }

    /// `(slot, expiry)` pairs from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Instant)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let slot = cursor?;
            let node = self.node(slot)?;
            cursor = node.next;
            Some((slot, node.expire))
        })
    }

    pub fn head(&self) -> Option<usize> {
        self.head
    }

    pub fn tail(&self) -> Option<usize> {
        self.tail
    }
}
