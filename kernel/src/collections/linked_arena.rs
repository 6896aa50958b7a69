//! An owned, ordered list backed by an arena of slots.
//!
//! Entries live in slab slots addressed by generation-tagged [`Handle`]s and
//! are threaded into a doubly-linked order through slot indices. Removing an
//! entry bumps its slot's generation, so a stale handle is rejected instead
//! of silently aliasing whatever reused the slot.

use alloc::vec::Vec;

/// Stable reference to an entry. Copyable; survives unrelated inserts and
/// removals, and goes stale (rejected, not dangling) once its entry is
/// removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    index: usize,
    generation: u32,
}

struct Entry<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Slot<T> {
    generation: u32,
    entry: Option<Entry<T>>,
}

pub struct LinkedArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> LinkedArena<T> {
    pub const fn new() -> Self {
        LinkedArena {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> Option<Handle> {
        self.head.map(|i| self.handle_for(i))
    }

    pub fn tail(&self) -> Option<Handle> {
        self.tail.map(|i| self.handle_for(i))
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        let slot = self.live_slot(handle)?;
        slot.entry.as_ref().map(|e| &e.value)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        if !self.is_live(handle) {
            return None;
        }
        self.slots[handle.index].entry.as_mut().map(|e| &mut e.value)
    }

    /// Entry preceding `handle` in list order.
    pub fn prev(&self, handle: Handle) -> Option<Handle> {
        let slot = self.live_slot(handle)?;
        slot.entry
            .as_ref()
            .and_then(|e| e.prev)
            .map(|i| self.handle_for(i))
    }

    /// Entry following `handle` in list order.
    pub fn next(&self, handle: Handle) -> Option<Handle> {
        let slot = self.live_slot(handle)?;
        slot.entry
            .as_ref()
            .and_then(|e| e.next)
            .map(|i| self.handle_for(i))
    }

    pub fn push_front(&mut self, value: T) -> Handle {
        let index = self.claim_slot(value, None, self.head);
        if let Some(old) = self.head {
            self.entry_mut(old).prev = Some(index);
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
        self.len += 1;
        self.handle_for(index)
    }

    pub fn push_back(&mut self, value: T) -> Handle {
        let index = self.claim_slot(value, self.tail, None);
        if let Some(old) = self.tail {
            self.entry_mut(old).next = Some(index);
        }
        self.tail = Some(index);
        if self.head.is_none() {
            self.head = Some(index);
        }
        self.len += 1;
        self.handle_for(index)
    }

    /// Splices `value` immediately after `after`. Returns `None` (list
    /// untouched) if `after` is stale.
    pub fn insert_after(&mut self, after: Handle, value: T) -> Option<Handle> {
        if !self.is_live(after) {
            return None;
        }
        let follower = self.entry_mut(after.index).next;
        let index = self.claim_slot(value, Some(after.index), follower);
        self.entry_mut(after.index).next = Some(index);
        match follower {
            Some(f) => self.entry_mut(f).prev = Some(index),
            None => self.tail = Some(index),
        }
        self.len += 1;
        Some(self.handle_for(index))
    }

    /// Unlinks and returns the entry, invalidating its handle. Stale handles
    /// return `None`.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        if !self.is_live(handle) {
            return None;
        }
        let entry = self.slots[handle.index].entry.take()?;
        match entry.prev {
            Some(p) => self.entry_mut(p).next = entry.next,
            None => self.head = entry.next,
        }
        match entry.next {
            Some(n) => self.entry_mut(n).prev = entry.prev,
            None => self.tail = entry.prev,
        }
        self.slots[handle.index].generation = self.slots[handle.index].generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(entry.value)
    }

    /// Iterates entries in list order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            arena: self,
            cursor: self.head,
        }
    }

    /// Handles of all entries in list order. Convenient when the list will
    /// be mutated while walking it.
    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(h, _)| h).collect()
    }

    fn handle_for(&self, index: usize) -> Handle {
        Handle {
            index,
            generation: self.slots[index].generation,
        }
    }

    fn is_live(&self, handle: Handle) -> bool {
        self.live_slot(handle).is_some()
    }

    fn live_slot(&self, handle: Handle) -> Option<&Slot<T>> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation == handle.generation && slot.entry.is_some() {
            Some(slot)
        } else {
            None
        }
    }

    fn entry_mut(&mut self, index: usize) -> &mut Entry<T> {
        self.slots[index]
            .entry
            .as_mut()
            .expect("linked arena slot unexpectedly empty")
    }

    fn claim_slot(&mut self, value: T, prev: Option<usize>, next: Option<usize>) -> usize {
        let entry = Entry { value, prev, next };
        match self.free.pop() {
            Some(index) => {
                self.slots[index].entry = Some(entry);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                self.slots.len() - 1
            }
        }
    }
}

impl<T> Default for LinkedArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a, T> {
    arena: &'a LinkedArena<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (Handle, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let entry = self.arena.slots[index]
            .entry
            .as_ref()
            .expect("linked arena list references an empty slot");
        self.cursor = entry.next;
        Some((self.arena.handle_for(index), &entry.value))
    }
}
