//! Generational handle slab.
//!
//! Distant code (UI, AI, scripts) keeps bare handles around long after the
//! thing they name may be gone. A handle embeds `(slot, generation)`; lookups
//! compare generations before touching the owner, and owners are held weakly,
//! so a stale handle or a dropped owner is an ordinary lookup miss.

use std::fmt;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotHandle {
    pub slot: u32,
    pub generation: u32,
}

impl SlotHandle {
    /// Never handed out: live generations start at 1.
    pub const INVALID: SlotHandle = SlotHandle {
        slot: 0,
        generation: 0,
    };

    pub fn is_valid(&self) -> bool {
        self.generation != 0
    }

    #[inline]
    pub const fn to_raw(self) -> u64 {
        ((self.slot as u64) << 32) | (self.generation as u64)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            slot: (raw >> 32) as u32,
            generation: raw as u32,
        }
    }
}

impl Default for SlotHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.slot, self.generation)
    }
}

struct Entry<T: ?Sized> {
    generation: u32,
    owner: Option<Weak<T>>,
}

pub struct HandleArena<T: ?Sized> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
}

impl<T: ?Sized> Default for HandleArena<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for HandleArena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleArena")
            .field("slots", &self.entries.len())
            .field("live", &self.live())
            .finish()
    }
}

impl<T: ?Sized> HandleArena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, owner: Weak<T>) -> SlotHandle {
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.entries[slot as usize];
            entry.generation = entry.generation.wrapping_add(1).max(1);
            entry.owner = Some(owner);
            return SlotHandle {
                slot,
                generation: entry.generation,
            };
        }

        let slot = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 1,
            owner: Some(owner),
        });
        SlotHandle {
            slot,
            generation: 1,
        }
    }

    /// Owner of a live handle, if the owner is still alive.
    pub fn owner(&self, handle: SlotHandle) -> Option<Rc<T>> {
        self.live_entry(handle)?.owner.as_ref()?.upgrade()
    }

    pub fn is_live(&self, handle: SlotHandle) -> bool {
        self.live_entry(handle).is_some()
    }

    /// Retire a handle. Returns false for stale or unknown handles.
    pub fn release(&mut self, handle: SlotHandle) -> bool {
        let Some(entry) = self.entries.get_mut(handle.slot as usize) else {
            return false;
        };
        if entry.generation != handle.generation || entry.owner.is_none() {
            return false;
        }
        entry.owner = None;
        self.free.push(handle.slot);
        true
    }

    pub fn live(&self) -> usize {
        self.entries.iter().filter(|e| e.owner.is_some()).count()
    }

    fn live_entry(&self, handle: SlotHandle) -> Option<&Entry<T>> {
        let entry = self.entries.get(handle.slot as usize)?;
        (entry.generation == handle.generation && entry.owner.is_some()).then_some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_misses_after_slot_reuse() {
        let owner = Rc::new(7u32);
        let mut arena = HandleArena::new();
        let first = arena.allocate(Rc::downgrade(&owner));
        assert_eq!(arena.owner(first).as_deref(), Some(&7));

        assert!(arena.release(first));
        assert!(!arena.release(first));

        let second = arena.allocate(Rc::downgrade(&owner));
        assert_eq!(second.slot, first.slot);
        assert_ne!(second.generation, first.generation);
        assert!(arena.owner(first).is_none());
        assert!(arena.owner(second).is_some());
    }

    #[test]
    fn dropped_owner_is_a_miss() {
        let mut arena = HandleArena::new();
        let handle = {
            let owner = Rc::new(String::from("gone"));
            arena.allocate(Rc::downgrade(&owner))
        };
        assert!(arena.is_live(handle));
        assert!(arena.owner(handle).is_none());
    }

    #[test]
    fn raw_roundtrip() {
        let handle = SlotHandle {
            slot: 12,
            generation: 3,
        };
        assert_eq!(SlotHandle::from_raw(handle.to_raw()), handle);
        assert!(!SlotHandle::INVALID.is_valid());
    }
}
