//! Cache of replicated generic events, keyed by (ability, activation key).
//!
//! An event can reach the server before the ability that waits for it has
//! registered (or after it stopped waiting). The cache remembers the event,
//! its payload and the key it was predicted under, and replays it to the next
//! waiter for the same activation.

use std::collections::HashMap;

use foresight_core::{KeyId, PredictionKey};
use foresight_protocol::{AbilityId, EventPayload, ReplicatedEventKind};
use tracing::trace;

#[derive(Clone, Copy, Debug, Default)]
struct EventSlot {
    triggered: bool,
    waiting: bool,
    payload: Option<EventPayload>,
}

#[derive(Clone, Debug, Default)]
struct CachedEvents {
    slots: [EventSlot; 4],
    /// Key the most recent event was predicted under.
    current_key: PredictionKey,
}

fn slot_index(kind: ReplicatedEventKind) -> usize {
    match kind {
        ReplicatedEventKind::GenericConfirm => 0,
        ReplicatedEventKind::GenericCancel => 1,
        ReplicatedEventKind::InputPressed => 2,
        ReplicatedEventKind::InputReleased => 3,
    }
}

/// A cached event handed to a waiter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CachedEvent {
    pub current_key: PredictionKey,
    pub payload: Option<EventPayload>,
}

#[derive(Debug, Default)]
pub struct ReplicatedEventCache {
    entries: HashMap<(AbilityId, KeyId), CachedEvents>,
}

impl ReplicatedEventCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record an event. Returns true if a waiter was registered for it, in
    /// which case the waiter is released and the event consumed.
    pub fn invoke(
        &mut self,
        kind: ReplicatedEventKind,
        ability: AbilityId,
        original_key: KeyId,
        current_key: PredictionKey,
        payload: Option<EventPayload>,
    ) -> bool {
        let entry = self.entries.entry((ability, original_key)).or_default();
        entry.current_key = current_key;
        let slot = &mut entry.slots[slot_index(kind)];
        if slot.waiting {
            *slot = EventSlot::default();
            trace!(%ability, original_key, %kind, "replicated event delivered to waiter");
            return true;
        }
        slot.triggered = true;
        slot.payload = payload;
        trace!(%ability, original_key, %kind, "replicated event cached");
        false
    }

    /// Hand back a cached event right away, or register a waiter for it.
    pub fn call_or_add_waiter(
        &mut self,
        kind: ReplicatedEventKind,
        ability: AbilityId,
        original_key: KeyId,
    ) -> Option<CachedEvent> {
        let entry = self.entries.entry((ability, original_key)).or_default();
        let current_key = entry.current_key;
        let slot = &mut entry.slots[slot_index(kind)];
        if slot.triggered {
            let payload = slot.payload;
            *slot = EventSlot::default();
            return Some(CachedEvent {
                current_key,
                payload,
            });
        }
        slot.waiting = true;
        None
    }

    pub fn is_waiting(&self, kind: ReplicatedEventKind, ability: AbilityId, original_key: KeyId) -> bool {
        self.entries
            .get(&(ability, original_key))
            .is_some_and(|entry| entry.slots[slot_index(kind)].waiting)
    }

    pub fn is_triggered(&self, kind: ReplicatedEventKind, ability: AbilityId, original_key: KeyId) -> bool {
        self.entries
            .get(&(ability, original_key))
            .is_some_and(|entry| entry.slots[slot_index(kind)].triggered)
    }

    /// Forget everything cached for one activation.
    pub fn consume_all(&mut self, ability: AbilityId, original_key: KeyId) {
        self.entries.remove(&(ability, original_key));
    }
}
