//! Owner-only replicated prediction-key ring.
//!
//! Every key the server finishes processing for a client is written into the
//! next slot of a fixed-size ring. Changed slots ride along with the next
//! replication update for the owning connection only, and the client treats
//! each one as "the server has caught up to this key". Older slots are
//! overwritten when more keys arrive between two updates than the ring holds.

use foresight_core::{KeyId, PredictionKey, PredictionKeyDelegates, WireKey, WireTarget};
use tracing::{debug, trace};

#[derive(Clone, Debug)]
pub struct ReplicatedKeyRing {
    slots: Vec<PredictionKey>,
    next: usize,
    /// Slot indices written since the last drain, oldest write first.
    dirty: Vec<usize>,
}

impl ReplicatedKeyRing {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: vec![PredictionKey::invalid(); slots.max(1)],
            next: 0,
            dirty: Vec::new(),
        }
    }

    /// The most recently written key.
    pub fn latest(&self) -> Option<PredictionKey> {
        let last = (self.next + self.slots.len() - 1) % self.slots.len();
        let key = self.slots[last];
        key.is_valid_key().then_some(key)
    }

    pub fn replicate(&mut self, key: PredictionKey) {
        if !key.is_valid_key() {
            return;
        }
        // Nested windows over the same key close back to back.
        if self.latest() == Some(key) && !self.dirty.is_empty() {
            return;
        }

        let slot = self.next;
        self.slots[slot] = key;
        self.next = (self.next + 1) % self.slots.len();
        self.dirty.retain(|&i| i != slot);
        self.dirty.push(slot);
        trace!(%key, slot, "key written to replicated ring");
    }

    pub fn has_pending(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Changed slots as seen by `target`, oldest first.
    pub fn take_dirty(&mut self, target: WireTarget) -> Vec<WireKey> {
        std::mem::take(&mut self.dirty)
            .into_iter()
            .map(|slot| self.slots[slot].to_wire(target))
            .filter(WireKey::is_valid)
            .collect()
    }
}

/// Client side: fire catch-up for every received ring entry. Returns how many
/// entries were acted on.
///
/// Server-initiated keys come from the server's own counter and are skipped.
/// With `catch_up_older_keys`, every outstanding key issued before a received
/// one is caught up too, so a dropped ring entry cannot leave its key stuck.
pub fn catch_up_received(
    delegates: &PredictionKeyDelegates,
    keys: &[WireKey],
    catch_up_older_keys: bool,
) -> usize {
    let mut applied = 0;
    for key in keys.iter().filter(|k| k.is_valid() && !k.server_initiated) {
        let current: KeyId = key.current;
        if catch_up_older_keys {
            delegates.catch_up_through(current);
        } else {
            delegates.catch_up_to(current);
        }
        applied += 1;
    }
    if applied > 0 {
        debug!(applied, outstanding = delegates.outstanding(), "replicated keys caught up");
    }
    applied
}
