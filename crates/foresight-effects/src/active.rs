//! Records for effects currently applied to an owner.

use std::fmt;

use foresight_core::{PredictionKey, SlotHandle, TimerHandle};
use serde::{Deserialize, Serialize};

use crate::spec::EffectSpec;

/// Process-wide handle for one active effect record.
///
/// A predicted record and the authoritative record that later replaces it get
/// different handles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EffectHandle(SlotHandle);

impl EffectHandle {
    pub const INVALID: EffectHandle = EffectHandle(SlotHandle::INVALID);

    pub const fn from_slot(slot: SlotHandle) -> Self {
        Self(slot)
    }

    pub fn slot(&self) -> SlotHandle {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0.is_valid()
    }
}

impl fmt::Display for EffectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "effect#{}", self.0)
    }
}

/// Stable per-container id the authority assigns for delta replication.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicationId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectState {
    /// Queued while the container is scope locked.
    Pending,
    Inhibited,
    Active,
    /// Removed while scope locked; erased when the lock drops.
    PendingRemove,
    Removed,
}

impl EffectState {
    /// Pending, inhibited or active.
    pub fn is_alive(self) -> bool {
        matches!(
            self,
            EffectState::Pending | EffectState::Inhibited | EffectState::Active
        )
    }
}

/// How a record came to exist on this peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectOrigin {
    /// Applied by the authority itself.
    Authority,
    /// Speculatively applied by this client under a prediction key.
    LocalPredicted,
    /// Received from the authority.
    Replicated,
}

#[derive(Clone, Debug)]
pub struct ActiveEffect {
    pub handle: EffectHandle,
    pub replication_id: ReplicationId,
    pub replication_version: u32,
    pub prediction_key: PredictionKey,
    pub spec: EffectSpec,
    pub state: EffectState,
    pub is_inhibited: bool,
    pub origin: EffectOrigin,
    pub start_world_time: f64,
    pub start_server_time: f64,
    pub duration_timer: TimerHandle,
    pub period_timer: TimerHandle,
    /// Predicted instant effect held as an infinite record so it can be undone.
    pub predicted_instant: bool,
    /// A replicated copy of this predicted record took over its side effects.
    pub superseded: bool,
    /// Replicated record whose cues wait for the end of the network update.
    pub pending_rep_on_active: bool,
    pub pending_rep_while_active: bool,
    /// Replicated record whose modifiers did not match its definition.
    pub corrupt: bool,
}

impl ActiveEffect {
    pub fn name(&self) -> &str {
        self.spec.name()
    }

    pub fn stack_count(&self) -> u32 {
        self.spec.stack_count
    }

    pub fn is_predicted(&self) -> bool {
        self.origin == EffectOrigin::LocalPredicted
    }

    /// Alive and currently driving tags, modifiers and cues.
    pub fn drives_side_effects(&self) -> bool {
        self.state.is_alive() && !self.is_inhibited && !self.superseded && !self.corrupt
    }

    /// Remaining duration at `world_time`; `None` when infinite.
    pub fn time_remaining(&self, world_time: f64) -> Option<f64> {
        self.spec
            .duration
            .map(|d| (self.start_world_time + d - world_time).max(0.0))
    }

    /// Whether the record is going away before its duration ran out.
    pub fn is_premature_at(&self, server_time: f64) -> bool {
        self.spec
            .duration
            .map_or(true, |d| server_time + 1e-6 < self.start_server_time + d)
    }
}
