//! RPC and replication messages.

use foresight_core::{KeyId, WireKey};
use foresight_effects::{EffectDelta, ReplicatedAttribute};
use serde::{Deserialize, Serialize};

use crate::ids::{AbilityId, EventPayload, ReplicatedEventKind};

/// Messages from the owning client to the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Ask the server to activate an ability. `key` is the client's
    /// prediction key, or invalid when the client is not predicting.
    ServerTryActivate { ability: AbilityId, key: WireKey },
    /// A generic event fired on the client for an active ability.
    /// `original_key` names the activation, `current_key` the window the
    /// client predicted the event's consequences under.
    ServerSetReplicatedEvent {
        event: ReplicatedEventKind,
        ability: AbilityId,
        original_key: WireKey,
        current_key: WireKey,
        payload: Option<EventPayload>,
    },
    /// The client ended an ability it activated.
    ServerEndAbility {
        ability: AbilityId,
        activation_key: WireKey,
        key: WireKey,
    },
    /// The client cancelled an ability it activated.
    ServerCancelAbility {
        ability: AbilityId,
        activation_key: WireKey,
    },
}

impl ClientMessage {
    pub fn ability(&self) -> AbilityId {
        match self {
            ClientMessage::ServerTryActivate { ability, .. }
            | ClientMessage::ServerSetReplicatedEvent { ability, .. }
            | ClientMessage::ServerEndAbility { ability, .. }
            | ClientMessage::ServerCancelAbility { ability, .. } => *ability,
        }
    }
}

/// Messages from the server to the owning client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// The server activated the ability. `key` is the activation key: the
    /// client's own key echoed back, or a server-initiated one.
    ClientActivateSucceeded { ability: AbilityId, key: WireKey },
    /// The server refused the activation the client predicted under `key`.
    ClientActivateFailed { ability: AbilityId, key: KeyId },
    /// The server ended an ability activated under `activation_key`.
    ClientEndAbility {
        ability: AbilityId,
        activation_key: WireKey,
    },
    /// The server cancelled an ability activated under `activation_key`.
    ClientCancelAbility {
        ability: AbilityId,
        activation_key: WireKey,
    },
    /// One network update worth of replicated state.
    Replication(ReplicationUpdate),
}

/// State the server replicates to the owning connection in one batch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationUpdate {
    pub tick: u64,
    pub server_time: f64,
    pub effects: EffectDelta,
    pub attributes: Vec<ReplicatedAttribute>,
    /// Owner-only prediction-key ring entries that changed since the last
    /// update, oldest first.
    pub prediction_keys: Vec<WireKey>,
}

impl ReplicationUpdate {
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty() && self.attributes.is_empty() && self.prediction_keys.is_empty()
    }
}
