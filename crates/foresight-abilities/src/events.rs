use foresight_core::{GameplayTag, PredictionKey};
use foresight_protocol::{AbilityId, EventPayload, ReplicatedEventKind};

use crate::activation::ActivationMode;

/// Something that happened to an ability on this peer. Drained by the caller.
#[derive(Clone, Debug, PartialEq)]
pub enum AbilityEvent {
    Activated {
        ability: AbilityId,
        key: PredictionKey,
        mode: ActivationMode,
    },
    ActivationFailed {
        ability: AbilityId,
        reason: GameplayTag,
    },
    /// The server accepted a prediction.
    Confirmed {
        ability: AbilityId,
        key: PredictionKey,
    },
    /// The server refused a prediction; its effects have been rolled back.
    Rejected {
        ability: AbilityId,
        key: PredictionKey,
    },
    EventHandled {
        ability: AbilityId,
        event: ReplicatedEventKind,
        payload: Option<EventPayload>,
    },
    Ended {
        ability: AbilityId,
        cancelled: bool,
    },
}

impl AbilityEvent {
    pub fn ability(&self) -> AbilityId {
        match self {
            AbilityEvent::Activated { ability, .. }
            | AbilityEvent::ActivationFailed { ability, .. }
            | AbilityEvent::Confirmed { ability, .. }
            | AbilityEvent::Rejected { ability, .. }
            | AbilityEvent::EventHandled { ability, .. }
            | AbilityEvent::Ended { ability, .. } => *ability,
        }
    }
}
