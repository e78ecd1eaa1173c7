use foresight_core::GameplayTag;
use foresight_effects::DefinitionError;
use foresight_protocol::AbilityId;
use thiserror::Error;

use crate::definition::NetExecutionPolicy;

/// Why an activation attempt failed.
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("{0} is not granted")]
    UnknownAbility(AbilityId),
    #[error("{ability} cannot activate on this peer under {policy:?}")]
    NetworkPolicy {
        ability: AbilityId,
        policy: NetExecutionPolicy,
    },
    #[error("{0} is already active")]
    AlreadyActive(AbilityId),
    #[error("{ability} is blocked by {tag}")]
    Blocked { ability: AbilityId, tag: GameplayTag },
    #[error("{ability} requires {tag}")]
    MissingTag { ability: AbilityId, tag: GameplayTag },
    #[error("{0} is on cooldown")]
    Cooldown(AbilityId),
    #[error("{0} cannot pay its cost")]
    Cost(AbilityId),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

impl ActivationError {
    /// Tag-shaped reason, suitable for surfacing to gameplay code.
    pub fn failure_tag(&self) -> GameplayTag {
        GameplayTag::new(match self {
            ActivationError::UnknownAbility(_) | ActivationError::Definition(_) => {
                "activate.fail.invalid"
            }
            ActivationError::NetworkPolicy { .. } => "activate.fail.networking",
            ActivationError::AlreadyActive(_) => "activate.fail.active",
            ActivationError::Blocked { .. } => "activate.fail.tags_blocked",
            ActivationError::MissingTag { .. } => "activate.fail.tags_missing",
            ActivationError::Cooldown(_) => "activate.fail.cooldown",
            ActivationError::Cost(_) => "activate.fail.cost",
        })
    }
}
