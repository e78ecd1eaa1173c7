//! Per-activation bookkeeping.

use std::sync::Arc;

use foresight_core::PredictionKey;
use foresight_protocol::AbilityId;
use serde::Serialize;

use crate::definition::AbilityDef;

/// How this peer came to be running an activation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationMode {
    /// Running on the authority.
    #[default]
    Authority,
    /// Running on a client because the server told it to.
    NonAuthority,
    /// Running on a client ahead of the server's verdict.
    Predicting,
    /// A client prediction the server accepted.
    Confirmed,
    /// A client prediction the server refused.
    Rejected,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ActivationInfo {
    mode: ActivationMode,
    key: PredictionKey,
}

impl ActivationInfo {
    pub fn new(is_authority: bool) -> Self {
        Self {
            mode: if is_authority {
                ActivationMode::Authority
            } else {
                ActivationMode::NonAuthority
            },
            key: PredictionKey::invalid(),
        }
    }

    pub fn mode(&self) -> ActivationMode {
        self.mode
    }

    /// The key the activation ran under; invalid for purely local ones.
    pub fn activation_key(&self) -> PredictionKey {
        self.key
    }

    pub fn set_predicting(&mut self, key: PredictionKey) {
        self.mode = ActivationMode::Predicting;
        self.key = key;
    }

    pub fn set_confirmed(&mut self) {
        self.mode = ActivationMode::Confirmed;
    }

    pub fn set_rejected(&mut self) {
        self.mode = ActivationMode::Rejected;
    }

    pub fn server_set_activation_key(&mut self, key: PredictionKey) {
        self.key = key;
    }
}

/// A granted ability and its runtime state.
#[derive(Clone, Debug)]
pub struct AbilitySpec {
    pub id: AbilityId,
    pub def: Arc<AbilityDef>,
    pub level: f64,
    pub active_count: u32,
    pub activation: ActivationInfo,
}

impl AbilitySpec {
    pub fn new(id: AbilityId, def: Arc<AbilityDef>, level: f64) -> Self {
        Self {
            id,
            def,
            level,
            active_count: 0,
            activation: ActivationInfo::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn is_active(&self) -> bool {
        self.active_count > 0
    }
}
