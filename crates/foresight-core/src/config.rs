//! Tunables for prediction bookkeeping.

use serde::{Deserialize, Serialize};

/// Prediction and reconciliation settings shared by every peer in a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    /// Size of the owner-only ring of recently replicated prediction keys.
    pub replicated_key_slots: usize,

    /// When a replicated key arrives, also catch up every older outstanding key.
    pub catch_up_older_keys: bool,

    /// Outstanding keys in the delegate registry before a warning is logged.
    pub delegate_soft_limit: usize,

    /// Live effects in one container before a warning is logged.
    pub effect_soft_limit: usize,

    /// Replicated effects older than this (server time) skip their OnActive cue.
    pub max_rep_cue_delta_secs: f64,

    /// Durations modified down to zero or below are clamped to this.
    pub min_duration_secs: f64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            replicated_key_slots: 32,
            catch_up_older_keys: true,
            delegate_soft_limit: 1024,
            effect_soft_limit: 256,
            max_rep_cue_delta_secs: 3.0,
            min_duration_secs: 0.1,
        }
    }
}
