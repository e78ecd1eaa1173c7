//! Per-attribute modifier aggregation.
//!
//! Every effect contributing to an attribute owns a set of mods keyed by its
//! handle, so a contribution can be added, updated or withdrawn without
//! touching anyone else's. Mods created by a locally predicted effect are
//! flagged so the client can evaluate with or without them.

use serde::{Deserialize, Serialize};

use crate::active::EffectHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModOp {
    Additive,
    Multiplicative,
    Division,
    Override,
}

impl ModOp {
    /// Permanently fold `magnitude` into a base value (instant and periodic
    /// execution).
    pub fn apply_to_base(self, base: f64, magnitude: f64) -> f64 {
        match self {
            ModOp::Additive => base + magnitude,
            ModOp::Multiplicative => base * magnitude,
            ModOp::Division if magnitude != 0.0 => base / magnitude,
            ModOp::Division => base,
            ModOp::Override => magnitude,
        }
    }

    /// Magnitude contributed by `stacks` stacks of the same modifier.
    pub fn stacked_magnitude(self, magnitude: f64, stacks: u32) -> f64 {
        let stacks = f64::from(stacks.max(1));
        match self {
            ModOp::Additive => magnitude * stacks,
            ModOp::Multiplicative | ModOp::Division => 1.0 + (magnitude - 1.0) * stacks,
            ModOp::Override => magnitude,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct AggregatorMod {
    source: EffectHandle,
    index: usize,
    op: ModOp,
    magnitude: f64,
    predicted: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Aggregator {
    base: f64,
    mods: Vec<AggregatorMod>,
    net_update_id: u64,
}

struct Channel {
    additive: f64,
    multiplicative: f64,
    division: f64,
    overridden: Option<f64>,
}

impl Aggregator {
    pub fn new(base: f64) -> Self {
        Self {
            base,
            ..Self::default()
        }
    }

    pub fn base(&self) -> f64 {
        self.base
    }

    pub fn set_base(&mut self, base: f64) {
        self.base = base;
    }

    /// Net update this aggregator was last reverse-evaluated in.
    pub fn net_update_id(&self) -> u64 {
        self.net_update_id
    }

    pub fn set_net_update_id(&mut self, id: u64) {
        self.net_update_id = id;
    }

    pub fn has_predicted_mods(&self) -> bool {
        self.mods.iter().any(|m| m.predicted)
    }

    /// Add or replace modifier `index` of `source`.
    pub fn set_mod(
        &mut self,
        source: EffectHandle,
        index: usize,
        op: ModOp,
        magnitude: f64,
        predicted: bool,
    ) {
        let updated = AggregatorMod {
            source,
            index,
            op,
            magnitude,
            predicted,
        };
        match self
            .mods
            .iter_mut()
            .find(|m| m.source == source && m.index == index)
        {
            Some(existing) => *existing = updated,
            None => self.mods.push(updated),
        }
    }

    /// Withdraw every contribution from `source`. Returns whether any existed.
    pub fn remove_mods(&mut self, source: EffectHandle) -> bool {
        let before = self.mods.len();
        self.mods.retain(|m| m.source != source);
        self.mods.len() != before
    }

    /// `((base + Σadd) * (1 + Σ(mul - 1))) / (1 + Σ(div - 1))`; the most
    /// recent override replaces the whole expression.
    pub fn evaluate(&self, include_predicted: bool) -> f64 {
        let channel = self.channel(include_predicted);
        if let Some(value) = channel.overridden {
            return value;
        }

        let value = (self.base + channel.additive) * channel.multiplicative;
        if channel.division == 0.0 {
            value
        } else {
            value / channel.division
        }
    }

    /// Base value that evaluates to `final_value` under the current mods.
    /// An override hides the base entirely, so `final_value` is returned.
    pub fn reverse_evaluate(&self, final_value: f64, include_predicted: bool) -> f64 {
        let channel = self.channel(include_predicted);
        if channel.overridden.is_some() || channel.multiplicative == 0.0 {
            return final_value;
        }

        let division = if channel.division == 0.0 {
            1.0
        } else {
            channel.division
        };
        (final_value * division) / channel.multiplicative - channel.additive
    }

    fn channel(&self, include_predicted: bool) -> Channel {
        let mut channel = Channel {
            additive: 0.0,
            multiplicative: 1.0,
            division: 1.0,
            overridden: None,
        };

        for m in self
            .mods
            .iter()
            .filter(|m| include_predicted || !m.predicted)
        {
            match m.op {
                ModOp::Additive => channel.additive += m.magnitude,
                ModOp::Multiplicative => channel.multiplicative += m.magnitude - 1.0,
                ModOp::Division => channel.division += m.magnitude - 1.0,
                ModOp::Override => channel.overridden = Some(m.magnitude),
            }
        }
        channel
    }
}
