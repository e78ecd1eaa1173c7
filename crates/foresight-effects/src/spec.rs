//! Effect specs: a definition plus the per-application instance data.

use std::sync::Arc;

use foresight_core::{GameplayTag, TagCountContainer};
use serde::{Deserialize, Serialize};

use crate::attribute::AttributeSet;
use crate::definition::{DurationPolicy, GameplayEffectDef};

/// Identity of whoever applied an effect; drives per-source stacking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstigatorId(pub u64);

#[derive(Clone, Debug)]
pub struct EffectSpec {
    pub def: Arc<GameplayEffectDef>,
    pub level: f64,
    pub stack_count: u32,
    /// Seconds. `None` is infinite; computed on application.
    pub duration: Option<f64>,
    pub period: Option<f64>,
    /// One evaluated magnitude per definition modifier, unstacked.
    pub modifier_magnitudes: Vec<f64>,
    pub instigator: Option<InstigatorId>,
    /// Tags of whoever applied the effect. Self-applied effects capture the
    /// target's tags here unless the caller supplied some.
    pub captured_source_tags: Vec<GameplayTag>,
    /// Explicit tags of the target at the moment of application.
    pub captured_target_tags: Vec<GameplayTag>,
}

impl EffectSpec {
    pub fn new(def: Arc<GameplayEffectDef>, level: f64) -> Self {
        let period = def.period.filter(|p| *p > 0.0);
        let mut spec = Self {
            def,
            level,
            stack_count: 1,
            duration: None,
            period,
            modifier_magnitudes: Vec::new(),
            instigator: None,
            captured_source_tags: Vec::new(),
            captured_target_tags: Vec::new(),
        };
        spec.calculate_modifier_magnitudes();
        spec
    }

    pub fn with_instigator(mut self, instigator: InstigatorId) -> Self {
        self.instigator = Some(instigator);
        self
    }

    pub fn with_source_tags(mut self, tags: impl IntoIterator<Item = GameplayTag>) -> Self {
        self.captured_source_tags = tags.into_iter().collect();
        self
    }

    /// Snapshot `target`'s explicit tags before anything this spec grants.
    pub fn capture_tags(&mut self, target: &TagCountContainer) {
        self.captured_target_tags = target.explicit_tags().cloned().collect();
        if self.instigator.is_none() && self.captured_source_tags.is_empty() {
            self.captured_source_tags = self.captured_target_tags.clone();
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn set_level(&mut self, level: f64) {
        self.level = level;
        self.calculate_modifier_magnitudes();
    }

    pub fn calculate_modifier_magnitudes(&mut self) {
        self.modifier_magnitudes = self
            .def
            .modifiers
            .iter()
            .map(|m| m.magnitude.at_level(self.level))
            .collect();
    }

    /// Raw duration from the definition, read against the target's
    /// attributes. Instant definitions report zero.
    pub fn raw_duration(&self, target: &AttributeSet) -> Option<f64> {
        match &self.def.duration {
            DurationPolicy::Instant => Some(0.0),
            DurationPolicy::HasDuration(magnitude) => Some(magnitude.evaluate(self.level, target)),
            DurationPolicy::Infinite => None,
        }
    }

    /// Magnitude of modifier `index` after stacking.
    pub fn stacked_magnitude(&self, index: usize) -> Option<f64> {
        let modifier = self.def.modifiers.get(index)?;
        let magnitude = *self.modifier_magnitudes.get(index)?;
        Some(modifier.op.stacked_magnitude(magnitude, self.stack_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ModOp;
    use crate::definition::ScalableFloat;

    #[test]
    fn magnitudes_follow_level_and_stacks() {
        let def = Arc::new(GameplayEffectDef::named("burn").with_modifier(
            "health",
            ModOp::Additive,
            ScalableFloat {
                value: -2.0,
                per_level: -1.0,
            },
        ));
        let mut spec = EffectSpec::new(def, 1.0);
        assert_eq!(spec.stacked_magnitude(0), Some(-2.0));

        spec.set_level(3.0);
        spec.stack_count = 2;
        assert_eq!(spec.stacked_magnitude(0), Some(-8.0));
        assert_eq!(spec.stacked_magnitude(1), None);
    }
}
