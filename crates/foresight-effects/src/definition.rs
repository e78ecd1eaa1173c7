//! Data-driven effect definitions.
//!
//! Definitions are plain serde data so both peers can load the same library
//! from YAML and look entries up by name when a replicated record arrives.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use foresight_core::{GameplayTag, TagRequirements};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregator::ModOp;
use crate::attribute::{Attribute, AttributeSet};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("unknown effect definition `{0}`")]
    Unknown(String),
    #[error("duplicate effect definition `{0}`")]
    Duplicate(String),
    #[error("effect `{effect}` lists unknown overflow effect `{overflow}`")]
    UnknownOverflow { effect: String, overflow: String },
    #[error("overflow effects of `{0}` lead back to itself")]
    OverflowCycle(String),
}

/// A value that scales linearly with level: `value + per_level * (level - 1)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalableFloat {
    pub value: f64,
    pub per_level: f64,
}

impl ScalableFloat {
    pub const fn fixed(value: f64) -> Self {
        Self {
            value,
            per_level: 0.0,
        }
    }

    pub fn at_level(&self, level: f64) -> f64 {
        self.value + self.per_level * (level - 1.0)
    }
}

impl From<f64> for ScalableFloat {
    fn from(value: f64) -> Self {
        Self::fixed(value)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationMagnitude {
    Fixed(ScalableFloat),
    /// `coefficient * (attribute + pre_add) + post_add`, read from the target
    /// when the effect is applied.
    AttributeBased {
        attribute: Attribute,
        #[serde(default = "default_coefficient")]
        coefficient: f64,
        #[serde(default)]
        pre_add: f64,
        #[serde(default)]
        post_add: f64,
    },
}

fn default_coefficient() -> f64 {
    1.0
}

impl DurationMagnitude {
    pub fn evaluate(&self, level: f64, target: &AttributeSet) -> f64 {
        match self {
            DurationMagnitude::Fixed(value) => value.at_level(level),
            DurationMagnitude::AttributeBased {
                attribute,
                coefficient,
                pre_add,
                post_add,
            } => coefficient * (target.current(attribute) + pre_add) + post_add,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationPolicy {
    #[default]
    Instant,
    HasDuration(DurationMagnitude),
    Infinite,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModifierInfo {
    pub attribute: Attribute,
    pub op: ModOp,
    pub magnitude: ScalableFloat,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackingType {
    /// One stack per instigator.
    AggregateBySource,
    /// One stack shared by every instigator.
    #[default]
    AggregateByTarget,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackDurationRefreshPolicy {
    #[default]
    RefreshOnSuccessfulApplication,
    NeverRefresh,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackPeriodResetPolicy {
    #[default]
    ResetOnSuccessfulApplication,
    NeverReset,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackExpirationPolicy {
    #[default]
    ClearEntireStack,
    RemoveSingleStackAndRefreshDuration,
    RefreshDuration,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackingPolicy {
    pub kind: StackingType,
    /// 0 means unlimited.
    pub limit: u32,
    pub duration_refresh: StackDurationRefreshPolicy,
    pub period_reset: StackPeriodResetPolicy,
    pub expiration: StackExpirationPolicy,
    /// Applied (unpredicted) whenever an application hits the limit.
    pub overflow_effects: Vec<String>,
    pub deny_overflow_application: bool,
    /// Only meaningful together with `deny_overflow_application`.
    pub clear_stack_on_overflow: bool,
}

/// Static description of an effect.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameplayEffectDef {
    pub name: String,
    pub duration: DurationPolicy,
    /// Seconds between periodic executions. Never predicted.
    pub period: Option<f64>,
    pub execute_periodic_on_application: bool,
    pub modifiers: Vec<ModifierInfo>,
    pub granted_tags: Vec<GameplayTag>,
    pub application_tag_requirements: TagRequirements,
    pub ongoing_tag_requirements: TagRequirements,
    pub cues: Vec<GameplayTag>,
    pub stacking: Option<StackingPolicy>,
}

impl GameplayEffectDef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn is_instant(&self) -> bool {
        matches!(self.duration, DurationPolicy::Instant)
    }

    pub fn is_periodic(&self) -> bool {
        self.period.is_some_and(|p| p > 0.0)
    }

    pub fn with_duration(mut self, duration: DurationPolicy) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_modifier(
        mut self,
        attribute: impl Into<Attribute>,
        op: ModOp,
        magnitude: impl Into<ScalableFloat>,
    ) -> Self {
        self.modifiers.push(ModifierInfo {
            attribute: attribute.into(),
            op,
            magnitude: magnitude.into(),
        });
        self
    }

    pub fn with_granted_tag(mut self, tag: impl Into<GameplayTag>) -> Self {
        self.granted_tags.push(tag.into());
        self
    }

    pub fn with_cue(mut self, tag: impl Into<GameplayTag>) -> Self {
        self.cues.push(tag.into());
        self
    }

    pub fn with_stacking(mut self, stacking: StackingPolicy) -> Self {
        self.stacking = Some(stacking);
        self
    }
}

/// Definitions by name, shared by every container in a process.
#[derive(Clone, Debug, Default)]
pub struct EffectLibrary {
    defs: BTreeMap<String, Arc<GameplayEffectDef>>,
}

impl EffectLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a library, checking names are unique and overflow references resolve.
    pub fn from_defs(
        defs: impl IntoIterator<Item = GameplayEffectDef>,
    ) -> Result<Self, DefinitionError> {
        let mut library = Self::new();
        for def in defs {
            library.insert(def)?;
        }
        library.validate()?;
        Ok(library)
    }

    pub fn insert(&mut self, def: GameplayEffectDef) -> Result<Arc<GameplayEffectDef>, DefinitionError> {
        if self.defs.contains_key(&def.name) {
            return Err(DefinitionError::Duplicate(def.name));
        }
        let def = Arc::new(def);
        self.defs.insert(def.name.clone(), Arc::clone(&def));
        Ok(def)
    }

    pub fn get(&self, name: &str) -> Result<Arc<GameplayEffectDef>, DefinitionError> {
        self.defs
            .get(name)
            .cloned()
            .ok_or_else(|| DefinitionError::Unknown(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.defs.keys().map(String::as_str)
    }

    fn validate(&self) -> Result<(), DefinitionError> {
        for def in self.defs.values() {
            let Some(stacking) = &def.stacking else {
                continue;
            };
            if let Some(missing) = stacking
                .overflow_effects
                .iter()
                .find(|name| !self.defs.contains_key(*name))
            {
                return Err(DefinitionError::UnknownOverflow {
                    effect: def.name.clone(),
                    overflow: missing.clone(),
                });
            }
        }

        let mut done = BTreeSet::new();
        for name in self.defs.keys() {
            let mut path = Vec::new();
            self.check_overflow_cycle(name, &mut path, &mut done)?;
        }
        Ok(())
    }

    /// Depth-first walk over overflow references; `path` holds the chain
    /// currently being expanded.
    fn check_overflow_cycle<'a>(
        &'a self,
        name: &'a str,
        path: &mut Vec<&'a str>,
        done: &mut BTreeSet<&'a str>,
    ) -> Result<(), DefinitionError> {
        if done.contains(name) {
            return Ok(());
        }
        if path.contains(&name) {
            return Err(DefinitionError::OverflowCycle(name.to_string()));
        }
        let Some(stacking) = self.defs.get(name).and_then(|d| d.stacking.as_ref()) else {
            done.insert(name);
            return Ok(());
        };

        path.push(name);
        for next in &stacking.overflow_effects {
            self.check_overflow_cycle(next, path, done)?;
        }
        path.pop();
        done.insert(name);
        Ok(())
    }
}
