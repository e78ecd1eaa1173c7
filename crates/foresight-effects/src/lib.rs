//! Active gameplay effects and the reconciliation of predicted ones.
//!
//! An [`ActiveEffectsContainer`] owns the effects applied to one owner, the
//! owner's tag counts and its attributes. On the authority it is the source
//! of truth and produces per-connection [`EffectDelta`]s. On a client it holds
//! two kinds of records side by side: replicated ones and ones the client
//! predicted under a [`PredictionKey`](foresight_core::PredictionKey). The
//! latter are retired silently when their key catches up and rolled back when
//! it is rejected.

#![forbid(unsafe_code)]

pub mod active;
pub mod aggregator;
pub mod attribute;
pub mod container;
pub mod definition;
pub mod events;
pub mod spec;

pub use active::{ActiveEffect, EffectHandle, EffectOrigin, EffectState, ReplicationId};
pub use aggregator::{Aggregator, ModOp};
pub use attribute::{Attribute, AttributeSet, AttributeValue};
pub use container::{
    ActiveEffectsContainer, ApplyOutcome, EffectContext, EffectDelta, EffectHandleArena,
    ReplicatedAttribute, ReplicatedEffect, SkipReason,
};
pub use definition::{
    DefinitionError, DurationMagnitude, DurationPolicy, EffectLibrary, GameplayEffectDef,
    ModifierInfo, ScalableFloat, StackDurationRefreshPolicy, StackExpirationPolicy,
    StackPeriodResetPolicy, StackingPolicy, StackingType,
};
pub use events::{CueEvent, CueKind, EffectEvent};
pub use spec::{EffectSpec, InstigatorId};
