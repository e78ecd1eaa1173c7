//! Data-driven ability definitions.

use foresight_core::GameplayTag;
use foresight_protocol::ReplicatedEventKind;
use serde::{Deserialize, Serialize};

/// Where an ability runs and who starts it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetExecutionPolicy {
    /// The owning client runs it at once and the server follows.
    #[default]
    LocalPredicted,
    /// Runs only where it was triggered; the server never hears of it.
    LocalOnly,
    /// The server runs it first and tells the client.
    ServerInitiated,
    /// Runs on the server only.
    ServerOnly,
}

impl NetExecutionPolicy {
    /// End and cancel are mirrored to the other peer.
    pub fn replicates_end(&self) -> bool {
        matches!(
            self,
            NetExecutionPolicy::LocalPredicted | NetExecutionPolicy::ServerInitiated
        )
    }
}

/// When an activation ends on its own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndPolicy {
    /// Right after activation.
    #[default]
    Immediately,
    /// Once the awaited replicated event has been handled.
    AfterEvent,
    /// Only through an explicit end or cancel.
    Manual,
}

/// A replicated event the ability waits for after activating, and what it
/// applies when the event arrives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WaitForEvent {
    pub event: ReplicatedEventKind,
    #[serde(default)]
    pub effects: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbilityDef {
    pub name: String,
    pub net_execution: NetExecutionPolicy,
    /// All must be present on the owner to activate.
    pub activation_required_tags: Vec<GameplayTag>,
    /// None may be present on the owner to activate.
    pub activation_blocked_tags: Vec<GameplayTag>,
    /// Granted to the owner while the ability is active.
    pub activation_owned_tags: Vec<GameplayTag>,
    pub cost_effect: Option<String>,
    /// Its granted tags mark the ability as cooling down.
    pub cooldown_effect: Option<String>,
    pub effects_on_activate: Vec<String>,
    pub wait_for_event: Option<WaitForEvent>,
    pub end_policy: EndPolicy,
}

impl AbilityDef {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_policy(mut self, policy: NetExecutionPolicy) -> Self {
        self.net_execution = policy;
        self
    }

    pub fn with_cost(mut self, effect: impl Into<String>) -> Self {
        self.cost_effect = Some(effect.into());
        self
    }

    pub fn with_cooldown(mut self, effect: impl Into<String>) -> Self {
        self.cooldown_effect = Some(effect.into());
        self
    }

    pub fn with_activation_effect(mut self, effect: impl Into<String>) -> Self {
        self.effects_on_activate.push(effect.into());
        self
    }

    pub fn with_required_tag(mut self, tag: impl Into<GameplayTag>) -> Self {
        self.activation_required_tags.push(tag.into());
        self
    }

    pub fn with_blocked_tag(mut self, tag: impl Into<GameplayTag>) -> Self {
        self.activation_blocked_tags.push(tag.into());
        self
    }

    pub fn with_owned_tag(mut self, tag: impl Into<GameplayTag>) -> Self {
        self.activation_owned_tags.push(tag.into());
        self
    }

    pub fn with_wait_for_event(
        mut self,
        event: ReplicatedEventKind,
        effects: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.wait_for_event = Some(WaitForEvent {
            event,
            effects: effects.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn with_end_policy(mut self, end_policy: EndPolicy) -> Self {
        self.end_policy = end_policy;
        self
    }

    /// Every effect name the definition refers to.
    pub fn referenced_effects(&self) -> impl Iterator<Item = &str> {
        self.cost_effect
            .iter()
            .chain(self.cooldown_effect.iter())
            .chain(self.effects_on_activate.iter())
            .chain(self.wait_for_event.iter().flat_map(|wait| wait.effects.iter()))
            .map(String::as_str)
    }
}
