//! Notifications a container queues for its owner to drain.

use foresight_core::GameplayTag;
use serde::{Deserialize, Serialize};

use crate::active::EffectHandle;
use crate::attribute::Attribute;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CueKind {
    OnActive,
    WhileActive,
    Executed,
    Removed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CueEvent {
    pub tag: GameplayTag,
    pub kind: CueKind,
    pub handle: EffectHandle,
    pub predicted: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EffectEvent {
    Applied {
        handle: EffectHandle,
        effect: String,
        predicted: bool,
    },
    StackChanged {
        handle: EffectHandle,
        old: u32,
        new: u32,
    },
    Removed {
        handle: EffectHandle,
        effect: String,
        premature: bool,
        stack_count: u32,
    },
    Executed {
        handle: EffectHandle,
        effect: String,
        predicted: bool,
    },
    Inhibited {
        handle: EffectHandle,
    },
    Uninhibited {
        handle: EffectHandle,
    },
    AttributeChanged {
        attribute: Attribute,
        old: f64,
        new: f64,
    },
    Cue(CueEvent),
}

impl EffectEvent {
    pub fn cue(&self) -> Option<&CueEvent> {
        match self {
            EffectEvent::Cue(cue) => Some(cue),
            _ => None,
        }
    }
}
