use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a granted ability on one actor. Both peers grant abilities in
/// the same order, so ids agree without being replicated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AbilityId(pub u32);

impl fmt::Display for AbilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ability#{}", self.0)
    }
}

/// Generic signals an ability can wait on, multiplexed over one RPC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicatedEventKind {
    GenericConfirm,
    GenericCancel,
    InputPressed,
    InputReleased,
}

impl ReplicatedEventKind {
    pub const ALL: [ReplicatedEventKind; 4] = [
        ReplicatedEventKind::GenericConfirm,
        ReplicatedEventKind::GenericCancel,
        ReplicatedEventKind::InputPressed,
        ReplicatedEventKind::InputReleased,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicatedEventKind::GenericConfirm => "generic_confirm",
            ReplicatedEventKind::GenericCancel => "generic_cancel",
            ReplicatedEventKind::InputPressed => "input_pressed",
            ReplicatedEventKind::InputReleased => "input_released",
        }
    }
}

impl fmt::Display for ReplicatedEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional vector carried by a replicated event (an aim point, a target
/// location).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl EventPayload {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}
