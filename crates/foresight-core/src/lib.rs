//! Engine-agnostic client-side prediction primitives.
//!
//! A client that wants to act before the server has agreed allocates a
//! [`PredictionKey`], tags every speculative side effect with it, and sends the
//! key along with the request. The server echoes the key back (only to the
//! connection that produced it) once the authoritative state reflects the
//! action, or tells the client the action was rejected. The
//! [`PredictionKeyDelegates`] registry turns either outcome into exactly-once
//! callbacks that retire or undo the speculative state.

#![forbid(unsafe_code)]

pub mod arena;
pub mod config;
pub mod delegates;
pub mod domain;
pub mod key;
pub mod tags;
pub mod timer;
pub mod window;

pub use arena::{HandleArena, SlotHandle};
pub use config::PredictionConfig;
pub use delegates::{bind_weak, KeyCallback, KeyEvent, PredictionKeyDelegates};
pub use domain::PredictionDomain;
pub use key::{
    key_issued_before_or_at, ConnectionId, KeyAllocator, KeyId, PredictionKey, WireKey, WireTarget,
};
pub use tags::{GameplayTag, TagCountContainer, TagRequirements};
pub use timer::{NetTime, TimerHandle, TimerManager};
pub use window::{PredictionContext, PredictionScope, ScopedPredictionWindow};
