//! Ability activation on top of predicted gameplay effects.
//!
//! An [`AbilitySystem`] is one actor's view of its granted abilities on one
//! peer. The owning client activates `LocalPredicted` abilities immediately
//! under a fresh prediction key and asks the server to follow; the server
//! either confirms, and later echoes the key through the owner-only
//! [`ReplicatedKeyRing`], or refuses, which rolls back everything the client
//! predicted under that key.
//!
//! Outbound RPCs queue up in the system and are taken by whatever transport
//! carries them; inbound ones are fed to [`AbilitySystem::handle_client_message`]
//! on the server and [`AbilitySystem::handle_server_message`] on the client.

#![forbid(unsafe_code)]

pub mod activation;
pub mod definition;
pub mod error;
pub mod events;
pub mod key_ring;
pub mod replicated_events;
pub mod system;

pub use activation::{AbilitySpec, ActivationInfo, ActivationMode};
pub use definition::{AbilityDef, EndPolicy, NetExecutionPolicy, WaitForEvent};
pub use error::ActivationError;
pub use events::AbilityEvent;
pub use key_ring::ReplicatedKeyRing;
pub use replicated_events::{CachedEvent, ReplicatedEventCache};
pub use system::{AbilitySystem, Activation, NetRole};
