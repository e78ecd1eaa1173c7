//! Messages exchanged between a predicting client and the authority.
//!
//! RPCs travel as [`ClientMessage`] (client to server) and [`ServerMessage`]
//! (server to client). Replication of effects, attribute values and the
//! owner-only prediction-key ring rides on [`ServerMessage::Replication`].
//! [`wire`] encodes both directions as MessagePack.

pub mod ids;
pub mod message;
pub mod wire;

pub use ids::{AbilityId, EventPayload, ReplicatedEventKind};
pub use message::{ClientMessage, ReplicationUpdate, ServerMessage};
pub use wire::{
    client_message_json, deserialize_client_message, deserialize_server_message,
    serialize_client_message, serialize_server_message, server_message_json, WireError,
};
