use rmp_serde::{decode, encode};
use thiserror::Error;

use crate::message::{ClientMessage, ServerMessage};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("encode error: {0}")]
    Encode(#[from] encode::Error),
    #[error("decode error: {0}")]
    Decode(#[from] decode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

// Messages are internally tagged, so they are encoded as maps.

pub fn serialize_client_message(msg: &ClientMessage) -> Result<Vec<u8>, WireError> {
    Ok(encode::to_vec_named(msg)?)
}

pub fn deserialize_client_message(bytes: &[u8]) -> Result<ClientMessage, WireError> {
    Ok(decode::from_slice(bytes)?)
}

pub fn serialize_server_message(msg: &ServerMessage) -> Result<Vec<u8>, WireError> {
    Ok(encode::to_vec_named(msg)?)
}

pub fn deserialize_server_message(bytes: &[u8]) -> Result<ServerMessage, WireError> {
    Ok(decode::from_slice(bytes)?)
}

/// JSON rendering for traces and reports.
pub fn client_message_json(msg: &ClientMessage) -> Result<serde_json::Value, WireError> {
    Ok(serde_json::to_value(msg)?)
}

pub fn server_message_json(msg: &ServerMessage) -> Result<serde_json::Value, WireError> {
    Ok(serde_json::to_value(msg)?)
}
