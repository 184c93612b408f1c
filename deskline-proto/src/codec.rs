//! Serialization and deserialization for the Deskline wire protocol.
//!
//! Frames are UTF-8 JSON text. Decoding enforces [`MAX_FRAME_SIZE`] before
//! parsing so an oversized frame is rejected without allocating its tree.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::event::{Command, ServerEvent};

/// Maximum accepted frame size in bytes (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Frame is oversized or otherwise unusable.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

fn encode<T: Serialize>(value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(frame: &str) -> Result<T, CodecError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(CodecError::InvalidFrame(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            frame.len()
        )));
    }
    serde_json::from_str(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes a [`Command`] into a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the command cannot be serialized.
pub fn encode_command(command: &Command) -> Result<String, CodecError> {
    encode(command)
}

/// Decodes a [`Command`] from a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` for oversized frames, or
/// `CodecError::Serialization` if the frame is not a valid command.
pub fn decode_command(frame: &str) -> Result<Command, CodecError> {
    decode(frame)
}

/// Encodes a [`ServerEvent`] into a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode_event(event: &ServerEvent) -> Result<String, CodecError> {
    encode(event)
}

/// Decodes a [`ServerEvent`] from a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::InvalidFrame` for oversized frames, or
/// `CodecError::Serialization` if the frame is not a valid event.
pub fn decode_event(frame: &str) -> Result<ServerEvent, CodecError> {
    decode(frame)
}
