//! Shared protocol definitions for the Deskline wire format.
//!
//! Frames are JSON objects of the shape `{"event": <name>, "data": <payload>}`
//! carried over a persistent connection. [`event::Command`] covers what the
//! console sends, [`event::ServerEvent`] what the messaging backend pushes.

pub mod codec;
pub mod conversation;
pub mod event;
pub mod message;
