//! `Deskline`: realtime conversation sync for customer-consultation consoles.
//!
//! The [`engine::SyncEngine`] keeps a paginated conversation list and the
//! open conversation's history consistent with a backend over a
//! [`connection::Connection`], while sends, uploads and conversation
//! actions are applied optimistically and reconciled later.

pub mod api;
pub mod attachment;
pub mod config;
pub mod connection;
pub mod conversations;
pub mod engine;
pub mod input;
pub mod messages;
pub mod notify;
pub mod outbox;
pub mod paging;
pub mod selection;
pub mod transport;
