//! `Deskline` sandbox backend library.
//!
//! An in-memory backend that speaks the console's live protocol and REST
//! routes. Integration tests start it in-process with
//! [`server::start_server`].

pub mod config;
pub mod server;
pub mod store;
