//! Murmur client library.
//!
//! [`client::ChatClient`] speaks the wire protocol and owns reconnection;
//! [`controller::ChatController`] keeps the view state a chat UI renders.

pub mod client;
pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
