//! Murmur server library.
//!
//! Exposes the chat engine and the WebSocket gateway for use in tests and
//! embedding. The gateway authenticates each connection, registers the
//! user's session in the presence registry, and routes chat events between
//! sessions while persisting messages through a [`store::MessageStore`].

pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod presence;
pub mod session;
pub mod sqlite;
pub mod store;
