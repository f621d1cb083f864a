//! Shared protocol definitions for the Murmur wire format.

pub mod codec;
pub mod event;
pub mod message;
