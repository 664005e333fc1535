//! Drives connection attempts through the relay handshake.

pub mod client;
pub(crate) mod outcome;
