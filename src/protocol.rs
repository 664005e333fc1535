//! Wire-level protocol: relay tokens, handshake states and the chat codec.

pub mod codec;
pub mod message;
pub mod state;
