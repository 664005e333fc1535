//! Client side of an encrypted chat relay handshake.
//!
//! A [`ChatClient`] opens one connection per attempt, exchanges RSA-OAEP
//! public keys with the relay, sends the encrypted nickname and secret, and
//! yields an authenticated [`Session`] that encodes and decodes chat messages.
//!
//! 加密聊天中继握手的客户端实现。

pub mod config;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod transport;

pub use config::ClientConfig;
pub use error::{FailureReason, HandshakeError, Result};
pub use handshake::client::{ChatClient, ChatClientBuilder, Identity, InboundMessage, Session};
pub use protocol::state::HandshakeState;
