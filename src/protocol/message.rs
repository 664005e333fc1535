//! Plaintext control tokens sent by the relay.
//!
//! Every inbound text message is classified into exactly one
//! [`ServerMessage`] variant. Text that is not a known token falls into
//! [`ServerMessage::Payload`], which is only legal once authenticated.

pub const PUBLIC_KEY_READY: &str = "PUBLIC_KEY_READY";
pub const CLIENT_PUBLIC_KEY: &str = "CLIENT_PUBLIC_KEY";
pub const NICK: &str = "NICK";
pub const PASSWORD: &str = "PASSWORD";
pub const AUTH_SUCCESS: &str = "AUTH_SUCCESS";
pub const AUTH_FAILED: &str = "AUTH_FAILED";
pub const SERVER_FULL: &str = "SERVIDOR_LLENO";

pub const PEM_HEADER: &str = "-----BEGIN PUBLIC KEY-----";
pub const PEM_FOOTER: &str = "-----END PUBLIC KEY-----";

/// Defines the messages the relay sends during the handshake.
///
/// 定义中继在握手过程中发送的消息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Relay -> Client: start generating the local key pair.
    PublicKeyReady,
    /// Relay -> Client: the relay wants the client key (after sending its own).
    ClientPublicKeyRequest,
    /// Relay -> Client: the relay's public key as a PEM block.
    PublicKey(String),
    /// Relay -> Client: send the encrypted nickname.
    NickPrompt,
    /// Relay -> Client: send the encrypted secret.
    PasswordPrompt,
    AuthSuccess,
    AuthFailed,
    ServerFull,
    /// Anything else. Chat payload once authenticated, a protocol violation before.
    Payload(String),
}

impl ServerMessage {
    /// Classifies one inbound text message. Tokens are case-sensitive.
    pub fn parse(text: &str) -> Self {
        match text {
            PUBLIC_KEY_READY => ServerMessage::PublicKeyReady,
            CLIENT_PUBLIC_KEY => ServerMessage::ClientPublicKeyRequest,
            NICK => ServerMessage::NickPrompt,
            PASSWORD => ServerMessage::PasswordPrompt,
            AUTH_SUCCESS => ServerMessage::AuthSuccess,
            AUTH_FAILED => ServerMessage::AuthFailed,
            SERVER_FULL => ServerMessage::ServerFull,
            pem if pem.starts_with(PEM_HEADER) => ServerMessage::PublicKey(pem.to_owned()),
            other => ServerMessage::Payload(other.to_owned()),
        }
    }

    /// Short label for logs and errors. Never includes key or payload bodies.
    pub fn label(&self) -> &'static str {
        match self {
            ServerMessage::PublicKeyReady => PUBLIC_KEY_READY,
            ServerMessage::ClientPublicKeyRequest => CLIENT_PUBLIC_KEY,
            ServerMessage::PublicKey(_) => "PEM public key",
            ServerMessage::NickPrompt => NICK,
            ServerMessage::PasswordPrompt => PASSWORD,
            ServerMessage::AuthSuccess => AUTH_SUCCESS,
            ServerMessage::AuthFailed => AUTH_FAILED,
            ServerMessage::ServerFull => SERVER_FULL,
            ServerMessage::Payload(_) => "opaque payload",
        }
    }
}
