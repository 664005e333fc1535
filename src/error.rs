//! Error types for the handshake client.
//! 握手客户端的错误类型。

use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::state::HandshakeState;

/// Why a connection attempt ended in `HandshakeState::Failed`.
///
/// This is the small, copyable summary stored in the state machine. The full
/// error (with context strings) is what the pending caller receives.
///
/// 连接尝试以 `HandshakeState::Failed` 结束的原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    ConnectionTimeout,
    TransportError,
    KeyGenerationError,
    KeyGenerationTimeout,
    KeyImportError,
    WrongCredentials,
    ServerFull,
    DecryptionError,
    EncryptionError,
    ProtocolViolation,
}

impl fmt::Display for FailureReason {
    /// The single human-readable line shown for a failed attempt.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureReason::ConnectionTimeout => "connection timed out before authentication",
            FailureReason::TransportError => "connection to the relay failed",
            FailureReason::KeyGenerationError => "could not generate the local key pair",
            FailureReason::KeyGenerationTimeout => "local key pair was not ready in time",
            FailureReason::KeyImportError => "relay sent an unreadable public key",
            FailureReason::WrongCredentials => "wrong password",
            FailureReason::ServerFull => "relay is full",
            FailureReason::DecryptionError => "message could not be decrypted",
            FailureReason::EncryptionError => "credentials could not be encrypted",
            FailureReason::ProtocolViolation => "relay sent an unexpected message",
        };
        f.write_str(text)
    }
}

/// Errors returned by the handshake client.
///
/// 握手客户端返回的错误。
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The relay did not reach authentication within the connect bound.
    ///
    /// 中继未能在连接时限内完成认证。
    #[error("relay did not authenticate the connection in time")]
    ConnectionTimeout,

    /// Connecting, reading or writing the relay connection failed.
    ///
    /// 连接、读取或写入中继连接失败。
    #[error("transport error: {0}")]
    Transport(String),

    /// The local RSA key pair could not be generated.
    ///
    /// 无法生成本地 RSA 密钥对。
    #[error("key pair generation failed: {0}")]
    KeyGeneration(String),

    /// The local key pair was not ready within the key-ready bound after the
    /// relay key arrived.
    ///
    /// 中继公钥到达后，本地密钥对未能在时限内就绪。
    #[error("local key pair was not ready before the relay key arrived")]
    KeyGenerationTimeout,

    /// A PEM public key could not be parsed.
    ///
    /// 无法解析 PEM 公钥。
    #[error("could not import public key: {0}")]
    KeyImport(String),

    /// The relay answered the secret with `AUTH_FAILED`.
    ///
    /// 中继以 `AUTH_FAILED` 拒绝了凭据。
    #[error("relay rejected the credentials")]
    WrongCredentials,

    /// The relay refused the connection because it has no free slot.
    ///
    /// 中继已满，拒绝了连接。
    #[error("relay is full")]
    ServerFull,

    /// Ciphertext was not valid base64 or did not decrypt under the local key.
    ///
    /// 密文不是有效的 base64，或无法用本地私钥解密。
    #[error("ciphertext could not be decrypted")]
    Decryption,

    /// A message could not be encrypted for the relay, usually because it is
    /// longer than the OAEP bound of the relay key.
    ///
    /// 无法为中继加密消息，通常是因为超出了中继公钥的 OAEP 长度上限。
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// The relay sent a token the current handshake state does not accept.
    /// `message` is a label and never carries a payload body.
    ///
    /// 中继发送了当前握手状态不接受的消息。`message` 只是标签，不包含消息正文。
    #[error("unexpected message `{message}` while in state {state:?}")]
    UnexpectedMessage {
        state: HandshakeState,
        message: String,
    },

    /// The relay closed the connection before authentication finished.
    ///
    /// 认证完成之前中继关闭了连接。
    #[error("transport closed before authentication")]
    ClosedBeforeAuthentication,

    /// `connect` was called while another attempt is still in flight.
    ///
    /// 已有连接尝试正在进行时再次调用了 `connect`。
    #[error("a connection attempt is already in progress ({0:?})")]
    AttemptInFlight(HandshakeState),

    /// An attempt tried to deliver its outcome a second time.
    ///
    /// 连接尝试试图第二次交付结果。
    #[error("connection attempt outcome was already resolved")]
    AlreadyResolved,

    /// The session has ended and accepts no more messages.
    ///
    /// 会话已结束，不再接受消息。
    #[error("session is closed")]
    SessionClosed,

    /// The attempt stopped without ever delivering an outcome.
    ///
    /// 连接尝试在未交付结果的情况下结束。
    #[error("connection attempt ended without an outcome")]
    Aborted,

    /// A required builder field was not set.
    ///
    /// 构建器缺少必需字段。
    #[error("builder is missing required field `{0}`")]
    BuilderMissingField(&'static str),

    /// The client configuration could not be loaded or is invalid.
    ///
    /// 客户端配置无法加载或无效。
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl HandshakeError {
    /// Maps the error onto the reason recorded in `HandshakeState::Failed`.
    ///
    /// Returns `None` for outcomes that are not attempt failures:
    /// `ClosedBeforeAuthentication` ends in `HandshakeState::Closed`, and
    /// guard or builder errors never start an attempt at all.
    pub fn reason(&self) -> Option<FailureReason> {
        let reason = match self {
            HandshakeError::ConnectionTimeout => FailureReason::ConnectionTimeout,
            HandshakeError::Transport(_) => FailureReason::TransportError,
            HandshakeError::KeyGeneration(_) => FailureReason::KeyGenerationError,
            HandshakeError::KeyGenerationTimeout => FailureReason::KeyGenerationTimeout,
            HandshakeError::KeyImport(_) => FailureReason::KeyImportError,
            HandshakeError::WrongCredentials => FailureReason::WrongCredentials,
            HandshakeError::ServerFull => FailureReason::ServerFull,
            HandshakeError::Decryption => FailureReason::DecryptionError,
            HandshakeError::Encryption(_) => FailureReason::EncryptionError,
            HandshakeError::UnexpectedMessage { .. } => FailureReason::ProtocolViolation,
            HandshakeError::ClosedBeforeAuthentication
            | HandshakeError::AttemptInFlight(_)
            | HandshakeError::AlreadyResolved
            | HandshakeError::SessionClosed
            | HandshakeError::Aborted
            | HandshakeError::BuilderMissingField(_)
            | HandshakeError::Config(_) => return None,
        };
        Some(reason)
    }
}

impl From<std::io::Error> for HandshakeError {
    fn from(err: std::io::Error) -> Self {
        HandshakeError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HandshakeError>;
