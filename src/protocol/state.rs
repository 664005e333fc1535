//! Defines the states of the client handshake state machine.
//!
//! The relay drives the exchange: every transition is triggered by an inbound
//! token (see [`ServerMessage`](crate::protocol::message::ServerMessage)), except
//! for the start of an attempt and the terminal failures raised locally
//! (timeouts, transport errors).
//!
//! 定义客户端握手状态机的各个状态。

use crate::error::FailureReason;

/// Position of a single connection attempt in the handshake.
///
/// 单次连接尝试在握手过程中的位置。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// No attempt has been started.
    #[default]
    Idle,
    /// Transport is being opened.
    Connecting,
    /// Transport is open; waiting for `PUBLIC_KEY_READY`.
    AwaitingServerReady,
    /// Local key pair is being generated in the background.
    GeneratingKeys,
    /// Relay asked for the client key; its own key is expected first.
    AwaitingRemoteKey,
    /// Relay key imported; local public key is being sent.
    SendingLocalKey,
    AwaitingNickPrompt,
    SendingNick,
    AwaitingPasswordPrompt,
    /// Encrypted secret sent; waiting for the relay's verdict.
    SendingPassword,
    /// Terminal success. Inbound text is now chat payload.
    Authenticated,
    /// Terminal failure.
    Failed(FailureReason),
    /// Terminal: transport closed without an explicit failure.
    Closed,
}

impl HandshakeState {
    /// Whether the attempt owning this state is still negotiating.
    ///
    /// A new attempt may only start when this returns `false`.
    ///
    /// 拥有此状态的尝试是否仍在协商中。
    pub fn is_in_flight(&self) -> bool {
        !matches!(
            self,
            HandshakeState::Idle
                | HandshakeState::Authenticated
                | HandshakeState::Failed(_)
                | HandshakeState::Closed
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HandshakeState::Authenticated | HandshakeState::Failed(_) | HandshakeState::Closed
        )
    }

    /// A `PUBLIC_KEY_READY` token is only meaningful before key generation starts.
    pub(crate) fn accepts_server_ready(&self) -> bool {
        matches!(
            self,
            HandshakeState::Connecting | HandshakeState::AwaitingServerReady
        )
    }

    /// The relay's PEM block may arrive while keys are generating or after
    /// the `CLIENT_PUBLIC_KEY` acknowledgement.
    pub(crate) fn accepts_remote_key(&self) -> bool {
        matches!(
            self,
            HandshakeState::GeneratingKeys | HandshakeState::AwaitingRemoteKey
        )
    }
}
