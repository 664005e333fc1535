//! The authenticated session handed to the caller.
//! 交给调用方的已认证会话。

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::crypto::keys::RemotePublicKey;
use crate::error::{HandshakeError, Result};
use crate::protocol::codec;

/// Shown in place of an inbound message that could not be decrypted.
pub const UNDECRYPTABLE_PLACEHOLDER: &str = "⚠️ [Error descifrando mensaje]";

/// One inbound chat message, in arrival order.
///
/// 按到达顺序排列的一条入站聊天消息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Text(String),
    /// The relay sent something this session's key cannot decrypt. The
    /// session keeps running.
    Undecryptable,
}

impl InboundMessage {
    pub fn text(&self) -> Option<&str> {
        match self {
            InboundMessage::Text(text) => Some(text),
            InboundMessage::Undecryptable => None,
        }
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundMessage::Text(text) => f.write_str(text),
            InboundMessage::Undecryptable => f.write_str(UNDECRYPTABLE_PLACEHOLDER),
        }
    }
}

/// Requests from a `Session` handle to the task that owns the transport.
pub(crate) enum Command {
    /// An already encoded wire message.
    Send(String),
    /// Close the transport, then acknowledge.
    Close(oneshot::Sender<()>),
}

/// An authenticated connection to the relay.
///
/// Outbound text is encoded as `base64(ciphertext)|sha256|md5` with the
/// relay's key. Inbound messages are decrypted with the attempt's private key
/// by the task that owns the connection; the key itself never reaches this
/// handle.
///
/// 与中继之间已认证的连接。
pub struct Session {
    commands: mpsc::Sender<Command>,
    inbound: mpsc::Receiver<InboundMessage>,
    remote: Arc<RemotePublicKey>,
    peer: String,
}

impl Session {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        inbound: mpsc::Receiver<InboundMessage>,
        remote: Arc<RemotePublicKey>,
        peer: String,
    ) -> Self {
        Self {
            commands,
            inbound,
            remote,
            peer,
        }
    }

    /// Encodes `text` and queues it for the relay.
    ///
    /// Text longer than the key's OAEP bound fails with
    /// [`HandshakeError::Encryption`] and leaves the session open.
    pub async fn send(&self, text: &str) -> Result<()> {
        let envelope = codec::encode(text, &self.remote)?;
        debug!(peer = %self.peer, bytes = envelope.ciphertext.len(), "queueing chat message");
        self.commands
            .send(Command::Send(envelope.to_wire()))
            .await
            .map_err(|_| HandshakeError::SessionClosed)
    }

    /// Next inbound message, or `None` once the connection has ended.
    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.inbound.recv().await
    }

    /// Closes the connection and waits until the transport is shut.
    pub async fn close(self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Close(ack)).await.is_err() {
            return Ok(());
        }
        // A dropped ack means the connection ended on its own.
        let _ = done.await;
        Ok(())
    }

    /// The relay's public key imported during the handshake.
    pub fn remote_key(&self) -> &RemotePublicKey {
        &self.remote
    }

    /// Longest message, in UTF-8 bytes, that `send` accepts.
    pub fn max_message_len(&self) -> usize {
        self.remote.max_plaintext_len()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("closed", &self.commands.is_closed())
            .finish_non_exhaustive()
    }
}
