//! One connection attempt, from opening the transport to the end of its
//! session.
//!
//! 单次连接尝试：从打开传输到会话结束。

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

use super::Shared;
use super::identity::Identity;
use super::session::{Command, InboundMessage, Session};
use crate::config::ClientConfig;
use crate::crypto::keys::{LocalKeyPair, RemotePublicKey};
use crate::error::{HandshakeError, Result};
use crate::handshake::outcome::Resolver;
use crate::protocol::codec;
use crate::protocol::message::{SERVER_FULL, ServerMessage};
use crate::protocol::state::HandshakeState;
use crate::transport::{Connector, Transport};

/// Local key pair as it moves from "not requested" to "usable".
enum KeySlot {
    Absent,
    Pending(JoinHandle<Result<LocalKeyPair>>),
    Ready(LocalKeyPair),
}

/// Key material held once the relay accepts the credentials.
struct Established {
    local: LocalKeyPair,
    remote: Arc<RemotePublicKey>,
}

/// What woke the session loop.
enum Event<'a> {
    Inbound(Result<Option<String>>),
    Command(Option<Command>),
    /// Room in the inbound queue for the held message.
    Reserved(std::result::Result<mpsc::Permit<'a, InboundMessage>, SendError<()>>),
}

pub(super) struct Attempt<C: Connector> {
    id: u64,
    connector: Arc<C>,
    config: Arc<ClientConfig>,
    shared: Arc<Shared>,
    identity: Identity,
    resolver: Resolver<Session>,
    state: HandshakeState,
    keys: KeySlot,
    remote: Option<Arc<RemotePublicKey>>,
}

impl<C: Connector> Attempt<C> {
    pub(super) fn new(
        id: u64,
        connector: Arc<C>,
        config: Arc<ClientConfig>,
        shared: Arc<Shared>,
        identity: Identity,
        resolver: Resolver<Session>,
    ) -> Self {
        Self {
            id,
            connector,
            config,
            shared,
            identity,
            resolver,
            state: HandshakeState::Connecting,
            keys: KeySlot::Absent,
            remote: None,
        }
    }

    pub(super) async fn run(mut self) {
        let deadline = Instant::now() + self.config.connect_timeout();

        let connected = timeout_at(deadline, self.connector.connect()).await;
        let mut transport = match connected {
            Ok(Ok(transport)) => transport,
            Ok(Err(err)) => return self.fail(None, err).await,
            Err(_) => return self.fail(None, HandshakeError::ConnectionTimeout).await,
        };
        debug!(attempt = self.id, peer = %transport.peer(), "transport open");
        self.transition(HandshakeState::AwaitingServerReady);

        let negotiated = timeout_at(deadline, self.negotiate(&mut transport))
            .await
            .unwrap_or(Err(HandshakeError::ConnectionTimeout));

        match negotiated {
            Ok(established) => self.serve(transport, established).await,
            Err(err) => self.fail(Some(transport), err).await,
        }
    }

    fn transition(&mut self, next: HandshakeState) {
        debug!(attempt = self.id, from = ?self.state, to = ?next, "handshake state transition");
        self.state = next;
        if !self.shared.publish(self.id, next) {
            debug!(attempt = self.id, "attempt superseded, state not published");
        }
    }

    /// Processes relay tokens until `AUTH_SUCCESS` or an error.
    async fn negotiate(&mut self, transport: &mut C::Transport) -> Result<Established> {
        loop {
            let Some(text) = transport.receive().await? else {
                return Err(HandshakeError::ClosedBeforeAuthentication);
            };
            let message = ServerMessage::parse(&text);
            debug!(attempt = self.id, state = ?self.state, token = message.label(), "relay message");

            match message {
                ServerMessage::PublicKeyReady if self.state.accepts_server_ready() => {
                    self.start_key_generation();
                }
                ServerMessage::ClientPublicKeyRequest => {
                    // Acknowledgement only, valid in any position.
                    if self.state == HandshakeState::GeneratingKeys {
                        self.transition(HandshakeState::AwaitingRemoteKey);
                    }
                }
                ServerMessage::PublicKey(pem) if self.state.accepts_remote_key() => {
                    self.exchange_keys(transport, &pem).await?;
                }
                ServerMessage::PublicKey(_) if self.state.accepts_server_ready() => {
                    // Relay key before PUBLIC_KEY_READY: no key pair is coming.
                    return Err(HandshakeError::KeyGenerationTimeout);
                }
                ServerMessage::NickPrompt if self.state == HandshakeState::AwaitingNickPrompt => {
                    self.send_nick(transport).await?;
                }
                ServerMessage::PasswordPrompt
                    if self.state == HandshakeState::AwaitingPasswordPrompt =>
                {
                    self.send_password(transport).await?;
                }
                ServerMessage::AuthSuccess if self.state == HandshakeState::SendingPassword => {
                    return self.take_keys();
                }
                ServerMessage::AuthFailed => return Err(HandshakeError::WrongCredentials),
                ServerMessage::ServerFull => return Err(HandshakeError::ServerFull),
                other => {
                    return Err(HandshakeError::UnexpectedMessage {
                        state: self.state,
                        message: other.label().to_string(),
                    });
                }
            }
        }
    }

    fn start_key_generation(&mut self) {
        let bits = self.config.key_bits;
        info!(attempt = self.id, bits, "generating local key pair");
        self.keys = KeySlot::Pending(tokio::task::spawn_blocking(move || {
            LocalKeyPair::generate(bits)
        }));
        self.transition(HandshakeState::GeneratingKeys);
    }

    /// Waits, bounded, for key generation to finish.
    async fn local_keys(&mut self) -> Result<&LocalKeyPair> {
        if let KeySlot::Pending(handle) = &mut self.keys {
            let generated = match timeout(self.config.key_ready_timeout(), handle).await {
                Err(_) => return Err(HandshakeError::KeyGenerationTimeout),
                Ok(Err(join)) => return Err(HandshakeError::KeyGeneration(join.to_string())),
                Ok(Ok(result)) => result?,
            };
            info!(attempt = self.id, bits = generated.size_bits(), "local key pair ready");
            self.keys = KeySlot::Ready(generated);
        }
        match &self.keys {
            KeySlot::Ready(pair) => Ok(pair),
            _ => Err(HandshakeError::KeyGenerationTimeout),
        }
    }

    async fn exchange_keys(&mut self, transport: &mut C::Transport, pem: &str) -> Result<()> {
        let local_pem = self.local_keys().await?.export_public_pem()?;
        let remote = RemotePublicKey::from_pem(pem)?;
        info!(
            attempt = self.id,
            bits = remote.ciphertext_len() * 8,
            "relay public key imported"
        );
        self.remote = Some(Arc::new(remote));

        self.transition(HandshakeState::SendingLocalKey);
        transport.send(&STANDARD.encode(local_pem)).await?;
        self.transition(HandshakeState::AwaitingNickPrompt);
        Ok(())
    }

    fn remote(&self) -> Result<Arc<RemotePublicKey>> {
        self.remote
            .clone()
            .ok_or_else(|| HandshakeError::UnexpectedMessage {
                state: self.state,
                message: "credential prompt before relay key".to_string(),
            })
    }

    async fn send_nick(&mut self, transport: &mut C::Transport) -> Result<()> {
        let wire = codec::seal(self.identity.nickname(), &*self.remote()?)?;
        self.transition(HandshakeState::SendingNick);
        transport.send(&wire).await?;
        self.transition(HandshakeState::AwaitingPasswordPrompt);
        Ok(())
    }

    async fn send_password(&mut self, transport: &mut C::Transport) -> Result<()> {
        let wire = codec::seal(self.identity.secret(), &*self.remote()?)?;
        transport.send(&wire).await?;
        self.transition(HandshakeState::SendingPassword);
        Ok(())
    }

    fn take_keys(&mut self) -> Result<Established> {
        let remote = self.remote()?;
        match std::mem::replace(&mut self.keys, KeySlot::Absent) {
            KeySlot::Ready(local) => Ok(Established { local, remote }),
            _ => Err(HandshakeError::UnexpectedMessage {
                state: self.state,
                message: "authentication before key exchange".to_string(),
            }),
        }
    }

    /// Ends a pre-auth attempt: closes the transport, records the state and
    /// rejects the caller.
    async fn fail(mut self, transport: Option<C::Transport>, err: HandshakeError) {
        if let Some(mut transport) = transport {
            if let Err(close_err) = transport.close().await {
                debug!(attempt = self.id, error = %close_err, "error closing transport");
            }
        }

        let next = match err.reason() {
            Some(reason) => {
                warn!(attempt = self.id, state = ?self.state, error = %err, "connection attempt failed");
                HandshakeState::Failed(reason)
            }
            None => {
                info!(attempt = self.id, state = ?self.state, "relay closed the connection");
                HandshakeState::Closed
            }
        };
        self.transition(next);
        let _ = self.resolver.resolve(Err(err));
    }

    /// Hands the caller a session and relays traffic until it ends.
    async fn serve(mut self, mut transport: C::Transport, established: Established) {
        let Established { local, remote } = established;
        let depth = self.config.session_queue_depth;
        let (command_tx, mut commands) = mpsc::channel(depth);
        let (inbound, inbound_rx) = mpsc::channel(depth);

        self.shared.register_session(self.id, &command_tx);
        let session = Session::new(command_tx, inbound_rx, remote, transport.peer());

        self.transition(HandshakeState::Authenticated);
        info!(attempt = self.id, peer = %transport.peer(), "authenticated");
        let _ = self.resolver.resolve(Ok(session));

        let mut close_ack = None;
        // A decoded message waiting for room in the inbound queue. Transport
        // reads pause while it is held; commands are still served.
        let mut held: Option<InboundMessage> = None;
        let end = loop {
            let event = if held.is_some() {
                tokio::select! {
                    permit = inbound.reserve() => Event::Reserved(permit),
                    command = commands.recv() => Event::Command(command),
                }
            } else {
                tokio::select! {
                    received = transport.receive() => Event::Inbound(received),
                    command = commands.recv() => Event::Command(command),
                }
            };

            match event {
                Event::Reserved(Ok(permit)) => {
                    if let Some(message) = held.take() {
                        permit.send(message);
                    }
                }
                Event::Reserved(Err(_)) => {
                    debug!(attempt = self.id, "session handle dropped inbound message");
                    held = None;
                }
                Event::Inbound(Ok(Some(wire))) if wire == SERVER_FULL => {
                    info!(attempt = self.id, "relay is full, ending the session");
                    break HandshakeState::Closed;
                }
                Event::Inbound(Ok(Some(wire))) => {
                    held = Some(match codec::decode(&wire, &local) {
                        Ok(text) => InboundMessage::Text(text),
                        Err(err) => {
                            warn!(attempt = self.id, error = %err, bytes = wire.len(), "inbound message not decryptable");
                            InboundMessage::Undecryptable
                        }
                    });
                }
                Event::Inbound(Ok(None)) => {
                    info!(attempt = self.id, "relay closed the session");
                    break HandshakeState::Closed;
                }
                Event::Inbound(Err(err)) => {
                    warn!(attempt = self.id, error = %err, "session transport failed");
                    break failed_state(&err);
                }
                Event::Command(Some(Command::Send(wire))) => {
                    if let Err(err) = transport.send(&wire).await {
                        warn!(attempt = self.id, error = %err, "could not send chat message");
                        break failed_state(&err);
                    }
                }
                Event::Command(Some(Command::Close(ack))) => {
                    debug!(attempt = self.id, "session close requested");
                    close_ack = Some(ack);
                    break HandshakeState::Closed;
                }
                Event::Command(None) => {
                    debug!(attempt = self.id, "session handle dropped");
                    break HandshakeState::Closed;
                }
            }
        };

        if let Err(err) = transport.close().await {
            debug!(attempt = self.id, error = %err, "error closing transport");
        }
        self.transition(end);
        if let Some(ack) = close_ack {
            let _ = ack.send(());
        }
    }
}

fn failed_state(err: &HandshakeError) -> HandshakeState {
    err.reason()
        .map(HandshakeState::Failed)
        .unwrap_or(HandshakeState::Closed)
}
