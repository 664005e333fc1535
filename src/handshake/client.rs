//! Implements the client side of the relay handshake.
//! 实现中继握手协议的客户端。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{HandshakeError, Result};
use crate::protocol::state::HandshakeState;
use crate::transport::{Connector, TcpConnector};

mod attempt;
mod builder;
mod identity;
mod session;

pub use builder::ChatClientBuilder;
pub use identity::Identity;
pub use session::{InboundMessage, Session, UNDECRYPTABLE_PLACEHOLDER};

use attempt::Attempt;
use session::Command;

/// State shared between a client handle and the attempts it starts.
pub(crate) struct Shared {
    /// Published status of the current attempt.
    status: watch::Sender<HandshakeState>,
    /// Id of the attempt allowed to publish. Only changed while the `status`
    /// lock is held.
    current: AtomicU64,
    /// Command channel of the last authenticated session. Weak so that
    /// dropping the `Session` still ends it.
    live_session: Mutex<Option<mpsc::WeakSender<Command>>>,
}

impl Shared {
    fn new() -> Self {
        let (status, _) = watch::channel(HandshakeState::Idle);
        Self {
            status,
            current: AtomicU64::new(0),
            live_session: Mutex::new(None),
        }
    }

    /// Publishes `state` if `attempt` is still the current one.
    pub(crate) fn publish(&self, attempt: u64, state: HandshakeState) -> bool {
        self.status.send_if_modified(|published| {
            if self.current.load(Ordering::SeqCst) != attempt {
                return false;
            }
            *published = state;
            true
        })
    }

    /// Remembers the session so a later attempt can supersede it.
    pub(crate) fn register_session(&self, attempt: u64, commands: &mpsc::Sender<Command>) {
        let mut slot = self
            .live_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.current.load(Ordering::SeqCst) == attempt {
            *slot = Some(commands.downgrade());
        }
    }

    fn take_session(&self) -> Option<mpsc::Sender<Command>> {
        self.live_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .and_then(|weak| weak.upgrade())
    }
}

/// Connects to a chat relay and authenticates.
///
/// At most one attempt is in flight per client (and its clones). Starting an
/// attempt while the previous one is still negotiating is refused with
/// [`HandshakeError::AttemptInFlight`] and opens no connection.
///
/// 连接到聊天中继并完成认证。每个客户端同一时间最多只有一个进行中的尝试。
pub struct ChatClient<C: Connector> {
    connector: Arc<C>,
    config: Arc<ClientConfig>,
    shared: Arc<Shared>,
}

impl<C: Connector> Clone for ChatClient<C> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            config: Arc::clone(&self.config),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> std::fmt::Debug for ChatClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ChatClient<C> {
    pub fn builder() -> ChatClientBuilder<C> {
        ChatClientBuilder::new()
    }

    pub(crate) fn from_parts(connector: C, config: ClientConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            config: Arc::new(config),
            shared: Arc::new(Shared::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// State of the most recent attempt.
    pub fn state(&self) -> HandshakeState {
        *self.shared.status.borrow()
    }

    /// Watches the state of the current attempt.
    ///
    /// Superseded attempts stop publishing once a newer one starts.
    pub fn subscribe(&self) -> watch::Receiver<HandshakeState> {
        self.shared.status.subscribe()
    }

    /// Runs one connection attempt to completion.
    ///
    /// Resolves with an authenticated [`Session`] on `AUTH_SUCCESS`, or with
    /// the error that ended the attempt. The whole attempt, including opening
    /// the transport, is bounded by the configured connect timeout.
    ///
    /// If a previous attempt is still authenticated, its session is asked to
    /// close before the new connection opens.
    ///
    /// 执行一次完整的连接尝试。
    pub async fn connect(&self, identity: Identity) -> Result<Session> {
        let mut refused = None;
        let mut attempt_id = 0;
        self.shared.status.send_if_modified(|state| {
            if state.is_in_flight() {
                refused = Some(*state);
                return false;
            }
            attempt_id = self.shared.current.fetch_add(1, Ordering::SeqCst) + 1;
            *state = HandshakeState::Connecting;
            true
        });
        if let Some(state) = refused {
            warn!(?state, "connection attempt refused, another is in progress");
            return Err(HandshakeError::AttemptInFlight(state));
        }

        // No await between the guard and the spawn: a caller that stops
        // waiting must still leave a running attempt behind.
        if let Some(previous) = self.shared.take_session() {
            debug!(attempt = attempt_id, "closing superseded session");
            supersede(previous);
        }

        info!(attempt = attempt_id, addr = %self.config.relay_addr(), "starting connection attempt");
        let (resolver, outcome) = super::outcome::channel();
        let attempt = Attempt::new(
            attempt_id,
            Arc::clone(&self.connector),
            Arc::clone(&self.config),
            Arc::clone(&self.shared),
            identity,
            resolver,
        );
        tokio::spawn(attempt.run());
        outcome.wait().await
    }
}

/// Asks a superseded session to close without waiting for it.
fn supersede(previous: mpsc::Sender<Command>) {
    let (ack, _) = oneshot::channel();
    match previous.try_send(Command::Close(ack)) {
        Ok(()) => {}
        Err(TrySendError::Closed(_)) => debug!("superseded session had already ended"),
        Err(TrySendError::Full(command)) => {
            tokio::spawn(async move {
                if previous.send(command).await.is_err() {
                    debug!("superseded session had already ended");
                }
            });
        }
    }
}

impl ChatClient<TcpConnector> {
    /// A client that reaches the relay over TCP at `config.relay_addr()`.
    pub fn tcp(config: ClientConfig) -> Result<Self> {
        ChatClientBuilder::new()
            .connector(TcpConnector::from_config(&config))
            .config(config)
            .build()
    }
}
