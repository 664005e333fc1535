//! In-process transport.
//!
//! [`ChannelTransport::pair`] returns two connected ends. [`ChannelConnector`]
//! hands the relay-side end of every connection it opens to a receiver, so a
//! relay can be scripted in the same process.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{HandshakeError, Result};
use crate::transport::{Connector, Transport};

#[derive(Debug)]
pub struct ChannelTransport {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
    name: &'static str,
}

impl ChannelTransport {
    /// Two connected ends: `(client, relay)`.
    pub fn pair() -> (Self, Self) {
        let (client_tx, relay_rx) = mpsc::unbounded_channel();
        let (relay_tx, client_rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(client_tx),
                rx: client_rx,
                name: "channel:client",
            },
            Self {
                tx: Some(relay_tx),
                rx: relay_rx,
                name: "channel:relay",
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, text: &str) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(HandshakeError::SessionClosed)?;
        tx.send(text.to_owned())
            .map_err(|_| HandshakeError::Transport("peer end dropped".to_string()))
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        self.rx.close();
        Ok(())
    }

    fn peer(&self) -> String {
        self.name.to_string()
    }
}

/// Opens in-process connections and counts them.
#[derive(Debug, Clone)]
pub struct ChannelConnector {
    relay_ends: mpsc::UnboundedSender<ChannelTransport>,
    opened: Arc<AtomicUsize>,
}

impl ChannelConnector {
    /// Returns the connector and the stream of relay-side ends it produces.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelTransport>) {
        let (relay_ends, accepted) = mpsc::unbounded_channel();
        (
            Self {
                relay_ends,
                opened: Arc::new(AtomicUsize::new(0)),
            },
            accepted,
        )
    }

    /// Number of connections opened so far.
    pub fn connections_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    type Transport = ChannelTransport;

    async fn connect(&self) -> Result<ChannelTransport> {
        let (client, relay) = ChannelTransport::pair();
        self.relay_ends
            .send(relay)
            .map_err(|_| HandshakeError::Transport("connection refused".to_string()))?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(client)
    }
}
