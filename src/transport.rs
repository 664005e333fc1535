//! Transport seam between the handshake and the network.
//!
//! A [`Connector`] opens one [`Transport`] per connection attempt. A transport
//! moves discrete text messages in order over a single logical connection.

pub mod channel;
pub mod tcp;

pub use channel::{ChannelConnector, ChannelTransport};
pub use tcp::{TcpConnector, TcpTransport};

use async_trait::async_trait;

use crate::error::Result;

/// Bidirectional, ordered text-message channel.
///
/// `receive` doubles as the open/close/error notification contract:
/// `Ok(Some(_))` is a message, `Ok(None)` means the peer closed cleanly and
/// `Err(_)` is a transport failure.
///
/// Implementations must make `receive` cancellation safe: dropping the
/// future before it completes must not lose a message.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: &str) -> Result<()>;

    async fn receive(&mut self) -> Result<Option<String>>;

    /// Close the connection. Closing twice is not an error.
    async fn close(&mut self) -> Result<()>;

    /// Peer description for logs.
    fn peer(&self) -> String;
}

/// Opens transports to the relay.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport + 'static;

    async fn connect(&self) -> Result<Self::Transport>;
}
