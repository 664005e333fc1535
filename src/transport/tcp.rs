//! Newline-framed TCP transport.
//!
//! The relay speaks one message per line. The only multi-line message is the
//! relay's PEM block, which is reassembled into a single message here so the
//! state machine sees it whole.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{HandshakeError, Result};
use crate::protocol::message::{PEM_FOOTER, PEM_HEADER};
use crate::transport::{Connector, Transport};

pub struct TcpTransport {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: Option<BufWriter<OwnedWriteHalf>>,
    peer: String,
    /// Lines of a PEM block read so far. Kept across `receive` calls so a
    /// cancelled read does not lose them.
    pending_pem: Option<String>,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (read_half, write_half) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer: Some(BufWriter::new(write_half)),
            peer,
            pending_pem: None,
        }
    }

    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| HandshakeError::Transport(format!("failed to connect to {}: {}", addr, e)))?;
        Ok(Self::new(stream))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, text: &str) -> Result<()> {
        if text.contains('\n') && !is_pem_block(text) {
            return Err(HandshakeError::Transport(
                "outbound message contains a line break".to_string(),
            ));
        }
        let writer = self.writer.as_mut().ok_or(HandshakeError::SessionClosed)?;
        writer.write_all(text.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        // `Lines::next_line` is cancellation safe, and partial PEM state lives
        // on `self`, so this loop is too.
        while let Some(raw) = self.lines.next_line().await? {
            let line = raw.trim_end();

            if let Some(pem) = self.pending_pem.as_mut() {
                pem.push('\n');
                pem.push_str(line.trim());
                if line.trim() == PEM_FOOTER {
                    return Ok(self.pending_pem.take());
                }
                continue;
            }

            if line.is_empty() {
                continue;
            }
            if line == PEM_HEADER {
                self.pending_pem = Some(line.to_string());
                continue;
            }
            return Ok(Some(line.to_string()));
        }

        if self.pending_pem.take().is_some() {
            return Err(HandshakeError::Transport(
                "connection closed inside a PEM block".to_string(),
            ));
        }
        Ok(None)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            debug!(peer = %self.peer, "closing TCP transport");
            writer.flush().await?;
            writer.shutdown().await?;
        }
        Ok(())
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// A PEM block is the only message allowed to span lines.
fn is_pem_block(text: &str) -> bool {
    let text = text.trim();
    text.starts_with(PEM_HEADER) && text.ends_with(PEM_FOOTER)
}

/// Connects to `host:port` from the client configuration.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.relay_addr())
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Transport = TcpTransport;

    async fn connect(&self) -> Result<TcpTransport> {
        TcpTransport::connect(&self.addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let connector = TcpConnector::new(addr);
        let (client, accepted) = tokio::join!(connector.connect(), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn frames_lines_and_reassembles_pem() {
        let (mut client, mut relay) = pair().await;
        relay
            .write_all(
                b"PUBLIC_KEY_READY\r\n\nCLIENT_PUBLIC_KEY\n-----BEGIN PUBLIC KEY-----\nAAAA\nBBBB\n-----END PUBLIC KEY-----\nNICK\n",
            )
            .await
            .unwrap();
        drop(relay);

        assert_eq!(client.receive().await.unwrap().as_deref(), Some("PUBLIC_KEY_READY"));
        assert_eq!(client.receive().await.unwrap().as_deref(), Some("CLIENT_PUBLIC_KEY"));
        assert_eq!(
            client.receive().await.unwrap().as_deref(),
            Some("-----BEGIN PUBLIC KEY-----\nAAAA\nBBBB\n-----END PUBLIC KEY-----")
        );
        assert_eq!(client.receive().await.unwrap().as_deref(), Some("NICK"));
        assert_eq!(client.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn sends_newline_terminated_messages() {
        let (mut client, mut relay) = pair().await;
        client.send("c2lnbmVk").await.unwrap();
        client.close().await.unwrap();
        client.close().await.unwrap();

        let mut received = String::new();
        relay.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "c2lnbmVk\n");
    }

    #[tokio::test]
    async fn rejects_embedded_line_breaks() {
        let (mut client, _relay) = pair().await;
        assert!(matches!(
            client.send("two\nlines").await,
            Err(HandshakeError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn pem_blocks_survive_a_round_trip() {
        let (mut client, relay) = pair().await;
        let mut relay = TcpTransport::new(relay);
        let pem = "-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----";
        relay.send(pem).await.unwrap();
        relay.send("NICK").await.unwrap();
        assert_eq!(client.receive().await.unwrap().as_deref(), Some(pem));
        assert_eq!(client.receive().await.unwrap().as_deref(), Some("NICK"));
    }

    #[tokio::test]
    async fn truncated_pem_is_an_error() {
        let (mut client, mut relay) = pair().await;
        relay.write_all(b"-----BEGIN PUBLIC KEY-----\nAAAA\n").await.unwrap();
        drop(relay);
        assert!(client.receive().await.is_err());
    }
}
