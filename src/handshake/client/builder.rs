//! Builder for `ChatClient`.
//! `ChatClient` 的构建器。

use super::ChatClient;
use crate::config::ClientConfig;
use crate::error::{HandshakeError, Result};
use crate::transport::Connector;

/// A builder for creating a `ChatClient`.
///
/// The connector is required; the configuration defaults to
/// [`ClientConfig::default`] and is validated on `build`.
///
/// 用于创建 `ChatClient` 的构建器。
pub struct ChatClientBuilder<C: Connector> {
    connector: Option<C>,
    config: Option<ClientConfig>,
}

impl<C: Connector> Default for ChatClientBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector> ChatClientBuilder<C> {
    pub fn new() -> Self {
        Self {
            connector: None,
            config: None,
        }
    }

    /// Sets how transports to the relay are opened.
    ///
    /// 设置打开到中继传输的方式。
    pub fn connector(mut self, connector: C) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Builds the `ChatClient`.
    ///
    /// Returns an error if the connector is missing or the configuration is
    /// invalid.
    ///
    /// 构建 `ChatClient`。如果缺少连接器或配置无效，则返回错误。
    pub fn build(self) -> Result<ChatClient<C>> {
        let connector = self
            .connector
            .ok_or(HandshakeError::BuilderMissingField("connector"))?;
        let config = self.config.unwrap_or_default();
        config.validate()?;
        Ok(ChatClient::from_parts(connector, config))
    }
}
