//! Opening plugin connections.
//!
//! A [`Connector`] turns a [`PluginConfig`] into a live, initialized
//! [`ToolSession`] plus the [`ResourceStack`] that tears it down again. The
//! production [`McpConnector`] opens the HTTP transport the plugin asks for and
//! performs the MCP handshake; tests substitute scripted connectors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use toolmesh_core::{PluginConfig, TransportKind};

use crate::connection::{McpConnection, ToolSession};
use crate::error::McpError;
use crate::resources::ResourceStack;
use crate::transport::{header_map, SseTransport, StreamableHttpTransport, Transport};

/// A freshly opened plugin session.
pub struct Established {
    pub handle: Arc<dyn ToolSession>,
    pub resources: ResourceStack,
}

/// Opens sessions to plugin servers.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open the transport and complete the handshake.
    ///
    /// Implementations must release every resource they acquired before
    /// returning an error.
    async fn connect(&self, config: &PluginConfig) -> Result<Established, McpError>;
}

/// Connector for real MCP servers over streamable HTTP or SSE.
pub struct McpConnector {
    client: reqwest::Client,
    connect_timeout: Duration,
}

impl McpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), connect_timeout)
    }

    /// Share an existing HTTP client (connection pool, proxy settings).
    pub fn with_client(client: reqwest::Client, connect_timeout: Duration) -> Self {
        Self {
            client,
            connect_timeout,
        }
    }

    async fn open(
        &self,
        config: &PluginConfig,
        resources: &mut ResourceStack,
    ) -> Result<Arc<McpConnection>, McpError> {
        let headers = header_map(&config.headers)?;

        let transport: Box<dyn Transport> = match config.transport {
            TransportKind::Sse => {
                let transport = SseTransport::connect(
                    self.client.clone(),
                    &config.url,
                    headers,
                    self.connect_timeout,
                )
                .await?;
                let reader = transport.reader_handle();
                resources.push("sse-stream", move || async move {
                    reader.abort();
                    Ok(())
                });
                Box::new(transport)
            }
            TransportKind::StreamableHttp | TransportKind::Http => {
                let transport =
                    StreamableHttpTransport::new(self.client.clone(), &config.url, headers)?;
                let terminator = transport.session_terminator();
                resources.push("http-session", move || async move {
                    terminator.terminate().await.map_err(McpError::from)
                });
                Box::new(transport)
            }
        };

        let connection = Arc::new(McpConnection::new(config.plugin_name.clone(), transport));
        let closing = Arc::clone(&connection);
        resources.push("mcp-session", move || async move { closing.close().await });

        connection.initialize().await?;
        Ok(connection)
    }
}

#[async_trait]
impl Connector for McpConnector {
    async fn connect(&self, config: &PluginConfig) -> Result<Established, McpError> {
        debug!(
            tenant = %config.tenant_id,
            plugin = %config.plugin_name,
            url = %config.url,
            transport = %config.transport,
            "Connecting to plugin"
        );

        let mut resources = ResourceStack::new();
        let opened =
            tokio::time::timeout(self.connect_timeout, self.open(config, &mut resources)).await;

        let error = match opened {
            Ok(Ok(connection)) => {
                info!(
                    tenant = %config.tenant_id,
                    plugin = %config.plugin_name,
                    "Plugin connected"
                );
                return Ok(Established {
                    handle: connection,
                    resources,
                });
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("timed out after {:?}", self.connect_timeout),
        };

        // Release whatever was acquired before the failure.
        let released = resources.close_all().await;
        warn!(
            tenant = %config.tenant_id,
            plugin = %config.plugin_name,
            released,
            error = %error,
            "Plugin connection failed"
        );
        Err(McpError::connection(&config.plugin_name, error))
    }
}
