//! Protocol session over a single transport.
//!
//! `McpConnection` speaks JSON-RPC over any [`Transport`]: it performs the
//! initialize handshake, lists tools and calls them. Request/response pairs
//! are serialized behind the transport mutex, so one transport never carries
//! two interleaved requests.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::McpError;
use crate::protocol::{
    CallToolParams, CallToolResult, IncomingMessage, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, ListToolsParams, ListToolsResult, McpToolDefinition,
    RequestId, ServerCapabilities,
};
use crate::transport::Transport;

/// Upper bound on tools/list pages, guarding against cursors that never end.
const MAX_TOOL_PAGES: usize = 64;

/// The operations the session manager needs from a live plugin connection.
#[async_trait]
pub trait ToolSession: Send + Sync {
    /// Fetch the full tool list.
    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError>;

    /// Invoke a tool.
    async fn call_tool(&self, name: &str, arguments: Option<Value>)
        -> Result<CallToolResult, McpError>;
}

/// Connection state for an MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Connected but not initialized.
    Connected,
    /// Connection established and initialized.
    Ready,
    /// Connection is being closed.
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connected => write!(f, "connected"),
            Self::Ready => write!(f, "ready"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

/// A protocol session with one plugin server.
pub struct McpConnection {
    /// Plugin name, used in logs.
    name: String,
    transport: Mutex<Box<dyn Transport>>,
    state: RwLock<ConnectionState>,
    /// Server capabilities after initialization.
    server_capabilities: RwLock<Option<ServerCapabilities>>,
    request_counter: AtomicU64,
}

impl McpConnection {
    /// Create a new connection with an existing transport.
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            transport: Mutex::new(transport),
            state: RwLock::new(ConnectionState::Connected),
            server_capabilities: RwLock::new(None),
            request_counter: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn capabilities(&self) -> Option<ServerCapabilities> {
        self.server_capabilities.read().await.clone()
    }

    fn next_request_id(&self) -> u64 {
        self.request_counter.fetch_add(1, Ordering::SeqCst)
    }

    async fn ensure_state(&self, expected: ConnectionState) -> Result<(), McpError> {
        let state = *self.state.read().await;
        if state != expected {
            return Err(McpError::invalid_state(expected.to_string(), state.to_string()));
        }
        Ok(())
    }

    /// Send a request and wait for the response with the matching id.
    async fn request<P, R>(&self, method: &str, params: Option<P>) -> Result<R, McpError>
    where
        P: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let id = self.next_request_id();
        let expected = RequestId::from(id);
        let request = JsonRpcRequest::new(id, method, params);
        let request_json = serde_json::to_string(&request)?;

        let mut transport = self.transport.lock().await;
        transport.send(&request_json).await?;

        loop {
            let raw = transport.receive().await?;
            let message: IncomingMessage = serde_json::from_str(&raw)
                .map_err(|e| McpError::protocol(format!("Failed to parse message: {}", e)))?;

            if !message.is_response() {
                debug!(server = %self.name, method = ?message.method, "Skipping server message");
                continue;
            }
            if message.id.as_ref() != Some(&expected) {
                // Left over from a request abandoned by a timeout.
                debug!(server = %self.name, id = ?message.id, "Discarding stale response");
                continue;
            }

            if let Some(error) = message.error {
                return Err(McpError::server_error(error.code, error.message));
            }

            let result = message
                .result
                .ok_or_else(|| McpError::protocol("Response missing result"))?;
            return serde_json::from_value(result)
                .map_err(|e| McpError::protocol(format!("Unexpected {} result: {}", method, e)));
        }
    }

    /// Send a notification (no response expected).
    async fn notify<P>(&self, method: &str, params: Option<P>) -> Result<(), McpError>
    where
        P: serde::Serialize,
    {
        let notification = JsonRpcNotification::new(method, params);
        let notification_json = serde_json::to_string(&notification)?;

        let mut transport = self.transport.lock().await;
        transport.send(&notification_json).await?;

        Ok(())
    }

    /// Perform the initialize handshake.
    pub async fn initialize(&self) -> Result<(), McpError> {
        self.ensure_state(ConnectionState::Connected).await?;

        debug!(server = %self.name, "Initializing MCP connection");

        let result: InitializeResult = self
            .request("initialize", Some(InitializeParams::default()))
            .await?;

        *self.server_capabilities.write().await = Some(result.capabilities);

        self.notify::<()>("notifications/initialized", None).await?;

        *self.state.write().await = ConnectionState::Ready;

        info!(
            server = %self.name,
            server_name = %result.server_info.name,
            protocol_version = %result.protocol_version,
            "MCP connection initialized"
        );

        Ok(())
    }

    /// Close the connection.
    pub async fn close(&self) -> Result<(), McpError> {
        {
            let mut state = self.state.write().await;
            if matches!(*state, ConnectionState::Disconnected | ConnectionState::Closing) {
                return Ok(());
            }
            *state = ConnectionState::Closing;
        }

        debug!(server = %self.name, "Closing MCP connection");

        let result = self.transport.lock().await.close().await;
        *self.state.write().await = ConnectionState::Disconnected;
        result?;

        debug!(server = %self.name, "MCP connection closed");
        Ok(())
    }
}

#[async_trait]
impl ToolSession for McpConnection {
    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        self.ensure_state(ConnectionState::Ready).await?;

        let mut tools = Vec::new();
        let mut cursor = None;
        for _ in 0..MAX_TOOL_PAGES {
            let page: ListToolsResult = self
                .request("tools/list", Some(ListToolsParams { cursor }))
                .await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => {
                    debug!(server = %self.name, tool_count = tools.len(), "Listed tools");
                    return Ok(tools);
                }
            }
        }

        warn!(server = %self.name, "tools/list pagination did not terminate");
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_state(ConnectionState::Ready).await?;

        debug!(server = %self.name, tool = name, "Calling tool");

        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let result: CallToolResult = self.request("tools/call", Some(params)).await?;

        if result.is_error {
            warn!(server = %self.name, tool = name, "Tool returned error");
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use parking_lot::Mutex as SyncMutex;
    use serde_json::json;

    use super::*;
    use crate::error::TransportError;

    /// Replays canned server frames; records everything sent.
    struct ScriptedTransport {
        replies: VecDeque<String>,
        sent: Arc<SyncMutex<Vec<String>>>,
        connected: bool,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Value>) -> (Self, Arc<SyncMutex<Vec<String>>>) {
            let sent = Arc::new(SyncMutex::new(Vec::new()));
            let transport = Self {
                replies: replies.into_iter().map(|v| v.to_string()).collect(),
                sent: Arc::clone(&sent),
                connected: true,
            };
            (transport, sent)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&mut self, message: &str) -> Result<(), TransportError> {
            if !self.connected {
                return Err(TransportError::NotConnected);
            }
            self.sent.lock().push(message.to_string());
            Ok(())
        }

        async fn receive(&mut self) -> Result<String, TransportError> {
            self.replies.pop_front().ok_or(TransportError::ConnectionClosed)
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.connected = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    fn init_reply(id: u64) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": { "listChanged": true } },
                "serverInfo": { "name": "notes", "version": "1.0.0" }
            }
        })
    }

    #[tokio::test]
    async fn test_initialize_and_call() {
        let (transport, sent) = ScriptedTransport::new(vec![
            init_reply(1),
            json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}}),
            json!({"jsonrpc": "2.0", "id": 2, "result": {"content": [{"type": "text", "text": "ok"}]}}),
        ]);
        let connection = McpConnection::new("notes", Box::new(transport));

        connection.initialize().await.unwrap();
        assert_eq!(connection.state().await, ConnectionState::Ready);
        assert!(connection.capabilities().await.unwrap().tools.unwrap().list_changed);

        let result = connection.call_tool("list", Some(json!({}))).await.unwrap();
        assert_eq!(result.joined_text(), "ok");

        let sent = sent.lock();
        assert_eq!(sent.len(), 3);
        assert!(sent[1].contains("notifications/initialized"));
        assert!(sent[2].contains("tools/call"));
    }

    #[tokio::test]
    async fn test_stale_response_is_skipped() {
        let (transport, _) = ScriptedTransport::new(vec![
            json!({"jsonrpc": "2.0", "id": 99, "result": {}}),
            init_reply(1),
        ]);
        let connection = McpConnection::new("notes", Box::new(transport));
        connection.initialize().await.unwrap();
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor() {
        let (transport, sent) = ScriptedTransport::new(vec![
            init_reply(1),
            json!({"jsonrpc": "2.0", "id": 2, "result": {"tools": [{"name": "a"}], "nextCursor": "p2"}}),
            json!({"jsonrpc": "2.0", "id": 3, "result": {"tools": [{"name": "b"}]}}),
        ]);
        let connection = McpConnection::new("notes", Box::new(transport));
        connection.initialize().await.unwrap();

        let tools = connection.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(sent.lock()[3].contains("\"cursor\":\"p2\""));
    }

    #[tokio::test]
    async fn test_server_error_response() {
        let (transport, _) = ScriptedTransport::new(vec![
            init_reply(1),
            json!({"jsonrpc": "2.0", "id": 2, "error": {"code": -32602, "message": "unknown tool"}}),
        ]);
        let connection = McpConnection::new("notes", Box::new(transport));
        connection.initialize().await.unwrap();

        let err = connection.call_tool("nope", None).await.unwrap_err();
        assert!(matches!(err, McpError::ServerError { code: -32602, .. }));
    }

    #[tokio::test]
    async fn test_malformed_reply_is_protocol_error() {
        let (mut transport, _) = ScriptedTransport::new(vec![]);
        transport.replies.push_back("not json".to_string());
        let connection = McpConnection::new("notes", Box::new(transport));

        let err = connection.initialize().await.unwrap_err();
        assert!(err.is_protocol_format());
    }

    #[tokio::test]
    async fn test_calls_refused_before_initialize_and_after_close() {
        let (transport, _) = ScriptedTransport::new(vec![init_reply(1)]);
        let connection = McpConnection::new("notes", Box::new(transport));

        let err = connection.call_tool("list", None).await.unwrap_err();
        assert!(matches!(err, McpError::InvalidState { .. }));

        connection.initialize().await.unwrap();
        connection.close().await.unwrap();
        assert_eq!(connection.state().await, ConnectionState::Disconnected);

        let err = connection.list_tools().await.unwrap_err();
        assert!(err.is_reconnectable());

        // Closing twice is fine.
        connection.close().await.unwrap();
    }
}
