//! Streamable HTTP transport.
//!
//! Every client message is POSTed to the plugin endpoint. The server answers
//! either with a plain JSON body or with a short-lived SSE stream carrying
//! one or more JSON-RPC messages; both are queued and handed out by
//! `receive`. The server may assign a session through the `Mcp-Session-Id`
//! header, which is echoed on every later request and released with a DELETE
//! when the session is torn down.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use tracing::{debug, warn};

use super::{SseParser, Transport};
use crate::error::TransportError;

/// Header carrying the server-assigned session id.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Streamable HTTP transport.
pub struct StreamableHttpTransport {
    client: Client,
    url: Url,
    headers: HeaderMap,
    /// Shared with the [`SessionTerminator`] so teardown sees the latest id.
    session_id: Arc<Mutex<Option<String>>>,
    /// Messages received but not yet consumed.
    pending: VecDeque<String>,
    connected: bool,
}

impl StreamableHttpTransport {
    /// Create a transport for the given endpoint. No request is made until the first send.
    pub fn new(client: Client, url: &str, headers: HeaderMap) -> Result<Self, TransportError> {
        let url = Url::parse(url).map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        Ok(Self {
            client,
            url,
            headers,
            session_id: Arc::new(Mutex::new(None)),
            pending: VecDeque::new(),
            connected: true,
        })
    }

    /// Server-assigned session id, once known.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    /// Handle that ends the server-side session after the transport is closed.
    pub fn session_terminator(&self) -> SessionTerminator {
        SessionTerminator {
            client: self.client.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            session_id: Arc::clone(&self.session_id),
        }
    }

    fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        if let Some(id) = self.session_id.lock().as_deref() {
            if let Ok(value) = id.parse() {
                headers.insert(SESSION_ID_HEADER, value);
            }
        }
        headers
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        let response = self
            .client
            .post(self.url.clone())
            .headers(self.request_headers())
            .header(ACCEPT, "application/json, text/event-stream")
            .header(CONTENT_TYPE, "application/json")
            .body(message.to_string())
            .send()
            .await?;

        if let Some(id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut current = self.session_id.lock();
            if current.as_deref() != Some(id) {
                debug!(session_id = id, "Server assigned MCP session");
                *current = Some(id.to_string());
            }
        }

        let status = response.status();
        if status == StatusCode::NOT_FOUND && self.session_id.lock().is_some() {
            self.connected = false;
            return Err(TransportError::SessionExpired);
        }
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        if status == StatusCode::ACCEPTED {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.bytes().await?;
        self.pending.extend(split_response_body(&content_type, &body));

        Ok(())
    }

    async fn receive(&mut self) -> Result<String, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        // The server answered the request without a message; treat as a dropped exchange.
        self.pending.pop_front().ok_or(TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Ok(());
        }

        debug!(url = %self.url, "Closing streamable HTTP transport");
        self.connected = false;
        self.pending.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Ends a server-side session with `DELETE`, if the server assigned one.
#[derive(Clone)]
pub struct SessionTerminator {
    client: Client,
    url: Url,
    headers: HeaderMap,
    session_id: Arc<Mutex<Option<String>>>,
}

impl SessionTerminator {
    pub async fn terminate(self) -> Result<(), TransportError> {
        let Some(id) = self.session_id.lock().take() else {
            return Ok(());
        };

        let response = self
            .client
            .delete(self.url.clone())
            .headers(self.headers.clone())
            .header(SESSION_ID_HEADER, id.as_str())
            .send()
            .await?;

        // 405 means the server does not support explicit termination.
        let status = response.status();
        if !status.is_success() && status != StatusCode::METHOD_NOT_ALLOWED {
            warn!(status = status.as_u16(), session_id = %id, "Session termination rejected");
        }
        Ok(())
    }
}

/// Split a POST response body into individual JSON-RPC messages.
pub fn split_response_body(content_type: &str, body: &[u8]) -> Vec<String> {
    if content_type.starts_with("text/event-stream") {
        let mut parser = SseParser::new();
        return parser
            .feed_final(body)
            .into_iter()
            .filter(|event| event.is_message())
            .map(|event| event.data)
            .collect();
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => items.iter().map(Value::to_string).collect(),
        // Malformed bodies are passed through so the protocol layer reports them.
        _ => vec![text.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_json_body() {
        let messages = split_response_body(
            "application/json",
            br#"{"jsonrpc":"2.0","id":1,"result":{}}"#,
        );
        assert_eq!(messages, vec![r#"{"jsonrpc":"2.0","id":1,"result":{}}"#.to_string()]);
    }

    #[test]
    fn test_split_json_batch() {
        let messages = split_response_body(
            "application/json; charset=utf-8",
            br#"[{"jsonrpc":"2.0","id":1,"result":{}},{"jsonrpc":"2.0","id":2,"result":{}}]"#,
        );
        assert_eq!(messages.len(), 2);
        assert!(messages[1].contains("\"id\":2"));
    }

    #[test]
    fn test_split_event_stream_body() {
        let body = b"event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                     event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{}}\n\n";
        let messages = split_response_body("text/event-stream", body);
        assert_eq!(messages.len(), 2);
        assert!(messages[1].contains("\"id\":7"));
    }

    #[test]
    fn test_split_empty_body() {
        assert!(split_response_body("application/json", b"  ").is_empty());
    }

    #[test]
    fn test_invalid_url_rejected() {
        let result = StreamableHttpTransport::new(Client::new(), "not a url", HeaderMap::new());
        assert!(matches!(result, Err(TransportError::InvalidEndpoint(_))));
    }

    #[tokio::test]
    async fn test_closed_transport_refuses_send() {
        let mut transport =
            StreamableHttpTransport::new(Client::new(), "http://127.0.0.1:9/mcp", HeaderMap::new())
                .unwrap();
        assert!(transport.is_connected());
        assert!(transport.session_id().is_none());

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        assert!(matches!(transport.send("{}").await, Err(TransportError::NotConnected)));
        assert!(matches!(transport.receive().await, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_terminator_without_session_is_noop() {
        let transport =
            StreamableHttpTransport::new(Client::new(), "http://127.0.0.1:9/mcp", HeaderMap::new())
                .unwrap();
        transport.session_terminator().terminate().await.unwrap();
    }
}
