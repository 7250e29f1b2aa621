//! Server-Sent Events support: a buffering parser and the legacy HTTP+SSE transport.
//!
//! SSE lines can span multiple TCP packets, so bytes are buffered until a
//! complete line is available. Buffering raw bytes (not decoded text) keeps
//! multi-byte UTF-8 characters intact when a chunk boundary splits them.
//!
//! The legacy transport opens a GET event stream. The server's first
//! `endpoint` event names the URL that client messages are POSTed to; every
//! response then arrives as a `message` event on the stream.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::Transport;
use crate::error::TransportError;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// The event type (from "event:" line)
    pub event: Option<String>,
    /// The event data (from "data:" lines)
    pub data: String,
    /// The event ID (from "id:" line)
    pub id: Option<String>,
    /// Retry value (from "retry:" line)
    pub retry: Option<u64>,
}

impl SseEvent {
    /// Whether the event carries a JSON-RPC message.
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

/// SSE parser that handles line buffering across TCP packets.
#[derive(Default)]
pub struct SseParser {
    /// Bytes of the current incomplete line
    buffer: Vec<u8>,
    current_event: Option<String>,
    current_data: Vec<String>,
    current_id: Option<String>,
    current_retry: Option<u64>,
}

impl SseParser {
    /// Create a new SSE parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the parser and return any complete events.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(newline_pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            let line = String::from_utf8_lossy(&line_bytes[..newline_pos]);
            let line = line.trim_end_matches('\r');

            // Empty line signals end of event
            if line.is_empty() {
                if let Some(event) = self.finalize_event() {
                    events.push(event);
                }
                continue;
            }

            if let Some((field, value)) = Self::parse_field(line) {
                match field {
                    "event" => self.current_event = Some(value.to_string()),
                    "data" => self.current_data.push(value.to_string()),
                    "id" => self.current_id = Some(value.to_string()),
                    "retry" => {
                        if let Ok(ms) = value.parse() {
                            self.current_retry = Some(ms);
                        }
                    }
                    _ => {}
                }
            }
        }

        events
    }

    /// Feed a complete body and flush a trailing event that lacks the final blank line.
    pub fn feed_final(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        let mut events = self.feed(bytes);
        if !self.buffer.is_empty() {
            events.extend(self.feed(b"\n"));
        }
        events.extend(self.finalize_event());
        events
    }

    /// Parse a single SSE field line.
    fn parse_field(line: &str) -> Option<(&str, &str)> {
        // Lines starting with : are comments
        if line.starts_with(':') {
            return None;
        }

        match line.split_once(':') {
            Some((field, value)) => Some((field, value.strip_prefix(' ').unwrap_or(value))),
            None => Some((line, "")),
        }
    }

    /// Finalize the current event and reset state.
    fn finalize_event(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            self.current_event = None;
            self.current_id = None;
            self.current_retry = None;
            return None;
        }

        let event = SseEvent {
            event: self.current_event.take(),
            data: self.current_data.join("\n"),
            id: self.current_id.take(),
            retry: self.current_retry.take(),
        };

        self.current_data.clear();
        Some(event)
    }
}

impl fmt::Debug for SseParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseParser")
            .field("buffer_len", &self.buffer.len())
            .field("current_data_lines", &self.current_data.len())
            .finish()
    }
}

/// Aborts the reader task unless disarmed, so a cancelled connect never leaks it.
struct AbortOnDrop {
    handle: AbortHandle,
    armed: bool,
}

impl AbortOnDrop {
    fn new(handle: AbortHandle) -> Self {
        Self { handle, armed: true }
    }

    fn disarm(mut self) -> AbortHandle {
        self.armed = false;
        self.handle.clone()
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.handle.abort();
        }
    }
}

/// Legacy HTTP+SSE transport.
pub struct SseTransport {
    client: Client,
    /// URL announced by the server's `endpoint` event.
    endpoint: Url,
    headers: HeaderMap,
    /// Messages forwarded by the reader task.
    inbox: mpsc::Receiver<String>,
    reader: AbortHandle,
    connected: bool,
}

impl SseTransport {
    /// Open the event stream and wait for the server to announce its endpoint.
    pub async fn connect(
        client: Client,
        url: &str,
        headers: HeaderMap,
        endpoint_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let base = Url::parse(url).map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;

        debug!(url = %base, "Opening SSE stream");

        let response = client
            .get(base.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let (inbox_tx, inbox) = mpsc::channel(64);
        let task = tokio::spawn(read_events(response, endpoint_tx, inbox_tx));
        let guard = AbortOnDrop::new(task.abort_handle());

        let path = match tokio::time::timeout(endpoint_timeout, endpoint_rx).await {
            Ok(Ok(path)) => path,
            Ok(Err(_)) => return Err(TransportError::ConnectionClosed),
            Err(_) => {
                return Err(TransportError::InvalidEndpoint(
                    "no endpoint event received".to_string(),
                ))
            }
        };
        let endpoint = base
            .join(&path)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", path, e)))?;

        debug!(endpoint = %endpoint, "SSE endpoint announced");

        Ok(Self {
            client,
            endpoint,
            headers,
            inbox,
            reader: guard.disarm(),
            connected: true,
        })
    }

    /// Handle to the background stream reader, for owners that tear it down explicitly.
    pub fn reader_handle(&self) -> AbortHandle {
        self.reader.clone()
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

async fn read_events(
    response: reqwest::Response,
    endpoint_tx: oneshot::Sender<String>,
    inbox: mpsc::Sender<String>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut parser = SseParser::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(error = %e, "SSE stream failed");
                break;
            }
        };

        for event in parser.feed(&chunk) {
            if event.event.as_deref() == Some("endpoint") {
                if let Some(tx) = endpoint_tx.take() {
                    let _ = tx.send(event.data);
                }
            } else if event.is_message() {
                if inbox.send(event.data).await.is_err() {
                    return;
                }
            } else {
                debug!(event = ?event.event, "Ignoring SSE event");
            }
        }
    }

    debug!("SSE stream ended");
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(message.to_string())
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                self.connected = false;
                Err(TransportError::SessionExpired)
            }
            status if status.is_success() => Ok(()),
            status => Err(TransportError::HttpStatus {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn receive(&mut self) -> Result<String, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        match self.inbox.recv().await {
            Some(message) => Ok(message),
            None => {
                self.connected = false;
                Err(TransportError::ConnectionClosed)
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Ok(());
        }

        debug!(endpoint = %self.endpoint, "Closing SSE transport");
        self.connected = false;
        self.inbox.close();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
