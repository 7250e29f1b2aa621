//! MCP transport implementations.
//!
//! Both HTTP-based transports present the same message-oriented interface:
//! `send` pushes one JSON-RPC frame to the server and `receive` yields the next
//! frame the server produced, whether it arrived in a POST response body
//! (streamable HTTP) or on a long-lived event stream (SSE).

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::TransportError;

pub mod http;
pub mod sse;

pub use http::StreamableHttpTransport;
pub use sse::{SseEvent, SseParser, SseTransport};

/// Trait for MCP transport implementations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to the server.
    async fn send(&mut self, message: &str) -> Result<(), TransportError>;

    /// Receive the next message from the server.
    async fn receive(&mut self) -> Result<String, TransportError>;

    /// Close the transport connection.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;
}

/// Convert configured plugin headers into a reqwest header map.
pub fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (key, value) in headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| TransportError::InvalidHeader(key.clone()))?;
        let value =
            HeaderValue::from_str(value).map_err(|_| TransportError::InvalidHeader(key.clone()))?;
        map.insert(name, value);
    }
    Ok(map)
}
