//! # toolmesh-mcp
//!
//! Multi-tenant MCP (Model Context Protocol) client session manager.
//!
//! This crate provides:
//! - Persistent sessions to remote MCP servers per (tenant, plugin)
//! - Streamable HTTP and SSE transports
//! - Reconnect-and-retry tool calls, batched calls
//! - Tool-list caching and function-calling schema conversion
//! - Error-rate health tracking, idle eviction and status events

pub mod batch;
pub mod catalog;
pub mod cleaner;
pub mod connection;
pub mod connector;
pub mod error;
pub mod events;
pub mod format;
pub mod health;
pub mod invoker;
pub mod manager;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod resources;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{BatchCallRequest, BatchCallResult};
pub use connection::{McpConnection, ToolSession};
pub use connector::{Connector, Established, McpConnector};
pub use error::{McpError, TransportError};
pub use events::{ChannelObserver, FnObserver, SessionStatus, StatusEvent, StatusObserver};
pub use format::{parse_combined_name, ContextFormat};
pub use invoker::ToolOutput;
pub use manager::McpSessionManager;
pub use protocol::{CallToolResult, McpToolDefinition, ToolContent};
pub use resources::ResourceStack;
pub use session::{Session, SessionInfo, SessionKey};
