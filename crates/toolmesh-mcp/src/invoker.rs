//! Single tool calls with timeout and reconnect-on-disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use toolmesh_core::SessionSettings;
use tracing::{debug, warn};

use crate::error::McpError;
use crate::format::format_combined_name;
use crate::metrics::MetricsStore;
use crate::protocol::{CallToolResult, ToolContent};
use crate::registry::SessionRegistry;

/// What a successful tool call produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolOutput {
    Text { text: String },
    Image { data: String, mime_type: String },
    Structured { content: Value },
}

impl ToolOutput {
    /// The first text or image block, else the structured content.
    pub fn from_result(result: &CallToolResult) -> Option<Self> {
        let block = result.content.iter().find_map(|content| match content {
            ToolContent::Text { text } => Some(Self::Text { text: text.clone() }),
            ToolContent::Image { data, mime_type } => Some(Self::Image {
                data: data.clone(),
                mime_type: mime_type.clone(),
            }),
            _ => None,
        });
        block.or_else(|| {
            result
                .structured_content
                .clone()
                .map(|content| Self::Structured { content })
        })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Retry and timeout policy for tool calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    pub call_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
}

impl CallPolicy {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            call_timeout: settings.call_timeout(),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            reconnect_backoff: settings.reconnect_backoff(),
        }
    }
}

pub struct ToolInvoker {
    registry: Arc<SessionRegistry>,
    metrics: Arc<MetricsStore>,
    policy: CallPolicy,
}

impl ToolInvoker {
    pub fn new(registry: Arc<SessionRegistry>, metrics: Arc<MetricsStore>, policy: CallPolicy) -> Self {
        Self {
            registry,
            metrics,
            policy,
        }
    }

    /// Call a tool on a tenant's plugin.
    ///
    /// The timeout is, in order of precedence, `timeout`, the plugin's
    /// configured timeout, or the default. A dropped connection is reopened
    /// and the call retried up to the configured number of times. Exactly one
    /// metric is recorded per call.
    pub async fn call_tool(
        &self,
        tenant_id: &str,
        plugin_name: &str,
        tool_name: &str,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Option<ToolOutput>, McpError> {
        let qualified = format_combined_name(plugin_name, tool_name);
        let started = Instant::now();

        let outcome = self
            .call_with_retry(tenant_id, plugin_name, tool_name, &qualified, arguments, timeout)
            .await;

        let elapsed = started.elapsed();
        match &outcome {
            Ok(_) => {
                self.metrics.record_success(&qualified, elapsed);
                debug!(tenant = %tenant_id, tool = %qualified, ?elapsed, "Tool call succeeded");
            }
            Err(e) => {
                self.metrics.record_failure(&qualified, elapsed);
                warn!(tenant = %tenant_id, tool = %qualified, error = %e, "Tool call failed");
            }
        }
        outcome
    }

    async fn call_with_retry(
        &self,
        tenant_id: &str,
        plugin_name: &str,
        tool_name: &str,
        qualified: &str,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Option<ToolOutput>, McpError> {
        let max_reconnects = self.policy.max_reconnect_attempts;
        let mut reconnects = 0u32;

        loop {
            let session = match self.registry.get_session(tenant_id, plugin_name) {
                Ok(session) => session,
                Err(e) => {
                    // Evicted sessions come back transparently.
                    let remembered = self.registry.known_config(tenant_id, plugin_name).is_some();
                    if remembered && reconnects < max_reconnects {
                        reconnects += 1;
                        debug!(tenant = %tenant_id, plugin = %plugin_name, "Restoring session");
                        if !self.registry.restore(tenant_id, plugin_name).await {
                            tokio::time::sleep(self.policy.reconnect_backoff).await;
                        }
                        continue;
                    }
                    if reconnects > 0 {
                        return Err(McpError::TransportClosed {
                            tool: qualified.to_string(),
                            attempts: reconnects + 1,
                            message: e.to_string(),
                        });
                    }
                    return Err(e);
                }
            };

            let timeout = timeout
                .or_else(|| session.config().timeout())
                .unwrap_or(self.policy.call_timeout);
            let handle = session.handle();
            let call = handle.call_tool(tool_name, arguments.clone());

            match tokio::time::timeout(timeout, call).await {
                Err(_) => {
                    session.record_error();
                    return Err(McpError::CallTimeout {
                        tool: qualified.to_string(),
                        timeout,
                    });
                }
                Ok(Ok(result)) if result.is_error => {
                    return Err(McpError::Tool {
                        tool: qualified.to_string(),
                        message: result.joined_text(),
                    });
                }
                Ok(Ok(result)) => return Ok(ToolOutput::from_result(&result)),
                Ok(Err(e)) if e.is_reconnectable() => {
                    session.record_error();
                    if reconnects >= max_reconnects {
                        return Err(McpError::TransportClosed {
                            tool: qualified.to_string(),
                            attempts: reconnects + 1,
                            message: e.to_string(),
                        });
                    }
                    reconnects += 1;
                    warn!(
                        tenant = %tenant_id,
                        tool = %qualified,
                        session_id = %session.id(),
                        attempt = reconnects,
                        error = %e,
                        "Connection lost, reconnecting"
                    );
                    self.registry.reconnect(&session).await;
                    tokio::time::sleep(self.policy.reconnect_backoff).await;
                }
                Ok(Err(e)) => {
                    session.record_error();
                    return Err(e.for_tool(qualified));
                }
            }
        }
    }
}
