//! Scripted connector for unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use toolmesh_core::{PluginConfig, SessionSettings};

use crate::connection::ToolSession;
use crate::connector::{Connector, Established};
use crate::error::{McpError, TransportError};
use crate::protocol::{CallToolResult, McpToolDefinition};
use crate::resources::ResourceStack;

/// A plugin whose replies are queued up front. Unscripted calls succeed with
/// `"{tool} ok"`.
#[derive(Default)]
pub(crate) struct ScriptedPlugin {
    tools: Mutex<Vec<McpToolDefinition>>,
    replies: Mutex<VecDeque<Result<CallToolResult, McpError>>>,
    call_delay: Mutex<Option<Duration>>,
    list_gate: Mutex<Option<Arc<Notify>>>,
    list_calls: AtomicUsize,
    calls: AtomicUsize,
}

#[async_trait]
impl ToolSession for ScriptedPlugin {
    async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.list_gate.lock().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self.tools.lock().clone())
    }

    async fn call_tool(
        &self,
        name: &str,
        _arguments: Option<Value>,
    ) -> Result<CallToolResult, McpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.call_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let reply = self.replies.lock().pop_front();
        reply.unwrap_or_else(|| Ok(CallToolResult::text(format!("{} ok", name))))
    }
}

#[derive(Default)]
pub(crate) struct MockConnector {
    plugin: Arc<ScriptedPlugin>,
    failing: Mutex<HashSet<String>>,
    connects: AtomicUsize,
    released: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_tools(&self, tools: Vec<McpToolDefinition>) {
        *self.plugin.tools.lock() = tools;
    }

    pub fn push_reply(&self, reply: Result<CallToolResult, McpError>) {
        self.plugin.replies.lock().push_back(reply);
    }

    pub fn push_disconnect(&self) {
        self.push_reply(Err(McpError::Transport(TransportError::ConnectionClosed)));
    }

    pub fn set_call_delay(&self, delay: Duration) {
        *self.plugin.call_delay.lock() = Some(delay);
    }

    /// Make every `tools/list` wait for a permit on the returned gate.
    pub fn gate_list_tools(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.plugin.list_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn fail_plugin(&self, plugin: &str) {
        self.failing.lock().insert(plugin.to_string());
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Sessions whose resources have been released.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.plugin.list_calls.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.plugin.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, config: &PluginConfig) -> Result<Established, McpError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(&config.plugin_name) {
            return Err(McpError::connection(&config.plugin_name, "connection refused"));
        }

        let mut resources = ResourceStack::new();
        let released = Arc::clone(&self.released);
        resources.push("mock-session", move || async move {
            released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        Ok(Established {
            handle: self.plugin.clone(),
            resources,
        })
    }
}

/// Settings with short timings for tests.
pub(crate) fn settings() -> SessionSettings {
    SessionSettings {
        call_timeout_secs: 5,
        reconnect_backoff_ms: 1,
        batch_delay_ms: 1,
        min_sample_size: 4,
        ..SessionSettings::default()
    }
}

pub(crate) fn plugin(tenant: &str, name: &str) -> PluginConfig {
    PluginConfig::new(tenant, name, format!("http://{}.test/mcp", name))
}
