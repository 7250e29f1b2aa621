//! Windowed execution of many tool calls for one tenant.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use toolmesh_core::SessionSettings;
use tracing::debug;

use crate::error::McpError;
use crate::format::resolve_combined_name;
use crate::invoker::{ToolInvoker, ToolOutput};
use crate::registry::SessionRegistry;

/// One call as supplied by a model or another caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCallRequest {
    pub id: String,
    /// Combined `plugin_tool` name.
    pub name: String,
    /// Arguments as JSON text; empty means none.
    #[serde(default)]
    pub arguments: String,
}

impl BatchCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchCallResult {
    pub id: String,
    pub name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchCallResult {
    pub fn success(id: impl Into<String>, name: impl Into<String>, result: Option<ToolOutput>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            success: true,
            result,
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

pub struct BatchInvoker {
    registry: Arc<SessionRegistry>,
    invoker: Arc<ToolInvoker>,
    window: usize,
    delay: Duration,
}

impl BatchInvoker {
    pub fn new(
        registry: Arc<SessionRegistry>,
        invoker: Arc<ToolInvoker>,
        window: usize,
        delay: Duration,
    ) -> Self {
        Self {
            registry,
            invoker,
            window: window.max(1),
            delay,
        }
    }

    pub fn from_settings(
        registry: Arc<SessionRegistry>,
        invoker: Arc<ToolInvoker>,
        settings: &SessionSettings,
    ) -> Self {
        Self::new(registry, invoker, settings.batch_window, settings.batch_delay())
    }

    /// Run every request, `window` at a time, pausing between windows.
    ///
    /// Never fails: each request yields exactly one result, in input order.
    pub async fn run(&self, tenant_id: &str, requests: &[BatchCallRequest]) -> Vec<BatchCallResult> {
        let mut results = Vec::with_capacity(requests.len());
        for (index, window) in requests.chunks(self.window).enumerate() {
            if index > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            debug!(tenant = %tenant_id, window = index, calls = window.len(), "Running batch window");
            let outcomes = join_all(window.iter().map(|request| self.run_one(tenant_id, request))).await;
            results.extend(outcomes);
        }
        results
    }

    async fn run_one(&self, tenant_id: &str, request: &BatchCallRequest) -> BatchCallResult {
        match self.call(tenant_id, request).await {
            Ok(output) => BatchCallResult::success(&request.id, &request.name, output),
            Err(e) => BatchCallResult::failure(&request.id, &request.name, e.to_string()),
        }
    }

    async fn call(
        &self,
        tenant_id: &str,
        request: &BatchCallRequest,
    ) -> Result<Option<ToolOutput>, McpError> {
        let plugins = self.registry.plugins_for(tenant_id);
        let (plugin, tool) = resolve_combined_name(&request.name, &plugins)?;
        let arguments = parse_arguments(&request.arguments)?;
        self.invoker
            .call_tool(tenant_id, &plugin, &tool, arguments, None)
            .await
    }
}

fn parse_arguments(raw: &str) -> Result<Option<Value>, McpError> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(raw)
        .map(Some)
        .map_err(|e| McpError::protocol(format!("invalid arguments: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ToolCatalog;
    use crate::events::StatusEventBus;
    use crate::invoker::CallPolicy;
    use crate::metrics::MetricsStore;
    use crate::testing::{plugin, settings, MockConnector};

    async fn batch(window: usize) -> (BatchInvoker, Arc<MockConnector>) {
        let connector = MockConnector::new();
        let registry = Arc::new(SessionRegistry::new(
            connector.clone(),
            Arc::new(ToolCatalog::new(Duration::from_secs(60))),
            Arc::new(StatusEventBus::new()),
        ));
        registry.register(plugin("t1", "notes")).await;
        registry.register(plugin("t1", "web_search")).await;
        let invoker = Arc::new(ToolInvoker::new(
            Arc::clone(&registry),
            Arc::new(MetricsStore::new()),
            CallPolicy::from_settings(&settings()),
        ));
        (
            BatchInvoker::new(registry, invoker, window, Duration::from_millis(1)),
            connector,
        )
    }

    #[test]
    fn test_request_arguments_default_to_empty() {
        let request: BatchCallRequest =
            serde_json::from_str(r#"{"id": "1", "name": "notes_list"}"#).unwrap();
        assert_eq!(request.arguments, "");
        assert_eq!(parse_arguments("  ").unwrap(), None);
    }

    #[tokio::test]
    async fn test_results_keep_order_and_capture_failures() {
        let (batch, connector) = batch(2).await;
        let requests = vec![
            BatchCallRequest::new("1", "notes_search", r#"{"q": "rust"}"#),
            BatchCallRequest::new("2", "nosuchname", ""),
            BatchCallRequest::new("3", "notes_list", "{not json"),
            BatchCallRequest::new("4", "web_search_query", "{}"),
            BatchCallRequest::new("5", "missing_tool", ""),
        ];

        let results = batch.run("t1", &requests).await;
        let ids: Vec<_> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4", "5"]);

        assert!(results[0].success);
        assert_eq!(results[0].result.as_ref().unwrap().as_text(), Some("search ok"));
        assert!(!results[1].success);
        assert!(results[1].error.as_ref().unwrap().contains("invalid tool name"));
        assert!(!results[2].success);
        assert!(results[2].error.as_ref().unwrap().contains("invalid arguments"));
        assert!(results[3].success);
        assert_eq!(results[3].result.as_ref().unwrap().as_text(), Some("query ok"));
        assert!(!results[4].success);
        assert!(results[4].error.as_ref().unwrap().contains("no session"));

        // Only the resolvable, well-formed requests reached the plugin.
        assert_eq!(connector.calls(), 2);
    }

    #[tokio::test]
    async fn test_windows_run_concurrently() {
        let (batch, connector) = batch(3).await;
        connector.set_call_delay(Duration::from_millis(100));
        let requests: Vec<_> = (0..3)
            .map(|i| BatchCallRequest::new(i.to_string(), "notes_search", ""))
            .collect();

        let started = tokio::time::Instant::now();
        let results = batch.run("t1", &requests).await;
        assert!(results.iter().all(|r| r.success));
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_evicted_plugin_with_underscore_resolves() {
        let (batch, connector) = batch(2).await;
        let registry = Arc::clone(&batch.registry);
        let session = registry
            .session(&crate::session::SessionKey::new("t1", "web_search"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(registry.evict_if_idle(&session, Duration::ZERO).await);

        let results = batch
            .run("t1", &[BatchCallRequest::new("1", "web_search_query", "")])
            .await;
        assert!(results[0].success, "{:?}", results[0].error);
        assert_eq!(results[0].result.as_ref().unwrap().as_text(), Some("query ok"));
        assert_eq!(connector.connects(), 3);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let (batch, _connector) = batch(2).await;
        assert!(batch.run("t1", &[]).await.is_empty());
    }
}
