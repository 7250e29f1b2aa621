//! The session manager facade.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use toolmesh_core::{PluginConfig, SessionSettings};
use tracing::{debug, info, warn};

use crate::batch::{BatchCallRequest, BatchCallResult, BatchInvoker};
use crate::catalog::{CatalogStats, ToolCatalog};
use crate::cleaner::Cleaner;
use crate::connector::{Connector, McpConnector};
use crate::error::McpError;
use crate::events::{StatusEventBus, StatusObserver};
use crate::format::{self, ContextFormat};
use crate::health::{HealthMonitor, HealthThresholds};
use crate::invoker::{CallPolicy, ToolInvoker, ToolOutput};
use crate::metrics::{MetricsStore, ToolMetric};
use crate::protocol::McpToolDefinition;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionInfo, SessionKey};

struct Background {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Manages MCP sessions for many tenants and plugins.
///
/// Construct once and share behind an `Arc`. Call [`start`](Self::start) to
/// run the health and idle-eviction loops and [`shutdown`](Self::shutdown)
/// to stop them and close every session.
pub struct McpSessionManager {
    settings: SessionSettings,
    registry: Arc<SessionRegistry>,
    catalog: Arc<ToolCatalog>,
    metrics: Arc<MetricsStore>,
    events: Arc<StatusEventBus>,
    invoker: Arc<ToolInvoker>,
    batch: BatchInvoker,
    health: Arc<HealthMonitor>,
    cleaner: Arc<Cleaner>,
    background: Mutex<Option<Background>>,
}

impl McpSessionManager {
    pub fn new(settings: SessionSettings, connector: Arc<dyn Connector>) -> Self {
        let catalog = Arc::new(ToolCatalog::new(settings.cache_ttl()));
        let metrics = Arc::new(MetricsStore::new());
        let events = Arc::new(StatusEventBus::new());
        let registry = Arc::new(SessionRegistry::new(
            connector,
            Arc::clone(&catalog),
            Arc::clone(&events),
        ));
        let invoker = Arc::new(ToolInvoker::new(
            Arc::clone(&registry),
            Arc::clone(&metrics),
            CallPolicy::from_settings(&settings),
        ));
        let batch = BatchInvoker::from_settings(Arc::clone(&registry), Arc::clone(&invoker), &settings);
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&events),
            HealthThresholds::from_settings(&settings),
        ));
        let cleaner = Arc::new(Cleaner::new(Arc::clone(&registry), settings.idle_ttl()));

        Self {
            settings,
            registry,
            catalog,
            metrics,
            events,
            invoker,
            batch,
            health,
            cleaner,
            background: Mutex::new(None),
        }
    }

    /// Manager talking to real MCP servers.
    pub fn with_mcp_connector(settings: SessionSettings) -> Self {
        let connector = Arc::new(McpConnector::new(settings.connect_timeout()));
        Self::new(settings, connector)
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    // Lifecycle

    /// Start the health and idle-eviction loops. Calling it again is a no-op.
    pub fn start(&self) {
        let mut background = self.background.lock();
        if background.is_some() {
            return;
        }

        let (shutdown, rx) = watch::channel(false);
        let tasks = vec![
            Arc::clone(&self.health).spawn(self.settings.health_check_interval(), rx.clone()),
            Arc::clone(&self.cleaner).spawn(self.settings.cleanup_interval(), rx),
        ];
        *background = Some(Background { shutdown, tasks });
        info!(
            health_interval = ?self.settings.health_check_interval(),
            cleanup_interval = ?self.settings.cleanup_interval(),
            "Session manager started"
        );
    }

    pub fn is_running(&self) -> bool {
        self.background.lock().is_some()
    }

    /// Stop the background loops and close every session.
    pub async fn shutdown(&self) {
        let background = self.background.lock().take();
        if let Some(background) = background {
            let _ = background.shutdown.send(true);
            for task in background.tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Background task ended abnormally");
                }
            }
        }
        let closed = self.registry.close_all().await;
        info!(closed, "Session manager stopped");
    }

    // Sessions

    pub async fn register(&self, config: PluginConfig) -> bool {
        self.registry.register(config).await
    }

    pub async fn unregister(&self, tenant_id: &str, plugin_name: &str) -> bool {
        self.registry.unregister(tenant_id, plugin_name).await
    }

    pub async fn ensure_registered(&self, config: PluginConfig) -> bool {
        self.registry.ensure_registered(config).await
    }

    pub fn get_session(&self, tenant_id: &str, plugin_name: &str) -> Result<Arc<Session>, McpError> {
        self.registry.get_session(tenant_id, plugin_name)
    }

    pub fn session_info(&self) -> Vec<SessionInfo> {
        self.registry.session_info()
    }

    // Tools

    /// Tools of a tenant's plugin, served from cache while fresh.
    pub async fn get_tools(
        &self,
        tenant_id: &str,
        plugin_name: &str,
        use_cache: bool,
    ) -> Result<Vec<McpToolDefinition>, McpError> {
        let key = SessionKey::new(tenant_id, plugin_name);
        if use_cache && self.is_known(&key) {
            if let Some(tools) = self.catalog.get(&key) {
                debug!(tenant = %tenant_id, plugin = %plugin_name, "Tool list served from cache");
                return Ok(tools);
            }
        }

        let session = self.registry.get_session(tenant_id, plugin_name)?;
        let timeout = session
            .config()
            .timeout()
            .unwrap_or(self.settings.call_timeout());
        let handle = session.handle();
        let tools = match tokio::time::timeout(timeout, handle.list_tools()).await {
            Ok(Ok(tools)) => tools,
            Ok(Err(e)) => {
                session.record_error();
                return Err(e);
            }
            Err(_) => {
                session.record_error();
                return Err(McpError::Timeout(timeout));
            }
        };

        debug!(
            tenant = %tenant_id,
            plugin = %plugin_name,
            tools = tools.len(),
            "Fetched tool list"
        );
        // The registry removes a session before invalidating its entry, so a
        // list stored for a session that has since been replaced is dropped here.
        self.catalog.store(key.clone(), tools.clone());
        if !self.is_current(&key, &session) {
            self.catalog.invalidate(&key);
        }
        Ok(tools)
    }

    fn is_known(&self, key: &SessionKey) -> bool {
        self.registry.session(key).is_some()
            || self
                .registry
                .known_config(&key.tenant_id, &key.plugin_name)
                .is_some()
    }

    fn is_current(&self, key: &SessionKey, session: &Session) -> bool {
        self.registry
            .session(key)
            .is_some_and(|current| current.id() == session.id())
    }

    /// Tools of a plugin in function-calling form.
    pub async fn get_function_tools(
        &self,
        tenant_id: &str,
        plugin_name: &str,
        use_cache: bool,
    ) -> Result<Vec<Value>, McpError> {
        let tools = self.get_tools(tenant_id, plugin_name, use_cache).await?;
        Ok(format::format_for_function_calling(&tools, plugin_name))
    }

    pub fn invalidate_tools(&self, tenant_id: &str, plugin_name: &str) -> bool {
        self.catalog.invalidate(&SessionKey::new(tenant_id, plugin_name))
    }

    pub fn catalog_stats(&self) -> CatalogStats {
        self.catalog.stats()
    }

    pub async fn call_tool(
        &self,
        tenant_id: &str,
        plugin_name: &str,
        tool_name: &str,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Option<ToolOutput>, McpError> {
        self.invoker
            .call_tool(tenant_id, plugin_name, tool_name, arguments, timeout)
            .await
    }

    pub async fn batch_call_tools(
        &self,
        tenant_id: &str,
        requests: &[BatchCallRequest],
    ) -> Vec<BatchCallResult> {
        self.batch.run(tenant_id, requests).await
    }

    // Formatting

    pub fn format_for_function_calling(
        &self,
        tools: &[McpToolDefinition],
        plugin_name: &str,
    ) -> Vec<Value> {
        format::format_for_function_calling(tools, plugin_name)
    }

    /// Split a combined name against the tenant's registered plugins.
    pub fn resolve_combined_name(
        &self,
        tenant_id: &str,
        name: &str,
    ) -> Result<(String, String), McpError> {
        format::resolve_combined_name(name, &self.registry.plugins_for(tenant_id))
    }

    pub fn build_context(&self, results: &[BatchCallResult], style: ContextFormat) -> String {
        format::build_context(results, style)
    }

    // Observability

    pub fn tool_metric(&self, tool: &str) -> Option<ToolMetric> {
        self.metrics.get(tool)
    }

    pub fn metrics(&self) -> Vec<(String, ToolMetric)> {
        self.metrics.snapshot()
    }

    pub fn subscribe(&self, observer: Arc<dyn StatusObserver>) {
        self.events.subscribe(observer);
    }

    /// Run one health evaluation now.
    pub async fn check_health(&self) -> usize {
        self.health.check_once().await
    }

    /// Run one idle sweep now.
    pub async fn sweep_idle(&self) -> usize {
        self.cleaner.sweep_once().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{plugin, settings, MockConnector};

    fn manager(connector: Arc<MockConnector>) -> McpSessionManager {
        McpSessionManager::new(settings(), connector)
    }

    #[tokio::test]
    async fn test_get_tools_caches() {
        let connector = MockConnector::new();
        connector.set_tools(vec![McpToolDefinition::new("search")]);
        let manager = manager(connector.clone());
        manager.register(plugin("t1", "notes")).await;

        let tools = manager.get_tools("t1", "notes", true).await.unwrap();
        assert_eq!(tools.len(), 1);
        manager.get_tools("t1", "notes", true).await.unwrap();
        assert_eq!(connector.list_calls(), 1);
        assert_eq!(manager.catalog_stats().hits, 1);

        manager.get_tools("t1", "notes", false).await.unwrap();
        assert_eq!(connector.list_calls(), 2);

        let functions = manager.get_function_tools("t1", "notes", true).await.unwrap();
        assert_eq!(functions[0]["function"]["name"], "notes_search");
        assert_eq!(connector.list_calls(), 2);
    }

    #[tokio::test]
    async fn test_in_flight_list_not_cached_after_unregister() {
        let connector = MockConnector::new();
        connector.set_tools(vec![McpToolDefinition::new("search")]);
        let gate = connector.gate_list_tools();
        let manager = Arc::new(manager(connector.clone()));
        manager.register(plugin("t1", "notes")).await;

        let fetch = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_tools("t1", "notes", true).await })
        };
        while connector.list_calls() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(manager.unregister("t1", "notes").await);
        gate.notify_one();
        assert_eq!(fetch.await.unwrap().unwrap().len(), 1);

        let err = manager.get_tools("t1", "notes", true).await.unwrap_err();
        assert!(matches!(err, McpError::SessionNotFound { .. }));
        assert_eq!(manager.catalog_stats().live_entries, 0);
    }

    #[tokio::test]
    async fn test_in_flight_list_not_cached_for_replacement_session() {
        let connector = MockConnector::new();
        connector.set_tools(vec![McpToolDefinition::new("search")]);
        let gate = connector.gate_list_tools();
        let manager = Arc::new(manager(connector.clone()));
        manager.register(plugin("t1", "notes")).await;

        let fetch = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_tools("t1", "notes", true).await })
        };
        while connector.list_calls() == 0 {
            tokio::task::yield_now().await;
        }
        manager.register(plugin("t1", "notes")).await;
        gate.notify_one();
        fetch.await.unwrap().unwrap();
        assert_eq!(manager.catalog_stats().live_entries, 0);

        // The replacement session fetches its own list.
        gate.notify_one();
        manager.get_tools("t1", "notes", true).await.unwrap();
        assert_eq!(connector.list_calls(), 2);
        assert_eq!(manager.catalog_stats().live_entries, 1);
    }

    #[tokio::test]
    async fn test_get_tools_without_session() {
        let manager = manager(MockConnector::new());
        let err = manager.get_tools("t1", "notes", true).await.unwrap_err();
        assert!(matches!(err, McpError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_resolve_uses_registered_plugins() {
        let manager = manager(MockConnector::new());
        manager.register(plugin("t1", "web_search")).await;

        assert_eq!(
            manager.resolve_combined_name("t1", "web_search_query").unwrap(),
            ("web_search".to_string(), "query".to_string())
        );
        // Other tenants do not see t1's plugins.
        assert_eq!(
            manager.resolve_combined_name("t2", "web_search_query").unwrap(),
            ("web".to_string(), "search_query".to_string())
        );
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let connector = MockConnector::new();
        let manager = manager(connector.clone());
        manager.register(plugin("t1", "notes")).await;

        manager.start();
        manager.start();
        assert!(manager.is_running());

        manager.shutdown().await;
        assert!(!manager.is_running());
        assert!(manager.session_info().is_empty());
        assert_eq!(connector.released(), 1);
    }
}
