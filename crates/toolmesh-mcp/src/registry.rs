//! The live session map.
//!
//! Holds at most one [`Session`] per (tenant, plugin). Every operation that
//! opens or closes a session first takes its tenant's async lock, so the
//! resources of one session are never torn down and rebuilt concurrently,
//! while different tenants proceed independently. The maps themselves sit
//! behind short synchronous locks that are never held across an `.await`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use toolmesh_core::PluginConfig;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::ToolCatalog;
use crate::connector::Connector;
use crate::error::McpError;
use crate::events::{SessionStatus, StatusEvent, StatusEventBus};
use crate::session::{Session, SessionInfo, SessionKey};

pub struct SessionRegistry {
    connector: Arc<dyn Connector>,
    catalog: Arc<ToolCatalog>,
    events: Arc<StatusEventBus>,
    sessions: Mutex<HashMap<SessionKey, Arc<Session>>>,
    tenant_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// Last registered config per key; survives idle eviction.
    known_configs: Mutex<HashMap<SessionKey, PluginConfig>>,
}

impl SessionRegistry {
    pub fn new(
        connector: Arc<dyn Connector>,
        catalog: Arc<ToolCatalog>,
        events: Arc<StatusEventBus>,
    ) -> Self {
        Self {
            connector,
            catalog,
            events,
            sessions: Mutex::new(HashMap::new()),
            tenant_locks: Mutex::new(HashMap::new()),
            known_configs: Mutex::new(HashMap::new()),
        }
    }

    fn tenant_lock(&self, tenant_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.tenant_locks.lock();
        Arc::clone(locks.entry(tenant_id.to_string()).or_default())
    }

    /// Open a session for the config, replacing any existing one for its key.
    ///
    /// Returns `false` if the plugin could not be reached; the failure is
    /// reported as a status event rather than an error.
    pub async fn register(&self, config: PluginConfig) -> bool {
        let lock = self.tenant_lock(&config.tenant_id);
        let (registered, event) = {
            let _guard = lock.lock().await;
            self.register_locked(config).await
        };
        self.events.emit(event).await;
        registered
    }

    /// Caller must hold the tenant lock.
    async fn register_locked(&self, config: PluginConfig) -> (bool, StatusEvent) {
        let key = SessionKey::of(&config);
        self.known_configs.lock().insert(key.clone(), config.clone());
        let prior = self.sessions.lock().remove(&key);
        // After the removal, so an in-flight fetch cannot re-populate it.
        self.catalog.invalidate(&key);
        let prior_status = match prior {
            Some(prior) => {
                let status = prior.status();
                let released = prior.close().await;
                debug!(
                    tenant = %key.tenant_id,
                    plugin = %key.plugin_name,
                    session_id = %prior.id(),
                    released,
                    "Closed previous session"
                );
                status
            }
            None => SessionStatus::Inactive,
        };

        match self.connector.connect(&config).await {
            Ok(established) => {
                let session = Arc::new(Session::new(config, established));
                info!(
                    tenant = %key.tenant_id,
                    plugin = %key.plugin_name,
                    session_id = %session.id(),
                    "Session registered"
                );
                self.sessions.lock().insert(key.clone(), session);
                let event = StatusEvent::new(
                    key.tenant_id,
                    key.plugin_name,
                    prior_status,
                    SessionStatus::Active,
                    "registered",
                );
                (true, event)
            }
            Err(e) => {
                warn!(
                    tenant = %key.tenant_id,
                    plugin = %key.plugin_name,
                    error = %e,
                    "Session registration failed"
                );
                let event = StatusEvent::new(
                    key.tenant_id,
                    key.plugin_name,
                    SessionStatus::Inactive,
                    SessionStatus::Error,
                    e.to_string(),
                );
                (false, event)
            }
        }
    }

    /// Close and forget the session for the key. No-op if absent.
    pub async fn unregister(&self, tenant_id: &str, plugin_name: &str) -> bool {
        let key = SessionKey::new(tenant_id, plugin_name);
        let lock = self.tenant_lock(tenant_id);
        let event = {
            let _guard = lock.lock().await;
            self.known_configs.lock().remove(&key);
            let removed = self.sessions.lock().remove(&key);
            self.catalog.invalidate(&key);
            match removed {
                Some(session) => {
                    let old_status = session.status();
                    session.close().await;
                    info!(tenant = %tenant_id, plugin = %plugin_name, "Session unregistered");
                    Some(StatusEvent::new(
                        tenant_id,
                        plugin_name,
                        old_status,
                        SessionStatus::Inactive,
                        "unregistered",
                    ))
                }
                None => None,
            }
        };

        match event {
            Some(event) => {
                self.events.emit(event).await;
                true
            }
            None => false,
        }
    }

    /// Register only if there is no usable session for the key.
    ///
    /// A session is reused unless its endpoint or transport changed or it is
    /// in the error state.
    pub async fn ensure_registered(&self, config: PluginConfig) -> bool {
        let key = SessionKey::of(&config);
        let lock = self.tenant_lock(&config.tenant_id);
        let event = {
            let _guard = lock.lock().await;
            let existing = self.sessions.lock().get(&key).cloned();
            if let Some(existing) = existing {
                if existing.matches_endpoint(&config.url, config.transport)
                    && existing.status() != SessionStatus::Error
                {
                    return true;
                }
            }
            self.register_locked(config).await
        };
        let (registered, event) = event;
        self.events.emit(event).await;
        registered
    }

    /// Look up a session and count the lookup as a request.
    pub fn get_session(&self, tenant_id: &str, plugin_name: &str) -> Result<Arc<Session>, McpError> {
        let key = SessionKey::new(tenant_id, plugin_name);
        let session = self
            .session(&key)
            .ok_or_else(|| McpError::session_not_found(tenant_id, plugin_name))?;
        session.touch();
        Ok(session)
    }

    /// Look up a session without touching it.
    pub fn session(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.sessions.lock().get(key).cloned()
    }

    /// Replace a broken session with a fresh one built from its config.
    ///
    /// Only the first caller for a given broken session reconnects; later
    /// callers find a different session in the map and reuse it.
    pub async fn reconnect(&self, broken: &Session) -> bool {
        self.reconnect_key(broken.key(), Some(broken.id())).await
    }

    /// Re-open a session that was evicted, using its remembered config.
    pub async fn restore(&self, tenant_id: &str, plugin_name: &str) -> bool {
        self.reconnect_key(&SessionKey::new(tenant_id, plugin_name), None)
            .await
    }

    async fn reconnect_key(&self, key: &SessionKey, stale: Option<Uuid>) -> bool {
        let lock = self.tenant_lock(&key.tenant_id);
        let (registered, event) = {
            let _guard = lock.lock().await;
            let current = self.session(key);
            if let Some(current) = current {
                if Some(current.id()) != stale {
                    debug!(
                        tenant = %key.tenant_id,
                        plugin = %key.plugin_name,
                        "Session already replaced"
                    );
                    return true;
                }
            }
            let Some(config) = self.known_config(&key.tenant_id, &key.plugin_name) else {
                return false;
            };
            info!(tenant = %key.tenant_id, plugin = %key.plugin_name, "Reconnecting session");
            self.register_locked(config).await
        };
        self.events.emit(event).await;
        registered
    }

    /// Close the session if it is still the live one and has been idle longer than `idle_ttl`.
    pub(crate) async fn evict_if_idle(&self, session: &Session, idle_ttl: Duration) -> bool {
        let key = session.key();
        let lock = self.tenant_lock(&key.tenant_id);
        let event = {
            let _guard = lock.lock().await;
            let evicted = {
                let mut sessions = self.sessions.lock();
                match sessions.get(key) {
                    Some(current) if current.id() == session.id() && session.idle_for() > idle_ttl => {
                        sessions.remove(key)
                    }
                    _ => None,
                }
            };
            let Some(evicted) = evicted else {
                return false;
            };
            let old_status = evicted.status();
            evicted.close().await;
            self.catalog.invalidate(key);
            info!(
                tenant = %key.tenant_id,
                plugin = %key.plugin_name,
                session_id = %evicted.id(),
                "Evicted idle session"
            );
            StatusEvent::new(
                &key.tenant_id,
                &key.plugin_name,
                old_status,
                SessionStatus::Inactive,
                "idle timeout",
            )
        };
        self.events.emit(event).await;
        true
    }

    pub fn known_config(&self, tenant_id: &str, plugin_name: &str) -> Option<PluginConfig> {
        self.known_configs
            .lock()
            .get(&SessionKey::new(tenant_id, plugin_name))
            .cloned()
    }

    /// Plugin names the tenant can call: live sessions plus remembered
    /// configs of evicted ones.
    pub fn plugins_for(&self, tenant_id: &str) -> Vec<String> {
        let mut plugins: Vec<String> = self
            .sessions
            .lock()
            .keys()
            .filter(|key| key.tenant_id == tenant_id)
            .map(|key| key.plugin_name.clone())
            .collect();
        plugins.extend(
            self.known_configs
                .lock()
                .keys()
                .filter(|key| key.tenant_id == tenant_id)
                .map(|key| key.plugin_name.clone()),
        );
        plugins.sort();
        plugins.dedup();
        plugins
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Snapshot of every live session, sorted by key.
    pub fn session_info(&self) -> Vec<SessionInfo> {
        let mut info: Vec<SessionInfo> = self.sessions().iter().map(|s| s.info()).collect();
        info.sort_by(|a, b| {
            (a.tenant_id.as_str(), a.plugin_name.as_str())
                .cmp(&(b.tenant_id.as_str(), b.plugin_name.as_str()))
        });
        info
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Close every live session. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let keys: Vec<SessionKey> = self.sessions.lock().keys().cloned().collect();
        let mut closed = 0;
        for key in keys {
            let lock = self.tenant_lock(&key.tenant_id);
            let event = {
                let _guard = lock.lock().await;
                let removed = self.sessions.lock().remove(&key);
                let Some(session) = removed else {
                    continue;
                };
                let old_status = session.status();
                session.close().await;
                self.catalog.invalidate(&key);
                StatusEvent::new(
                    &key.tenant_id,
                    &key.plugin_name,
                    old_status,
                    SessionStatus::Inactive,
                    "shutdown",
                )
            };
            self.events.emit(event).await;
            closed += 1;
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelObserver;
    use crate::protocol::McpToolDefinition;
    use crate::testing::{plugin, MockConnector};

    fn registry(
        connector: Arc<MockConnector>,
    ) -> (
        Arc<SessionRegistry>,
        tokio::sync::mpsc::UnboundedReceiver<StatusEvent>,
    ) {
        let events = Arc::new(StatusEventBus::new());
        let (observer, rx) = ChannelObserver::new();
        events.subscribe(Arc::new(observer));
        let registry = SessionRegistry::new(
            connector,
            Arc::new(ToolCatalog::new(Duration::from_secs(60))),
            events,
        );
        (Arc::new(registry), rx)
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let connector = MockConnector::new();
        let (registry, mut rx) = registry(connector.clone());

        assert!(registry.register(plugin("t1", "notes")).await);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.old_status, SessionStatus::Inactive);
        assert_eq!(event.new_status, SessionStatus::Active);

        let session = registry.get_session("t1", "notes").unwrap();
        assert_eq!(session.request_count(), 1);
        assert_eq!(session.status(), SessionStatus::Active);
        assert_eq!(registry.plugins_for("t1"), vec!["notes"]);
        assert!(registry.plugins_for("t2").is_empty());
    }

    #[tokio::test]
    async fn test_missing_session() {
        let (registry, _rx) = registry(MockConnector::new());
        let err = registry.get_session("t1", "notes").unwrap_err();
        assert!(matches!(err, McpError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_failed_register_emits_error() {
        let connector = MockConnector::new();
        connector.fail_plugin("notes");
        let (registry, mut rx) = registry(connector.clone());

        assert!(!registry.register(plugin("t1", "notes")).await);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.old_status, SessionStatus::Inactive);
        assert_eq!(event.new_status, SessionStatus::Error);
        assert!(event.reason.contains("connection refused"));
        assert!(registry.is_empty());
        assert!(registry.known_config("t1", "notes").is_some());
    }

    #[tokio::test]
    async fn test_reregister_replaces_session() {
        let connector = MockConnector::new();
        let (registry, mut rx) = registry(connector.clone());

        registry.register(plugin("t1", "notes")).await;
        let first = registry.session(&SessionKey::new("t1", "notes")).unwrap();
        registry.register(plugin("t1", "notes")).await;
        let second = registry.session(&SessionKey::new("t1", "notes")).unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(first.status(), SessionStatus::Inactive);
        assert_eq!(registry.len(), 1);
        assert_eq!(connector.released(), 1);

        rx.recv().await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.old_status, SessionStatus::Active);
        assert_eq!(event.new_status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_unregister() {
        let connector = MockConnector::new();
        let (registry, mut rx) = registry(connector.clone());
        let catalog_key = SessionKey::new("t1", "notes");

        registry.register(plugin("t1", "notes")).await;
        registry
            .catalog
            .store(catalog_key.clone(), vec![McpToolDefinition::new("search")]);

        assert!(registry.unregister("t1", "notes").await);
        assert!(!registry.unregister("t1", "notes").await);
        assert!(registry.is_empty());
        assert!(registry.known_config("t1", "notes").is_none());
        assert!(registry.catalog.get(&catalog_key).is_none());
        assert_eq!(connector.released(), 1);

        rx.recv().await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.new_status, SessionStatus::Inactive);
        assert_eq!(event.reason, "unregistered");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ensure_registered_reuses_healthy_session() {
        let connector = MockConnector::new();
        let (registry, _rx) = registry(connector.clone());

        assert!(registry.ensure_registered(plugin("t1", "notes")).await);
        assert!(registry.ensure_registered(plugin("t1", "notes")).await);
        assert_eq!(connector.connects(), 1);

        // Endpoint change forces a new session.
        let moved = PluginConfig::new("t1", "notes", "http://elsewhere.test/mcp");
        assert!(registry.ensure_registered(moved).await);
        assert_eq!(connector.connects(), 2);

        // So does the error state.
        let session = registry.session(&SessionKey::new("t1", "notes")).unwrap();
        session.set_status(SessionStatus::Error);
        let moved = PluginConfig::new("t1", "notes", "http://elsewhere.test/mcp");
        assert!(registry.ensure_registered(moved).await);
        assert_eq!(connector.connects(), 3);
    }

    #[tokio::test]
    async fn test_reconnect_happens_once_per_broken_session() {
        let connector = MockConnector::new();
        let (registry, _rx) = registry(connector.clone());
        registry.register(plugin("t1", "notes")).await;
        let broken = registry.session(&SessionKey::new("t1", "notes")).unwrap();

        let (a, b) = tokio::join!(registry.reconnect(&broken), registry.reconnect(&broken));
        assert!(a && b);
        assert_eq!(connector.connects(), 2);
        assert_eq!(connector.released(), 1);
    }

    #[tokio::test]
    async fn test_restore_requires_known_config() {
        let connector = MockConnector::new();
        let (registry, _rx) = registry(connector.clone());

        assert!(!registry.restore("t1", "notes").await);

        registry.register(plugin("t1", "notes")).await;
        let session = registry.session(&SessionKey::new("t1", "notes")).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(registry.evict_if_idle(&session, Duration::ZERO).await);
        assert!(registry.is_empty());

        assert!(registry.restore("t1", "notes").await);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_plugins_for_includes_evicted() {
        let connector = MockConnector::new();
        let (registry, _rx) = registry(connector.clone());
        registry.register(plugin("t1", "notes")).await;
        registry.register(plugin("t1", "web_search")).await;

        let session = registry.session(&SessionKey::new("t1", "web_search")).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(registry.evict_if_idle(&session, Duration::ZERO).await);
        assert_eq!(registry.plugins_for("t1"), vec!["notes", "web_search"]);

        registry.unregister("t1", "web_search").await;
        assert_eq!(registry.plugins_for("t1"), vec!["notes"]);
    }

    #[tokio::test]
    async fn test_close_all() {
        let connector = MockConnector::new();
        let (registry, _rx) = registry(connector.clone());
        registry.register(plugin("t1", "notes")).await;
        registry.register(plugin("t2", "notes")).await;

        assert_eq!(registry.close_all().await, 2);
        assert!(registry.is_empty());
        assert_eq!(connector.released(), 2);
    }
}
