//! Live plugin sessions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use toolmesh_core::{PluginConfig, TransportKind};
use uuid::Uuid;

use crate::connection::ToolSession;
use crate::connector::Established;
use crate::events::SessionStatus;
use crate::resources::ResourceStack;

/// Identifies a session: one plugin of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionKey {
    pub tenant_id: String,
    pub plugin_name: String,
}

impl SessionKey {
    pub fn new(tenant_id: impl Into<String>, plugin_name: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            plugin_name: plugin_name.into(),
        }
    }

    pub fn of(config: &PluginConfig) -> Self {
        Self::new(&config.tenant_id, &config.plugin_name)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.plugin_name)
    }
}

/// A live, initialized connection for one (tenant, plugin) pair.
pub struct Session {
    /// Distinguishes successive sessions of the same key.
    id: Uuid,
    key: SessionKey,
    config: PluginConfig,
    handle: Arc<dyn ToolSession>,
    resources: Mutex<ResourceStack>,
    created_at: DateTime<Utc>,
    last_access: Mutex<Instant>,
    request_count: AtomicU64,
    error_count: AtomicU64,
    status: Mutex<SessionStatus>,
}

impl Session {
    pub(crate) fn new(config: PluginConfig, established: Established) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: SessionKey::of(&config),
            config,
            handle: established.handle,
            resources: Mutex::new(established.resources),
            created_at: Utc::now(),
            last_access: Mutex::new(Instant::now()),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            status: Mutex::new(SessionStatus::Active),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Protocol handle for issuing requests.
    pub fn handle(&self) -> Arc<dyn ToolSession> {
        Arc::clone(&self.handle)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Mark the session as used by one more request.
    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Errors per request; zero before the first request.
    pub fn error_rate(&self) -> f64 {
        let requests = self.request_count();
        if requests == 0 {
            return 0.0;
        }
        self.error_count() as f64 / requests as f64
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    /// Replace the status, returning the previous one.
    pub(crate) fn set_status(&self, status: SessionStatus) -> SessionStatus {
        std::mem::replace(&mut *self.status.lock(), status)
    }

    /// Move from `from` to `to` only if the status is still `from`.
    pub(crate) fn transition(&self, from: SessionStatus, to: SessionStatus) -> bool {
        let mut status = self.status.lock();
        if *status != from {
            return false;
        }
        *status = to;
        true
    }

    /// Whether this session was opened with the same endpoint and transport.
    pub fn matches_endpoint(&self, url: &str, transport: TransportKind) -> bool {
        self.config.url == url && self.config.transport == transport
    }

    /// Release the session's resources, newest first. Returns how many closed cleanly.
    pub(crate) async fn close(&self) -> usize {
        self.set_status(SessionStatus::Inactive);
        let mut resources = std::mem::take(&mut *self.resources.lock());
        resources.close_all().await
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            tenant_id: self.key.tenant_id.clone(),
            plugin_name: self.key.plugin_name.clone(),
            url: self.config.url.clone(),
            transport: self.config.transport,
            status: self.status(),
            created_at: self.created_at,
            idle_secs: self.idle_for().as_secs(),
            request_count: self.request_count(),
            error_count: self.error_count(),
            error_rate: self.error_rate(),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("status", &self.status())
            .field("request_count", &self.request_count())
            .field("error_count", &self.error_count())
            .finish()
    }
}

/// Read-only snapshot of a session for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub tenant_id: String,
    pub plugin_name: String,
    pub url: String,
    pub transport: TransportKind,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub request_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{plugin, ScriptedPlugin};

    fn session() -> Session {
        Session::new(
            plugin("t1", "notes"),
            Established {
                handle: Arc::new(ScriptedPlugin::default()),
                resources: ResourceStack::new(),
            },
        )
    }

    #[test]
    fn test_error_rate() {
        let session = session();
        assert_eq!(session.error_rate(), 0.0);
        for _ in 0..4 {
            session.touch();
        }
        session.record_error();
        assert_eq!(session.error_rate(), 0.25);
    }

    #[tokio::test]
    async fn test_transition_requires_expected_status() {
        let session = session();
        assert!(session.transition(SessionStatus::Active, SessionStatus::Degraded));
        assert!(!session.transition(SessionStatus::Active, SessionStatus::Error));
        assert_eq!(session.status(), SessionStatus::Degraded);

        // A close that lands first wins over a stale health decision.
        session.close().await;
        assert!(!session.transition(SessionStatus::Degraded, SessionStatus::Error));
        assert_eq!(session.status(), SessionStatus::Inactive);
    }
}
