//! Session status transitions and their observers.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Health status of a plugin session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No live session.
    Inactive,
    /// Healthy.
    Active,
    /// Error rate above the warning threshold.
    Degraded,
    /// Error rate above the critical threshold, or the connection failed.
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inactive => write!(f, "inactive"),
            Self::Active => write!(f, "active"),
            Self::Degraded => write!(f, "degraded"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A status transition of one (tenant, plugin) session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub tenant_id: String,
    pub plugin_name: String,
    pub old_status: SessionStatus,
    pub new_status: SessionStatus,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(
        tenant_id: impl Into<String>,
        plugin_name: impl Into<String>,
        old_status: SessionStatus,
        new_status: SessionStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            plugin_name: plugin_name.into(),
            old_status,
            new_status,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Receives status transitions.
#[async_trait]
pub trait StatusObserver: Send + Sync {
    async fn on_status_change(&self, event: &StatusEvent) -> anyhow::Result<()>;
}

/// Adapts a plain closure into an observer.
pub struct FnObserver<F>(pub F);

#[async_trait]
impl<F> StatusObserver for FnObserver<F>
where
    F: Fn(&StatusEvent) -> anyhow::Result<()> + Send + Sync,
{
    async fn on_status_change(&self, event: &StatusEvent) -> anyhow::Result<()> {
        (self.0)(event)
    }
}

/// Queues events for a consumer running elsewhere (e.g. a persistence task).
///
/// Sending never waits, so a slow consumer cannot hold up the emitting call.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl StatusObserver for ChannelObserver {
    async fn on_status_change(&self, event: &StatusEvent) -> anyhow::Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| anyhow::anyhow!("status event consumer has gone away"))
    }
}

/// Fans status events out to registered observers.
#[derive(Default)]
pub struct StatusEventBus {
    observers: RwLock<Vec<Arc<dyn StatusObserver>>>,
}

impl StatusEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn StatusObserver>) {
        self.observers.write().push(observer);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Notify every observer in registration order.
    ///
    /// A failing or panicking observer is logged and the rest still run.
    pub async fn emit(&self, event: StatusEvent) {
        debug!(
            tenant = %event.tenant_id,
            plugin = %event.plugin_name,
            from = %event.old_status,
            to = %event.new_status,
            reason = %event.reason,
            "Session status changed"
        );

        let observers = self.observers.read().clone();
        for observer in observers {
            let outcome = AssertUnwindSafe(observer.on_status_change(&event))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(
                    tenant = %event.tenant_id,
                    plugin = %event.plugin_name,
                    error = %e,
                    "Status observer failed"
                ),
                Err(_) => error!(
                    tenant = %event.tenant_id,
                    plugin = %event.plugin_name,
                    "Status observer panicked"
                ),
            }
        }
    }
}
