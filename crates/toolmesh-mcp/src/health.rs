//! Error-rate driven session status.
//!
//! Status moves active → degraded → error as the error rate crosses the
//! warning and critical thresholds, and degraded → active when it recovers.
//! An errored session stays errored until it is registered again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use toolmesh_core::SessionSettings;
use tracing::{debug, info, warn};

use crate::events::{SessionStatus, StatusEvent, StatusEventBus};
use crate::registry::SessionRegistry;

/// Error-rate thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    pub warn_error_rate: f64,
    pub critical_error_rate: f64,
    pub min_sample_size: u64,
}

impl HealthThresholds {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            warn_error_rate: settings.warn_error_rate,
            critical_error_rate: settings.critical_error_rate,
            min_sample_size: settings.min_sample_size,
        }
    }

    /// The status a session should move to, if any.
    pub fn next_status(&self, current: SessionStatus, error_rate: f64) -> Option<SessionStatus> {
        match current {
            SessionStatus::Inactive | SessionStatus::Error => {
                // Error is left only through re-registration.
                None
            }
            _ if error_rate > self.critical_error_rate => Some(SessionStatus::Error),
            SessionStatus::Active if error_rate > self.warn_error_rate => {
                Some(SessionStatus::Degraded)
            }
            SessionStatus::Degraded if error_rate <= self.warn_error_rate => {
                Some(SessionStatus::Active)
            }
            _ => None,
        }
    }
}

pub struct HealthMonitor {
    registry: Arc<SessionRegistry>,
    events: Arc<StatusEventBus>,
    thresholds: HealthThresholds,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        events: Arc<StatusEventBus>,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            registry,
            events,
            thresholds,
        }
    }

    /// Evaluate every live session once. Returns the number of transitions.
    pub async fn check_once(&self) -> usize {
        let mut transitions = Vec::new();
        for session in self.registry.sessions() {
            let requests = session.request_count();
            if requests < self.thresholds.min_sample_size {
                continue;
            }
            let rate = session.error_rate();
            let previous = session.status();
            let Some(next) = self.thresholds.next_status(previous, rate) else {
                continue;
            };
            // Lost to a concurrent close or re-registration.
            if !session.transition(previous, next) {
                continue;
            }
            let key = session.key();
            match next {
                SessionStatus::Error => warn!(
                    tenant = %key.tenant_id,
                    plugin = %key.plugin_name,
                    error_rate = rate,
                    "Session marked as errored"
                ),
                _ => info!(
                    tenant = %key.tenant_id,
                    plugin = %key.plugin_name,
                    error_rate = rate,
                    from = %previous,
                    to = %next,
                    "Session health changed"
                ),
            }
            transitions.push(StatusEvent::new(
                &key.tenant_id,
                &key.plugin_name,
                previous,
                next,
                format!(
                    "error rate {:.2} over {} requests",
                    rate, requests
                ),
            ));
        }

        let count = transitions.len();
        for event in transitions {
            self.events.emit(event).await;
        }
        count
    }

    /// Run [`check_once`](Self::check_once) every `interval` until `shutdown` flips.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let transitions = self.check_once().await;
                        debug!(transitions, "Health check completed");
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Health monitor stopped");
        })
    }
}
