//! Idle session eviction.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::registry::SessionRegistry;

pub struct Cleaner {
    registry: Arc<SessionRegistry>,
    idle_ttl: Duration,
}

impl Cleaner {
    pub fn new(registry: Arc<SessionRegistry>, idle_ttl: Duration) -> Self {
        Self { registry, idle_ttl }
    }

    /// Close every session idle for longer than the TTL. Returns how many were closed.
    pub async fn sweep_once(&self) -> usize {
        let mut evicted = 0;
        for session in self.registry.sessions() {
            if session.idle_for() <= self.idle_ttl {
                continue;
            }
            // Re-checked under the tenant lock; a call may have touched it since.
            if self.registry.evict_if_idle(&session, self.idle_ttl).await {
                evicted += 1;
            }
        }
        evicted
    }

    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.sweep_once().await;
                        if evicted > 0 {
                            debug!(evicted, "Idle sweep completed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Cleaner stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ToolCatalog;
    use crate::events::{ChannelObserver, SessionStatus, StatusEventBus};
    use crate::protocol::McpToolDefinition;
    use crate::session::SessionKey;
    use crate::testing::{plugin, MockConnector};

    #[tokio::test]
    async fn test_sweep_evicts_only_idle_sessions() {
        let connector = MockConnector::new();
        let events = Arc::new(StatusEventBus::new());
        let catalog = Arc::new(ToolCatalog::new(Duration::from_secs(60)));
        let registry = Arc::new(SessionRegistry::new(
            connector.clone(),
            Arc::clone(&catalog),
            Arc::clone(&events),
        ));
        registry.register(plugin("t1", "notes")).await;
        registry.register(plugin("t1", "search")).await;
        let idle_key = SessionKey::new("t1", "notes");
        catalog.store(idle_key.clone(), vec![McpToolDefinition::new("list")]);

        let (observer, mut rx) = ChannelObserver::new();
        events.subscribe(Arc::new(observer));

        tokio::time::sleep(Duration::from_millis(60)).await;
        registry.get_session("t1", "search").unwrap();

        let cleaner = Cleaner::new(Arc::clone(&registry), Duration::from_millis(30));
        assert_eq!(cleaner.sweep_once().await, 1);

        assert!(registry.session(&idle_key).is_none());
        assert!(registry.session(&SessionKey::new("t1", "search")).is_some());
        assert!(catalog.get(&idle_key).is_none());
        assert_eq!(connector.released(), 1);
        // Eviction keeps the config so the session can be restored.
        assert!(registry.known_config("t1", "notes").is_some());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.plugin_name, "notes");
        assert_eq!(event.old_status, SessionStatus::Active);
        assert_eq!(event.new_status, SessionStatus::Inactive);
        assert_eq!(event.reason, "idle timeout");
    }
}
