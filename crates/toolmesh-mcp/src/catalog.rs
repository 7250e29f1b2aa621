//! Tool-list cache.
//!
//! Keeps the last `tools/list` answer per (tenant, plugin) for a fixed TTL so
//! that prompt assembly does not hit the plugin server on every turn.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::protocol::McpToolDefinition;
use crate::session::SessionKey;

struct CacheEntry {
    tools: Vec<McpToolDefinition>,
    expires_at: Instant,
    hits: u64,
}

/// Cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    /// Entries still within their TTL.
    pub live_entries: usize,
    /// Entries past their TTL that have not been evicted yet.
    pub expired_entries: usize,
    /// Hits served across live entries.
    pub hits: u64,
}

pub struct ToolCatalog {
    ttl: Duration,
    entries: Mutex<HashMap<SessionKey, CacheEntry>>,
}

impl ToolCatalog {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached tools for the key, if present and unexpired. Counts a hit.
    pub fn get(&self, key: &SessionKey) -> Option<Vec<McpToolDefinition>> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.hits += 1;
                Some(entry.tools.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a freshly fetched list, replacing any previous entry.
    pub fn store(&self, key: SessionKey, tools: Vec<McpToolDefinition>) {
        let entry = CacheEntry {
            tools,
            expires_at: Instant::now() + self.ttl,
            hits: 0,
        };
        self.entries.lock().insert(key, entry);
    }

    pub fn invalidate(&self, key: &SessionKey) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Hit count of the current entry for the key.
    pub fn hits(&self, key: &SessionKey) -> Option<u64> {
        self.entries.lock().get(key).map(|entry| entry.hits)
    }

    pub fn stats(&self) -> CatalogStats {
        let now = Instant::now();
        let entries = self.entries.lock();
        let mut stats = CatalogStats::default();
        for entry in entries.values() {
            if entry.expires_at > now {
                stats.live_entries += 1;
                stats.hits += entry.hits;
            } else {
                stats.expired_entries += 1;
            }
        }
        stats
    }
}
