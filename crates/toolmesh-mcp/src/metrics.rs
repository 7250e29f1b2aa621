//! Per-tool call metrics.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Counters for one fully-qualified tool name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolMetric {
    pub total_calls: u64,
    pub success_calls: u64,
    pub failed_calls: u64,
    pub total_duration: Duration,
    pub last_call: Option<DateTime<Utc>>,
}

impl ToolMetric {
    pub fn average_duration(&self) -> Duration {
        if self.total_calls == 0 {
            return Duration::ZERO;
        }
        self.total_duration / self.total_calls as u32
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.success_calls as f64 / self.total_calls as f64
    }
}

/// In-memory metric store; lives as long as the process.
#[derive(Debug, Default)]
pub struct MetricsStore {
    tools: Mutex<HashMap<String, ToolMetric>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, tool: &str, duration: Duration) {
        self.record(tool, duration, true);
    }

    pub fn record_failure(&self, tool: &str, duration: Duration) {
        self.record(tool, duration, false);
    }

    fn record(&self, tool: &str, duration: Duration, success: bool) {
        let mut tools = self.tools.lock();
        let metric = tools.entry(tool.to_string()).or_default();
        metric.total_calls += 1;
        if success {
            metric.success_calls += 1;
        } else {
            metric.failed_calls += 1;
        }
        metric.total_duration += duration;
        metric.last_call = Some(Utc::now());
    }

    pub fn get(&self, tool: &str) -> Option<ToolMetric> {
        self.tools.lock().get(tool).cloned()
    }

    /// Copy of all metrics, sorted by tool name.
    pub fn snapshot(&self) -> Vec<(String, ToolMetric)> {
        let mut all: Vec<_> = self
            .tools
            .lock()
            .iter()
            .map(|(name, metric)| (name.clone(), metric.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
