//! Ordered teardown of the resources behind a session.
//!
//! A session is built from layered resources (event-stream reader, HTTP
//! session, protocol session). Each is recorded here as it is acquired and
//! released in reverse order. A failing closer is logged and skipped so the
//! remaining layers are still released.

use std::future::Future;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::McpError;

type Closer = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), McpError>> + Send>;

/// LIFO stack of labelled async closers.
#[derive(Default)]
pub struct ResourceStack {
    entries: Vec<(String, Closer)>,
}

impl ResourceStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resource together with the action that releases it.
    pub fn push<F, Fut>(&mut self, label: impl Into<String>, closer: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), McpError>> + Send + 'static,
    {
        self.entries
            .push((label.into(), Box::new(move || Box::pin(closer()))));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Labels in acquisition order.
    pub fn labels(&self) -> Vec<&str> {
        self.entries.iter().map(|(label, _)| label.as_str()).collect()
    }

    /// Release every resource, newest first. Returns how many closed cleanly.
    pub async fn close_all(&mut self) -> usize {
        let mut closed = 0;
        while let Some((label, closer)) = self.entries.pop() {
            match closer().await {
                Ok(()) => {
                    debug!(resource = %label, "Released resource");
                    closed += 1;
                }
                Err(e) => warn!(resource = %label, error = %e, "Failed to release resource"),
            }
        }
        closed
    }
}

impl Drop for ResourceStack {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            warn!(
                resources = ?self.labels(),
                "Resource stack dropped without being closed"
            );
        }
    }
}
