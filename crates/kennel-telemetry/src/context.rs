//! Request context for correlating work across components.

use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::Span;
use uuid::Uuid;

/// Correlation data for one logical request, such as a plugin call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique request identifier.
    pub request_id: Uuid,
    /// Request that spawned this one, if any.
    pub parent_id: Option<Uuid>,
    /// Component handling the request.
    pub component: String,
    /// Operation name within the component.
    pub operation: Option<String>,
    /// Wall-clock start time.
    pub started_at: DateTime<Utc>,
    started: Instant,
}

impl RequestContext {
    /// Create a new root context for `component`.
    #[must_use]
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            parent_id: None,
            component: component.into(),
            operation: None,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Set the operation name.
    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Create a child context for `component` sharing this request as parent.
    #[must_use]
    pub fn child(&self, component: impl Into<String>) -> Self {
        Self {
            parent_id: Some(self.request_id),
            ..Self::new(component)
        }
    }

    /// Time elapsed since the context was created.
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// A tracing span carrying the correlation fields.
    #[must_use]
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "request",
            request_id = %self.request_id,
            parent_id = ?self.parent_id,
            component = %self.component,
            operation = self.operation.as_deref().unwrap_or("-"),
        )
    }

    /// A guard that logs the request duration when dropped.
    #[must_use]
    pub fn guard(&self) -> RequestGuard {
        RequestGuard {
            request_id: self.request_id,
            component: self.component.clone(),
            started: self.started,
        }
    }
}

/// Logs the completion of a request on drop.
#[derive(Debug)]
pub struct RequestGuard {
    request_id: Uuid,
    component: String,
    started: Instant,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::debug!(
            request_id = %self.request_id,
            component = %self.component,
            elapsed_ms,
            "Request completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_links_parent() {
        let root = RequestContext::new("plugin_manager").with_operation("execute");
        let child = root.child("sandbox");

        assert_eq!(child.parent_id, Some(root.request_id));
        assert_ne!(child.request_id, root.request_id);
        assert_eq!(child.component, "sandbox");
        assert!(child.operation.is_none());
    }

    #[tokio::test]
    async fn test_elapsed_advances() {
        let ctx = RequestContext::new("test");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(ctx.elapsed() >= std::time::Duration::from_millis(5));
        drop(ctx.guard());
    }
}
