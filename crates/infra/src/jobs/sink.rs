//! Error reporting.

use std::sync::Mutex;

use serde::Serialize;
use tracing::error;

use geojobs_core::{GeocodingJobId, TenantId};

/// Where an error happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorContext {
    pub job_id: GeocodingJobId,
    pub tenant_id: TenantId,
    /// Short operation label, e.g. `"run.submit"` or `"cancel"`.
    pub operation: &'static str,
    pub backend: Option<String>,
}

impl ErrorContext {
    pub fn new(job_id: GeocodingJobId, tenant_id: TenantId, operation: &'static str) -> Self {
        Self {
            job_id,
            tenant_id,
            operation,
            backend: None,
        }
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }
}

/// Sink for errors the engine swallowed on behalf of its callers.
///
/// Fire-and-forget: implementations must not panic and cannot fail.
pub trait ErrorSink: Send + Sync + 'static {
    fn notify(&self, error: &(dyn std::error::Error + Send + Sync), context: &ErrorContext);
}

/// Reports through `tracing` at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn notify(&self, err: &(dyn std::error::Error + Send + Sync), context: &ErrorContext) {
        error!(
            job_id = %context.job_id,
            tenant_id = %context.tenant_id,
            operation = context.operation,
            backend = context.backend.as_deref().unwrap_or("-"),
            error = %err,
            "geocoding error"
        );
    }
}

/// A notification as captured by [`InMemoryErrorSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub message: String,
    pub context: ErrorContext,
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryErrorSink {
    inner: Mutex<Vec<Notification>>,
}

impl InMemoryErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Notification> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self) -> usize {
        self.all().len()
    }
}

impl ErrorSink for InMemoryErrorSink {
    fn notify(&self, err: &(dyn std::error::Error + Send + Sync), context: &ErrorContext) {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Notification {
                message: err.to_string(),
                context: context.clone(),
            });
    }
}
