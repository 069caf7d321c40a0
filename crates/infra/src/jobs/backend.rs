//! Geocoding backends as seen by the runner.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use geojobs_geocoding::{BackendChoice, GeometryType, RemoteId, RowCounters};

/// What gets handed to a backend on submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub table_name: String,
    /// Compiled formatter expression.
    pub expression: String,
    /// Rows eligible for geocoding.
    pub rows: u64,
    /// Quota ceiling; `None` when the tenant has a soft limit.
    pub max_rows: Option<u64>,
    /// Set for the internal backend only.
    pub geometry_type: Option<GeometryType>,
}

/// Status of a remote job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("submission failed: {0}")]
    Submit(String),
    #[error("status poll failed: {0}")]
    Poll(String),
    #[error("cancellation failed: {0}")]
    Cancel(String),
    #[error("fetching results failed: {0}")]
    Results(String),
    /// No backend is registered for the requested choice.
    #[error("no {0} backend configured")]
    Unavailable(&'static str),
}

/// Capability set every geocoding engine has to offer.
///
/// Implementations may be HTTP clients, in-process matchers or test doubles;
/// the runner only ever talks to this trait.
#[async_trait]
pub trait GeocodingBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn submit(&self, request: SubmitRequest) -> Result<RemoteId, BackendError>;

    async fn status(&self, remote_id: &RemoteId) -> Result<RemoteStatus, BackendError>;

    /// `Ok(false)` means the backend refused to cancel.
    async fn cancel(&self, remote_id: &RemoteId) -> Result<bool, BackendError>;

    async fn fetch_results(&self, remote_id: &RemoteId) -> Result<RowCounters, BackendError>;
}

/// The two backend slots a deployment can fill.
///
/// Each slot holds one shared instance, so every job resolving to the same
/// choice gets the same backend object for as long as the registry lives.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    external: Option<Arc<dyn GeocodingBackend>>,
    internal: Option<Arc<dyn GeocodingBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_external(mut self, backend: Arc<dyn GeocodingBackend>) -> Self {
        self.external = Some(backend);
        self
    }

    pub fn with_internal(mut self, backend: Arc<dyn GeocodingBackend>) -> Self {
        self.internal = Some(backend);
        self
    }

    pub fn resolve(&self, choice: &BackendChoice) -> Result<Arc<dyn GeocodingBackend>, BackendError> {
        match choice {
            BackendChoice::External => self
                .external
                .clone()
                .ok_or(BackendError::Unavailable("external")),
            BackendChoice::Internal { .. } => self
                .internal
                .clone()
                .ok_or(BackendError::Unavailable("internal")),
        }
    }
}

impl core::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("external", &self.external.as_ref().map(|b| b.name().to_string()))
            .field("internal", &self.internal.as_ref().map(|b| b.name().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;

    #[test]
    fn resolves_by_choice_and_reuses_instances() {
        let external = ScriptedBackend::arc("external");
        let internal = ScriptedBackend::arc("internal");
        let registry = BackendRegistry::new()
            .with_external(external.clone())
            .with_internal(internal.clone());

        let polygon = BackendChoice::Internal {
            geometry_type: GeometryType::Polygon,
        };

        let first = registry.resolve(&polygon).unwrap();
        let second = registry.resolve(&polygon).unwrap();
        assert_eq!(first.name(), "internal");
        assert!(Arc::ptr_eq(&first, &second));

        assert_eq!(registry.resolve(&BackendChoice::External).unwrap().name(), "external");
    }

    #[test]
    fn missing_backend_is_unavailable() {
        let registry = BackendRegistry::new().with_internal(ScriptedBackend::arc("internal"));
        assert!(matches!(
            registry.resolve(&BackendChoice::External),
            Err(BackendError::Unavailable("external"))
        ));
    }
}
