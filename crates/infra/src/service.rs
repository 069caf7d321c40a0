//! Entry point used by the application layer.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use geojobs_core::{DomainError, Entity, GeocodingJobId, TenantId};
use geojobs_geocoding::{GeocodingJob, JobState, NewGeocodingJob};

use crate::config::EngineConfig;
use crate::jobs::{
    AccountDirectory, BackendRegistry, CancelOutcome, CreditLedger, ErrorSink, ExecutorStats,
    JobExecutor, JobRunner, JobStats, JobStore, JobStoreError, LedgerError, RunError, TableRows,
};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("geocoding job not found: {0}")]
    NotFound(GeocodingJobId),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Run(#[from] RunError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Geocoding jobs for a deployment: creation, runs, cancellation, billing.
pub struct GeocodingService<S: JobStore> {
    store: S,
    config: EngineConfig,
    runner: Arc<JobRunner<S>>,
    executor: JobExecutor<S>,
}

impl<S: JobStore + Clone + 'static> GeocodingService<S> {
    pub fn new(
        store: S,
        backends: BackendRegistry,
        rows: Arc<dyn TableRows>,
        accounts: Arc<dyn AccountDirectory>,
        sink: Arc<dyn ErrorSink>,
        config: EngineConfig,
    ) -> Self {
        let ledger = Arc::new(CreditLedger::new(store.clone(), accounts));
        let runner = Arc::new(JobRunner::new(
            store.clone(),
            backends,
            rows,
            ledger,
            sink,
            config.runner_config(),
        ));
        let executor = JobExecutor::new(runner.clone(), config.executor_config());
        Self {
            store,
            config,
            runner,
            executor,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate and persist a new `pending` job.
    ///
    /// Members of an organization are charged against the organization's
    /// pool, so the organization is taken from the tenant's account.
    pub fn create_job(&self, mut new: NewGeocodingJob) -> ServiceResult<GeocodingJob> {
        match self.runner.ledger().account(new.tenant_id) {
            Ok(account) => {
                let org = account.organization.map(|org| org.id);
                match (new.organization_id, org) {
                    (Some(requested), Some(actual)) if requested != actual => {
                        return Err(DomainError::validation(
                            "organization_id",
                            "does not match the tenant's organization",
                        )
                        .into());
                    }
                    (Some(_), None) => {
                        return Err(DomainError::validation(
                            "organization_id",
                            "tenant is not an organization member",
                        )
                        .into());
                    }
                    _ => new.organization_id = org,
                }
            }
            // Surfaces as a failed run for billable kinds.
            Err(LedgerError::Uninitialized(tenant_id)) => {
                debug!(tenant_id = %tenant_id, "creating job for tenant without quota account")
            }
            Err(err) => return Err(err.into()),
        }
        if new.run_timeout.is_none() {
            new.run_timeout = Some(self.config.run_timeout);
        }

        let job = GeocodingJob::create(new)?;
        self.store.insert(job.clone())?;
        info!(
            job_id = %job.id(),
            tenant_id = %job.tenant_id(),
            kind = %job.kind(),
            table = job.table_name(),
            "geocoding job created"
        );
        Ok(job)
    }

    /// Run inline until the job reaches a terminal state.
    pub async fn run(&self, job_id: GeocodingJobId) -> ServiceResult<JobState> {
        Ok(self.runner.run(job_id).await?)
    }

    /// Run on a background task. Must be called from within a tokio runtime.
    pub fn spawn_run(&self, job_id: GeocodingJobId) -> JoinHandle<Result<JobState, RunError>> {
        self.executor.spawn_run(job_id)
    }

    pub async fn cancel(&self, job_id: GeocodingJobId) -> ServiceResult<CancelOutcome> {
        Ok(self.runner.cancel(job_id).await?)
    }

    /// `None` when the tenant's limit is soft.
    pub fn max_geocodable_rows(&self, tenant_id: TenantId) -> ServiceResult<Option<u64>> {
        Ok(self.runner.ledger().max_geocodable_rows(tenant_id)?)
    }

    pub fn price(&self, job_id: GeocodingJobId) -> ServiceResult<f64> {
        let job = self.get(job_id)?;
        Ok(self.runner.ledger().price(&job)?)
    }

    pub fn get(&self, job_id: GeocodingJobId) -> ServiceResult<GeocodingJob> {
        self.store.get(job_id)?.ok_or(ServiceError::NotFound(job_id))
    }

    pub fn list(
        &self,
        tenant_id: TenantId,
        state: Option<JobState>,
        limit: usize,
    ) -> ServiceResult<Vec<GeocodingJob>> {
        Ok(self.store.list_for_tenant(tenant_id, state, limit)?)
    }

    pub fn stats(&self, tenant_id: TenantId) -> ServiceResult<JobStats> {
        Ok(self.store.stats(tenant_id)?)
    }

    pub fn executor_stats(&self) -> ExecutorStats {
        self.executor.stats()
    }
}
