//! Job record storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use geojobs_core::{Entity, GeocodingJobId, TenantId};
use geojobs_geocoding::{GeocodingJob, JobState, QuotaPool};

/// Durable home of geocoding job records.
///
/// Records are never deleted: finished jobs stay around as the billing and
/// audit trail. Every state transition is written with
/// [`JobStore::update_if_state`] so a writer that lost a race (e.g. a poll
/// result arriving after a cancellation) cannot clobber the newer state.
pub trait JobStore: Send + Sync {
    /// Persist a freshly created record.
    fn insert(&self, job: GeocodingJob) -> Result<GeocodingJobId, JobStoreError>;

    fn get(&self, job_id: GeocodingJobId) -> Result<Option<GeocodingJob>, JobStoreError>;

    /// Tenant-checked lookup for callers acting on behalf of a tenant.
    fn get_for_tenant(
        &self,
        tenant_id: TenantId,
        job_id: GeocodingJobId,
    ) -> Result<Option<GeocodingJob>, JobStoreError>;

    /// Replace the stored record if its state is still `expected`.
    ///
    /// Returns `Ok(false)` (and writes nothing) when the stored record has
    /// moved on.
    fn update_if_state(&self, job: &GeocodingJob, expected: JobState) -> Result<bool, JobStoreError>;

    /// Jobs of a tenant, oldest first.
    fn list_for_tenant(
        &self,
        tenant_id: TenantId,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<GeocodingJob>, JobStoreError>;

    /// Rows attempted by the pool's non-cancelled billable jobs, except
    /// `excluding`.
    fn pool_usage(&self, pool: QuotaPool, excluding: Option<GeocodingJobId>) -> Result<u64, JobStoreError>;

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("geocoding job not found: {0}")]
    NotFound(GeocodingJobId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("geocoding job already exists: {0}")]
    AlreadyExists(GeocodingJobId),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub used_credits: u64,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<GeocodingJobId, GeocodingJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<GeocodingJobId, GeocodingJob>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<GeocodingJobId, GeocodingJob>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".to_string()))
    }
}

fn in_pool(job: &GeocodingJob, pool: QuotaPool) -> bool {
    match pool {
        QuotaPool::Tenant(tenant_id) => job.organization_id().is_none() && job.tenant_id() == tenant_id,
        QuotaPool::Organization(org_id) => job.organization_id() == Some(org_id),
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: GeocodingJob) -> Result<GeocodingJobId, JobStoreError> {
        let mut jobs = self.write()?;
        let id = *job.id();
        if jobs.contains_key(&id) {
            return Err(JobStoreError::AlreadyExists(id));
        }
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: GeocodingJobId) -> Result<Option<GeocodingJob>, JobStoreError> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    fn get_for_tenant(
        &self,
        tenant_id: TenantId,
        job_id: GeocodingJobId,
    ) -> Result<Option<GeocodingJob>, JobStoreError> {
        match self.read()?.get(&job_id) {
            Some(job) if job.tenant_id() == tenant_id => Ok(Some(job.clone())),
            Some(_) => Err(JobStoreError::TenantIsolation),
            None => Ok(None),
        }
    }

    fn update_if_state(&self, job: &GeocodingJob, expected: JobState) -> Result<bool, JobStoreError> {
        let mut jobs = self.write()?;
        let stored = jobs
            .get_mut(job.id())
            .ok_or(JobStoreError::NotFound(*job.id()))?;

        if stored.state() != expected {
            return Ok(false);
        }
        *stored = job.clone();
        Ok(true)
    }

    fn list_for_tenant(
        &self,
        tenant_id: TenantId,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<GeocodingJob>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.tenant_id() == tenant_id && state.map_or(true, |s| j.state() == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| j.created_at());
        result.truncate(limit);
        Ok(result)
    }

    fn pool_usage(&self, pool: QuotaPool, excluding: Option<GeocodingJobId>) -> Result<u64, JobStoreError> {
        let jobs = self.read()?;
        Ok(jobs
            .values()
            .filter(|j| Some(*j.id()) != excluding && j.counts_towards_usage() && in_pool(j, pool))
            .map(|j| j.attempted_rows())
            .sum())
    }

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();

        for job in jobs.values().filter(|j| j.tenant_id() == tenant_id) {
            match job.state() {
                JobState::Pending => stats.pending += 1,
                JobState::Submitted => stats.submitted += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Cancelled => stats.cancelled += 1,
            }
            stats.used_credits += job.used_credits();
        }

        Ok(stats)
    }
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn insert(&self, job: GeocodingJob) -> Result<GeocodingJobId, JobStoreError> {
        (**self).insert(job)
    }

    fn get(&self, job_id: GeocodingJobId) -> Result<Option<GeocodingJob>, JobStoreError> {
        (**self).get(job_id)
    }

    fn get_for_tenant(
        &self,
        tenant_id: TenantId,
        job_id: GeocodingJobId,
    ) -> Result<Option<GeocodingJob>, JobStoreError> {
        (**self).get_for_tenant(tenant_id, job_id)
    }

    fn update_if_state(&self, job: &GeocodingJob, expected: JobState) -> Result<bool, JobStoreError> {
        (**self).update_if_state(job, expected)
    }

    fn list_for_tenant(
        &self,
        tenant_id: TenantId,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<GeocodingJob>, JobStoreError> {
        (**self).list_for_tenant(tenant_id, state, limit)
    }

    fn pool_usage(&self, pool: QuotaPool, excluding: Option<GeocodingJobId>) -> Result<u64, JobStoreError> {
        (**self).pool_usage(pool, excluding)
    }

    fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        (**self).stats(tenant_id)
    }
}
