//! Credit ledger: quota lookups and race-free credit finalization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info};

use geojobs_core::{DomainError, Entity, TenantId};
use geojobs_geocoding::{quota, GeocodingJob, QuotaAccount, QuotaPool, RowCounters};

use super::store::{JobStore, JobStoreError};

/// Source of tenants' quota settings.
pub trait AccountDirectory: Send + Sync {
    fn account(&self, tenant_id: TenantId) -> Result<QuotaAccount, LedgerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The tenant has no quota account configured yet.
    #[error("quota not initialized for tenant {0}")]
    Uninitialized(TenantId),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// In-memory account directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAccountDirectory {
    accounts: RwLock<HashMap<TenantId, QuotaAccount>>,
}

impl InMemoryAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, account: QuotaAccount) {
        self.accounts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(account.tenant_id, account);
    }
}

impl AccountDirectory for InMemoryAccountDirectory {
    fn account(&self, tenant_id: TenantId) -> Result<QuotaAccount, LedgerError> {
        self.accounts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&tenant_id)
            .cloned()
            .ok_or(LedgerError::Uninitialized(tenant_id))
    }
}

/// Pool a stored job is charged against.
pub fn pool_of(job: &GeocodingJob) -> QuotaPool {
    match job.organization_id() {
        Some(org) => QuotaPool::Organization(org),
        None => QuotaPool::Tenant(job.tenant_id()),
    }
}

/// Computes quotas, credits and prices against the job store.
///
/// Credits of a job depend on what the rest of its pool already consumed, so
/// two jobs of one pool finishing at the same time must not both read the
/// same prior usage. [`CreditLedger::finalize`] therefore holds a per-pool
/// lock from reading the usage until the completed record is written.
pub struct CreditLedger<S: JobStore> {
    store: S,
    accounts: Arc<dyn AccountDirectory>,
    pools: Mutex<HashMap<QuotaPool, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S: JobStore> CreditLedger<S> {
    pub fn new(store: S, accounts: Arc<dyn AccountDirectory>) -> Self {
        Self {
            store,
            accounts,
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn account(&self, tenant_id: TenantId) -> Result<QuotaAccount, LedgerError> {
        self.accounts.account(tenant_id)
    }

    /// `None` means the tenant may geocode without a ceiling (soft limit).
    pub fn max_geocodable_rows(&self, tenant_id: TenantId) -> Result<Option<u64>, LedgerError> {
        let account = self.accounts.account(tenant_id)?;
        let usage = self.store.pool_usage(account.pool(), None)?;
        Ok(account.max_geocodable_rows(usage))
    }

    /// Credits `job` would be billed for its current counters, given what
    /// the rest of its pool consumed.
    pub fn calculate_used_credits(&self, job: &GeocodingJob) -> Result<u64, LedgerError> {
        self.credits_for(job, job.counters())
    }

    pub fn price(&self, job: &GeocodingJob) -> Result<f64, LedgerError> {
        let account = self.accounts.account(job.tenant_id())?;
        Ok(quota::price(job.used_credits(), &account.pricing))
    }

    /// Complete `job` with `counters`, billing it under the pool lock.
    ///
    /// Returns `Ok(false)` when the stored record left the state `job` was
    /// in (e.g. it was cancelled meanwhile); nothing is written then.
    pub async fn finalize(&self, job: &mut GeocodingJob, counters: RowCounters) -> Result<bool, LedgerError> {
        let pool = pool_of(job);
        let lock = self.pool_lock(pool);
        let _guard = lock.lock().await;

        let expected = job.state();
        let credits = self.credits_for(job, counters)?;
        job.mark_completed(counters, credits)?;

        let applied = self.store.update_if_state(job, expected)?;
        if applied {
            info!(
                job_id = %job.id(),
                pool = %pool,
                attempted = counters.attempted(),
                used_credits = credits,
                "geocoding credits finalized"
            );
        } else {
            debug!(job_id = %job.id(), "record moved on before finalization; discarding results");
        }
        Ok(applied)
    }

    fn credits_for(&self, job: &GeocodingJob, counters: RowCounters) -> Result<u64, LedgerError> {
        if !job.kind().is_billable() || counters.attempted() == 0 {
            return Ok(0);
        }
        let account = self.accounts.account(job.tenant_id())?;
        let prior = self.store.pool_usage(pool_of(job), Some(*job.id()))?;
        Ok(quota::calculate_used_credits(
            job.kind(),
            counters.attempted(),
            prior,
            account.effective_quota(),
        ))
    }

    fn pool_lock(&self, pool: QuotaPool) -> Arc<tokio::sync::Mutex<()>> {
        let mut pools = self
            .pools
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pools.entry(pool).or_default().clone()
    }
}
