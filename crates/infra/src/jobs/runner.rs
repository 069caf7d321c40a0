//! Geocoding job state machine.
//!
//! `run` drives one record from `pending` to a terminal state:
//!
//! ```text
//! pending ──submit──▶ submitted ──poll*──▶ completed
//!    │                    │
//!    └──────error─────────┴──error/timeout──▶ failed
//!    (any non-terminal) ──cancel──▶ cancelled
//! ```
//!
//! Every write is conditional on the state the runner last saw, so whoever
//! reaches a terminal state first wins and later writers are discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use geojobs_core::{DomainError, Entity, GeocodingJobId};
use geojobs_geocoding::{
    FailureReason, GeocodingJob, JobFailure, JobState, RemoteId, RowCounters,
};

use super::backend::{BackendError, BackendRegistry, GeocodingBackend, RemoteStatus, SubmitRequest};
use super::ledger::{CreditLedger, LedgerError};
use super::retry::CancelRetryPolicy;
use super::sink::{ErrorContext, ErrorSink};
use super::store::{JobStore, JobStoreError};
use super::table::TableRows;

/// Errors `run`/`cancel` hand back to their caller.
///
/// Backend trouble, timeouts and missing configuration are not in here: they
/// end up as a `failed` record plus an error-sink notification.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("geocoding job not found: {0}")]
    NotFound(GeocodingJobId),
    /// Another `run` of the same record is in flight.
    #[error("geocoding job {0} is already running")]
    AlreadyRunning(GeocodingJobId),
    #[error("geocoding job {job_id} cannot be run from state {state}")]
    InvalidState { job_id: GeocodingJobId, state: JobState },
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Why a run ended in `failed`. This is what the error sink receives.
#[derive(Debug, thiserror::Error)]
pub enum RunFailure {
    #[error("counting processable rows failed: {0}")]
    Rows(String),
    #[error("geocoding is not configured: {0}")]
    Uninitialized(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("backend reported the geocoding as failed")]
    BackendFailed,
    #[error("geocoding did not finish within {0:?}")]
    Timeout(Duration),
}

impl RunFailure {
    pub fn reason(&self) -> FailureReason {
        match self {
            RunFailure::Rows(_) => FailureReason::Rows,
            RunFailure::Uninitialized(_) => FailureReason::Uninitialized,
            RunFailure::Backend(BackendError::Submit(_)) => FailureReason::Submit,
            RunFailure::Backend(BackendError::Poll(_)) => FailureReason::Poll,
            RunFailure::Backend(BackendError::Results(_)) => FailureReason::Results,
            RunFailure::Backend(BackendError::Unavailable(_)) => FailureReason::Uninitialized,
            RunFailure::Backend(BackendError::Cancel(_)) => FailureReason::Poll,
            RunFailure::BackendFailed => FailureReason::BackendFailed,
            RunFailure::Timeout(_) => FailureReason::Timeout,
        }
    }
}

/// Result of [`JobRunner::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The record is now `cancelled`. `attempts` is 0 when no backend had to
    /// be contacted.
    Cancelled { attempts: u32 },
    /// Nothing to do: the job had already finished.
    AlreadyTerminal(JobState),
    /// The backend kept refusing; the record is unchanged.
    Failed { attempts: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    pub poll_interval: Duration,
    pub cancel_retry: CancelRetryPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            cancel_retry: CancelRetryPolicy::immediate(),
        }
    }
}

pub struct JobRunner<S: JobStore> {
    store: S,
    backends: BackendRegistry,
    rows: Arc<dyn TableRows>,
    ledger: Arc<CreditLedger<S>>,
    sink: Arc<dyn ErrorSink>,
    config: RunnerConfig,
    run_locks: Mutex<HashMap<GeocodingJobId, Arc<tokio::sync::Mutex<()>>>>,
    cancel_signals: Mutex<HashMap<GeocodingJobId, watch::Sender<bool>>>,
}

impl<S: JobStore + Clone> JobRunner<S> {
    pub fn new(
        store: S,
        backends: BackendRegistry,
        rows: Arc<dyn TableRows>,
        ledger: Arc<CreditLedger<S>>,
        sink: Arc<dyn ErrorSink>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            backends,
            rows,
            ledger,
            sink,
            config,
            run_locks: Mutex::new(HashMap::new()),
            cancel_signals: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<CreditLedger<S>> {
        &self.ledger
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Drive a record to a terminal state and return that state.
    ///
    /// A record already in a terminal state is returned untouched.
    pub async fn run(&self, job_id: GeocodingJobId) -> Result<JobState, RunError> {
        let mut lease = RunLease {
            locks: &self.run_locks,
            job_id,
            lock: self.run_lock(job_id),
            guard: None,
        };
        lease.guard = Some(
            lease
                .lock
                .clone()
                .try_lock_owned()
                .map_err(|_| RunError::AlreadyRunning(job_id))?,
        );

        let mut job = self.store.get(job_id)?.ok_or(RunError::NotFound(job_id))?;
        match job.state() {
            state if state.is_terminal() => return Ok(state),
            JobState::Submitted => {
                return Err(RunError::InvalidState {
                    job_id,
                    state: JobState::Submitted,
                })
            }
            _ => {}
        }

        let cancel_rx = self.register_cancel(job_id);
        let result = self.drive(&mut job, cancel_rx).await;
        self.unregister_cancel(job_id);
        result
    }

    /// Cancel a record, retrying the backend a bounded number of times.
    pub async fn cancel(&self, job_id: GeocodingJobId) -> Result<CancelOutcome, RunError> {
        loop {
            let job = self.store.get(job_id)?.ok_or(RunError::NotFound(job_id))?;
            if job.state().is_terminal() {
                return Ok(CancelOutcome::AlreadyTerminal(job.state()));
            }

            match job.remote_id().cloned() {
                Some(remote_id) => return self.cancel_remote(job, remote_id).await,
                // Never submitted: nothing to stop on the backend side. If a
                // run submits in the meantime the write below loses and the
                // next pass takes the remote path.
                None => {
                    if let Some(outcome) = self.try_cancel_locally(job, 0)? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    async fn cancel_remote(
        &self,
        job: GeocodingJob,
        remote_id: RemoteId,
    ) -> Result<CancelOutcome, RunError> {
        let job_id = *job.id();
        let ctx = ErrorContext::new(job_id, job.tenant_id(), "cancel");
        let backend = match self.backends.resolve(&job.backend()) {
            Ok(backend) => backend,
            Err(err) => {
                self.sink.notify(&err, &ctx);
                return Ok(CancelOutcome::Failed { attempts: 0 });
            }
        };
        let ctx = ctx.with_backend(backend.name());

        let policy = self.config.cancel_retry;
        let mut last_error = None;
        for attempt in 1..=policy.max_attempts() {
            match backend.cancel(&remote_id).await {
                Ok(true) => return self.mark_cancelled(job_id, attempt),
                Ok(false) => {
                    last_error = Some(BackendError::Cancel("backend refused to cancel".to_string()))
                }
                Err(err) => last_error = Some(err),
            }
            warn!(job_id = %job_id, attempt, "cancel attempt failed");

            let delay = policy.delay_after(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        if let Some(err) = last_error {
            self.sink.notify(&err, &ctx);
        }
        Ok(CancelOutcome::Failed {
            attempts: policy.max_attempts(),
        })
    }

    async fn drive(
        &self,
        job: &mut GeocodingJob,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<JobState, RunError> {
        let job_id = *job.id();
        let ctx = ErrorContext::new(job_id, job.tenant_id(), "run");

        let rows = match self.rows.processable_rows(job).await {
            Ok(rows) => rows,
            Err(err) => return self.fail(job, RunFailure::Rows(format!("{err:#}")), &ctx),
        };
        job.record_processable_rows(rows)?;
        if !self.store.update_if_state(job, JobState::Pending)? {
            return self.current_state(job_id);
        }

        if rows == 0 {
            debug!(job_id = %job_id, "nothing to geocode");
            return self.complete(job, RowCounters::default(), &ctx).await;
        }

        let backend = match self.backends.resolve(&job.backend()) {
            Ok(backend) => backend,
            Err(err) => return self.fail(job, RunFailure::Backend(err), &ctx),
        };
        let ctx = ctx.with_backend(backend.name());

        let max_rows = if job.kind().is_billable() {
            match self.ledger.max_geocodable_rows(job.tenant_id()) {
                Ok(max_rows) => max_rows,
                Err(LedgerError::Store(err)) => return Err(err.into()),
                Err(err) => return self.fail(job, RunFailure::Uninitialized(err.to_string()), &ctx),
            }
        } else {
            None
        };

        let request = SubmitRequest {
            table_name: job.table_name().to_string(),
            expression: job.formatter().compile(),
            rows,
            max_rows,
            geometry_type: job.geometry_type(),
        };
        let remote_id = match backend.submit(request).await {
            Ok(remote_id) => remote_id,
            Err(err) => return self.fail(job, RunFailure::Backend(err), &ctx),
        };

        job.mark_submitted(remote_id.clone())?;
        if !self.store.update_if_state(job, JobState::Pending)? {
            // Cancelled while the submission was in flight.
            warn!(job_id = %job_id, remote_id = %remote_id, "job left pending during submission; cancelling remote job");
            if let Err(err) = backend.cancel(&remote_id).await {
                debug!(job_id = %job_id, error = %err, "best-effort remote cancel failed");
            }
            return self.current_state(job_id);
        }
        info!(
            job_id = %job_id,
            tenant_id = %job.tenant_id(),
            backend = backend.name(),
            remote_id = %remote_id,
            rows,
            "geocoding submitted"
        );

        let run_timeout = job.run_timeout();
        let outcome = tokio::select! {
            waited = tokio::time::timeout(run_timeout, self.wait_for_backend(backend.as_ref(), &remote_id)) => {
                match waited {
                    Ok(outcome) => outcome,
                    Err(_elapsed) => Err(RunFailure::Timeout(run_timeout)),
                }
            }
            _ = cancelled(&mut cancel_rx) => {
                debug!(job_id = %job_id, "run interrupted by cancellation");
                return self.current_state(job_id);
            }
        };

        match outcome {
            Ok(counters) => self.complete(job, counters, &ctx).await,
            Err(failure) => self.fail(job, failure, &ctx),
        }
    }

    /// Poll until the backend is done, then fetch its counters.
    async fn wait_for_backend(
        &self,
        backend: &dyn GeocodingBackend,
        remote_id: &RemoteId,
    ) -> Result<RowCounters, RunFailure> {
        loop {
            match backend.status(remote_id).await? {
                RemoteStatus::Completed => return Ok(backend.fetch_results(remote_id).await?),
                RemoteStatus::Failed => return Err(RunFailure::BackendFailed),
                RemoteStatus::Pending => {
                    debug!(remote_id = %remote_id, "geocoding still running");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    async fn complete(
        &self,
        job: &mut GeocodingJob,
        counters: RowCounters,
        ctx: &ErrorContext,
    ) -> Result<JobState, RunError> {
        match self.ledger.finalize(job, counters).await {
            Ok(true) => {
                info!(
                    job_id = %job.id(),
                    processed_rows = counters.processed_rows,
                    cache_hits = counters.cache_hits,
                    real_rows = counters.real_rows,
                    "geocoding completed"
                );
                Ok(JobState::Completed)
            }
            Ok(false) => self.current_state(*job.id()),
            Err(LedgerError::Store(err)) => Err(err.into()),
            Err(LedgerError::Domain(err)) => Err(err.into()),
            Err(err @ LedgerError::Uninitialized(_)) => {
                self.fail(job, RunFailure::Uninitialized(err.to_string()), ctx)
            }
        }
    }

    fn fail(
        &self,
        job: &mut GeocodingJob,
        failure: RunFailure,
        ctx: &ErrorContext,
    ) -> Result<JobState, RunError> {
        let expected = job.state();
        match &failure {
            RunFailure::Timeout(after) => {
                warn!(job_id = %job.id(), timeout = ?after, "geocoding timed out")
            }
            other => warn!(job_id = %job.id(), error = %other, "geocoding failed"),
        }

        job.mark_failed(JobFailure::new(failure.reason(), failure.to_string()))?;
        if self.store.update_if_state(job, expected)? {
            self.sink.notify(&failure, ctx);
            Ok(JobState::Failed)
        } else {
            self.current_state(*job.id())
        }
    }

    /// Record the cancellation once the backend has stopped the remote job.
    fn mark_cancelled(&self, job_id: GeocodingJobId, attempts: u32) -> Result<CancelOutcome, RunError> {
        loop {
            let job = self.store.get(job_id)?.ok_or(RunError::NotFound(job_id))?;
            if job.state().is_terminal() {
                return Ok(CancelOutcome::AlreadyTerminal(job.state()));
            }
            if let Some(outcome) = self.try_cancel_locally(job, attempts)? {
                return Ok(outcome);
            }
        }
    }

    /// `None` when the stored record moved on before the write.
    fn try_cancel_locally(
        &self,
        mut job: GeocodingJob,
        attempts: u32,
    ) -> Result<Option<CancelOutcome>, RunError> {
        let job_id = *job.id();
        let state = job.state();
        job.mark_cancelled()?;
        if !self.store.update_if_state(&job, state)? {
            return Ok(None);
        }
        self.signal_cancel(job_id);
        info!(job_id = %job_id, attempts, "geocoding cancelled");
        Ok(Some(CancelOutcome::Cancelled { attempts }))
    }

    fn current_state(&self, job_id: GeocodingJobId) -> Result<JobState, RunError> {
        self.store
            .get(job_id)?
            .map(|job| job.state())
            .ok_or(RunError::NotFound(job_id))
    }

    #[cfg(test)]
    fn tracked_runs(&self) -> usize {
        self.run_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn run_lock(&self, job_id: GeocodingJobId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .run_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(job_id).or_default().clone()
    }

    fn register_cancel(&self, job_id: GeocodingJobId) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.cancel_signals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(job_id, tx);
        rx
    }

    fn unregister_cancel(&self, job_id: GeocodingJobId) {
        self.cancel_signals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&job_id);
    }

    fn signal_cancel(&self, job_id: GeocodingJobId) {
        let signals = self
            .cancel_signals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tx) = signals.get(&job_id) {
            let _ = tx.send(true);
        }
    }
}

/// Exclusive right to run one record.
///
/// Dropping it releases the record's lock and forgets the lock entirely once
/// nobody else holds it.
struct RunLease<'a> {
    locks: &'a Mutex<HashMap<GeocodingJobId, Arc<tokio::sync::Mutex<()>>>>,
    job_id: GeocodingJobId,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for RunLease<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Only the map and this lease are left.
        let idle = locks
            .get(&self.job_id)
            .is_some_and(|lock| Arc::ptr_eq(lock, &self.lock))
            && Arc::strong_count(&self.lock) == 2;
        if idle {
            locks.remove(&self.job_id);
        }
    }
}

/// Resolves once the cancel flag is raised; never resolves if the sender is
/// gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}
