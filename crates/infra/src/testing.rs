//! Fixtures shared by the unit and integration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use geojobs_core::{OrganizationId, TenantId};
use geojobs_geocoding::{
    GeocodingJob, GeocodingKind, GeometryType, NewGeocodingJob, Pricing, QuotaAccount, QuotaLimit,
    RemoteId, RowCounters,
};

use crate::jobs::backend::{BackendError, GeocodingBackend, RemoteStatus, SubmitRequest};

pub fn pending_job(tenant_id: TenantId) -> GeocodingJob {
    pending_job_on(tenant_id, "addresses")
}

pub fn pending_job_on(tenant_id: TenantId, table_name: &str) -> GeocodingJob {
    GeocodingJob::create(NewGeocodingJob::new(tenant_id, table_name, "{street}, {city}"))
        .expect("valid job")
}

pub fn submitted_job(tenant_id: TenantId) -> GeocodingJob {
    let mut job = pending_job(tenant_id);
    job.record_processable_rows(100).expect("pending");
    job.mark_submitted(RemoteId::new("remote-1")).expect("pending");
    job
}

/// A completed, unbilled job with the given counters.
pub fn completed_job(
    tenant_id: TenantId,
    organization_id: Option<OrganizationId>,
    kind: GeocodingKind,
    processed_rows: u64,
    cache_hits: u64,
) -> GeocodingJob {
    let mut new = NewGeocodingJob::new(tenant_id, "addresses", "{address}").with_kind(kind);
    if !kind.is_billable() {
        new = new.with_geometry_type(GeometryType::Point);
    }
    if let Some(org) = organization_id {
        new = new.with_organization(org);
    }
    let mut job = GeocodingJob::create(new).expect("valid job");
    job.mark_completed(
        RowCounters {
            processed_rows,
            cache_hits,
            real_rows: processed_rows + cache_hits,
        },
        0,
    )
    .expect("pending");
    job
}

/// Hard-limited account billed 1500 per 1000 rows.
pub fn hard_account(tenant_id: TenantId, quota: u64) -> QuotaAccount {
    QuotaAccount {
        tenant_id,
        quota,
        limit: QuotaLimit::Hard,
        pricing: Pricing::new(1500, 1000).expect("non-zero block size"),
        organization: None,
    }
}

/// Backend double whose answers are queued up front.
///
/// Queues fall back to their defaults once drained: status `completed`,
/// cancel accepted, results all zero.
pub struct ScriptedBackend {
    name: String,
    submit_error: Mutex<Option<BackendError>>,
    statuses: Mutex<VecDeque<Result<RemoteStatus, BackendError>>>,
    default_status: Mutex<RemoteStatus>,
    results: Mutex<Result<RowCounters, BackendError>>,
    cancels: Mutex<VecDeque<Result<bool, BackendError>>>,
    default_cancel: Mutex<bool>,
    submit_delay: Mutex<Duration>,
    requests: Mutex<Vec<SubmitRequest>>,
    status_calls: AtomicU32,
    cancel_calls: AtomicU32,
}

impl ScriptedBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            submit_error: Mutex::new(None),
            statuses: Mutex::new(VecDeque::new()),
            default_status: Mutex::new(RemoteStatus::Completed),
            results: Mutex::new(Ok(RowCounters::default())),
            cancels: Mutex::new(VecDeque::new()),
            default_cancel: Mutex::new(true),
            submit_delay: Mutex::new(Duration::ZERO),
            requests: Mutex::new(Vec::new()),
            status_calls: AtomicU32::new(0),
            cancel_calls: AtomicU32::new(0),
        }
    }

    pub fn arc(name: &str) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    pub fn fail_submit(&self, err: BackendError) {
        *self.submit_error.lock().unwrap() = Some(err);
    }

    pub fn delay_submit(&self, delay: Duration) {
        *self.submit_delay.lock().unwrap() = delay;
    }

    pub fn push_status(&self, status: Result<RemoteStatus, BackendError>) {
        self.statuses.lock().unwrap().push_back(status);
    }

    /// Answer every unscripted poll with `status`.
    pub fn always(&self, status: RemoteStatus) {
        *self.default_status.lock().unwrap() = status;
    }

    pub fn set_results(&self, results: Result<RowCounters, BackendError>) {
        *self.results.lock().unwrap() = results;
    }

    pub fn push_cancel(&self, answer: Result<bool, BackendError>) {
        self.cancels.lock().unwrap().push_back(answer);
    }

    pub fn refuse_cancels(&self) {
        *self.default_cancel.lock().unwrap() = false;
    }

    pub fn submits(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<SubmitRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> u32 {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> u32 {
        self.submits() as u32 + self.status_calls() + self.cancel_calls()
    }
}

#[async_trait]
impl GeocodingBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, request: SubmitRequest) -> Result<RemoteId, BackendError> {
        let index = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request);
            requests.len()
        };
        let delay = *self.submit_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.submit_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(RemoteId::new(format!("{}-{index}", self.name))),
        }
    }

    async fn status(&self, _remote_id: &RemoteId) -> Result<RemoteStatus, BackendError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.statuses.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(*self.default_status.lock().unwrap()))
    }

    async fn cancel(&self, _remote_id: &RemoteId) -> Result<bool, BackendError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.cancels.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(*self.default_cancel.lock().unwrap()))
    }

    async fn fetch_results(&self, _remote_id: &RemoteId) -> Result<RowCounters, BackendError> {
        self.results.lock().unwrap().clone()
    }
}
