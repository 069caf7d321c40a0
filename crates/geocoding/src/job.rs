//! The geocoding job record and its state machine.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use geojobs_core::{DomainError, DomainResult, Entity, GeocodingJobId, OrganizationId, TenantId};

use crate::backend::BackendChoice;
use crate::formatter::Formatter;

/// How long a job may stay unfinished after submission before it is failed.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Geocoding mode. Decides the backend and whether the job is billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeocodingKind {
    /// Street-level geocoding through the external provider. Billable.
    #[serde(rename = "high-resolution")]
    HighResolution,
    /// Country boundaries.
    #[serde(rename = "admin0")]
    Admin0,
    /// First-level administrative regions.
    #[serde(rename = "admin1")]
    Admin1,
    #[serde(rename = "namedplace")]
    Namedplace,
    #[serde(rename = "postalcode")]
    Postalcode,
    #[serde(rename = "ipaddress")]
    Ipaddress,
}

impl GeocodingKind {
    pub const ALL: [GeocodingKind; 6] = [
        GeocodingKind::HighResolution,
        GeocodingKind::Admin0,
        GeocodingKind::Admin1,
        GeocodingKind::Namedplace,
        GeocodingKind::Postalcode,
        GeocodingKind::Ipaddress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GeocodingKind::HighResolution => "high-resolution",
            GeocodingKind::Admin0 => "admin0",
            GeocodingKind::Admin1 => "admin1",
            GeocodingKind::Namedplace => "namedplace",
            GeocodingKind::Postalcode => "postalcode",
            GeocodingKind::Ipaddress => "ipaddress",
        }
    }

    pub fn is_billable(&self) -> bool {
        matches!(self, GeocodingKind::HighResolution)
    }
}

impl core::fmt::Display for GeocodingKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GeocodingKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GeocodingKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DomainError::validation("kind", format!("{s:?} is not in range or set")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometryType {
    Point,
    Polygon,
}

impl FromStr for GeometryType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "point" => Ok(GeometryType::Point),
            "polygon" => Ok(GeometryType::Polygon),
            other => Err(DomainError::validation(
                "geometry_type",
                format!("{other:?} is not in range or set"),
            )),
        }
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Submitted,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Submitted => "submitted",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-assigned job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for RemoteId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a job ended up `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Stored template no longer compiles.
    Validation,
    /// No backend or quota account was available to run the job.
    Uninitialized,
    /// The table row provider could not count processable rows.
    Rows,
    Submit,
    Poll,
    /// The backend itself reported the job as failed.
    BackendFailed,
    Results,
    /// `run_timeout` elapsed before the backend finished.
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub reason: FailureReason,
    pub message: String,
}

impl JobFailure {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// Counters reported by a backend once a job is done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCounters {
    /// Rows geocoded by the backend itself.
    pub processed_rows: u64,
    /// Rows answered from the geocoding cache.
    pub cache_hits: u64,
    /// Rows that came back with a usable geometry.
    pub real_rows: u64,
}

impl RowCounters {
    pub fn attempted(&self) -> u64 {
        self.processed_rows.saturating_add(self.cache_hits)
    }
}

/// Input of [`GeocodingJob::create`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGeocodingJob {
    pub tenant_id: TenantId,
    pub organization_id: Option<OrganizationId>,
    pub table_name: String,
    pub kind: GeocodingKind,
    pub geometry_type: Option<GeometryType>,
    pub formatter: String,
    pub run_timeout: Option<Duration>,
}

impl NewGeocodingJob {
    pub fn new(tenant_id: TenantId, table_name: impl Into<String>, formatter: impl Into<String>) -> Self {
        Self {
            tenant_id,
            organization_id: None,
            table_name: table_name.into(),
            kind: GeocodingKind::HighResolution,
            geometry_type: None,
            formatter: formatter.into(),
            run_timeout: None,
        }
    }

    pub fn with_kind(mut self, kind: GeocodingKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_geometry_type(mut self, geometry_type: GeometryType) -> Self {
        self.geometry_type = Some(geometry_type);
        self
    }

    pub fn with_organization(mut self, organization_id: OrganizationId) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = Some(run_timeout);
        self
    }
}

/// A geocoding job and its accounting fields.
///
/// Fields are only changed through the `mark_*` transitions, each of which
/// bumps `updated_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodingJob {
    id: GeocodingJobId,
    tenant_id: TenantId,
    organization_id: Option<OrganizationId>,
    table_name: String,
    kind: GeocodingKind,
    geometry_type: Option<GeometryType>,
    backend: BackendChoice,
    formatter: Formatter,
    state: JobState,
    processable_rows: u64,
    counters: RowCounters,
    used_credits: u64,
    #[serde(with = "duration_secs")]
    run_timeout: Duration,
    remote_id: Option<RemoteId>,
    failure: Option<JobFailure>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    submitted_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Entity for GeocodingJob {
    type Id = GeocodingJobId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl GeocodingJob {
    /// Validate `new` and build a `pending` record.
    ///
    /// The backend is chosen here, once, so a record never switches backends
    /// during its life.
    pub fn create(new: NewGeocodingJob) -> DomainResult<Self> {
        let formatter = Formatter::parse(&new.formatter)?;
        let backend = BackendChoice::for_kind(new.kind, new.geometry_type)?;

        let run_timeout = new.run_timeout.unwrap_or(DEFAULT_RUN_TIMEOUT);
        if run_timeout.is_zero() {
            return Err(DomainError::validation("run_timeout", "must be greater than 0"));
        }

        let now = Utc::now();
        Ok(Self {
            id: GeocodingJobId::new(),
            tenant_id: new.tenant_id,
            organization_id: new.organization_id,
            table_name: new.table_name,
            kind: new.kind,
            geometry_type: new.geometry_type,
            backend,
            formatter,
            state: JobState::Pending,
            processable_rows: 0,
            counters: RowCounters::default(),
            used_credits: 0,
            run_timeout,
            remote_id: None,
            failure: None,
            created_at: now,
            updated_at: now,
            submitted_at: None,
            finished_at: None,
        })
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn organization_id(&self) -> Option<OrganizationId> {
        self.organization_id
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn kind(&self) -> GeocodingKind {
        self.kind
    }

    pub fn geometry_type(&self) -> Option<GeometryType> {
        self.geometry_type
    }

    pub fn backend(&self) -> BackendChoice {
        self.backend
    }

    pub fn formatter(&self) -> &Formatter {
        &self.formatter
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn processable_rows(&self) -> u64 {
        self.processable_rows
    }

    pub fn counters(&self) -> RowCounters {
        self.counters
    }

    pub fn processed_rows(&self) -> u64 {
        self.counters.processed_rows
    }

    pub fn cache_hits(&self) -> u64 {
        self.counters.cache_hits
    }

    pub fn real_rows(&self) -> u64 {
        self.counters.real_rows
    }

    /// Rows the backend attempted, fresh or cached.
    pub fn attempted_rows(&self) -> u64 {
        self.counters.attempted()
    }

    /// Processable rows that did not come back with a geometry.
    pub fn failed_rows(&self) -> u64 {
        self.processable_rows.saturating_sub(self.counters.real_rows)
    }

    pub fn successful_rows(&self) -> u64 {
        self.counters.real_rows
    }

    pub fn used_credits(&self) -> u64 {
        self.used_credits
    }

    pub fn run_timeout(&self) -> Duration {
        self.run_timeout
    }

    pub fn remote_id(&self) -> Option<&RemoteId> {
        self.remote_id.as_ref()
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        self.failure.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Whether this job counts towards its pool's quota usage.
    pub fn counts_towards_usage(&self) -> bool {
        self.kind.is_billable() && self.state != JobState::Cancelled
    }

    /// Record how many rows the table currently offers for geocoding.
    pub fn record_processable_rows(&mut self, rows: u64) -> DomainResult<()> {
        self.ensure_state(&[JobState::Pending], "record processable rows")?;
        self.processable_rows = rows;
        self.touch();
        Ok(())
    }

    pub fn mark_submitted(&mut self, remote_id: RemoteId) -> DomainResult<()> {
        self.ensure_state(&[JobState::Pending], "submit")?;
        self.state = JobState::Submitted;
        self.remote_id = Some(remote_id);
        self.touch();
        self.submitted_at = Some(self.updated_at);
        Ok(())
    }

    /// Finish the job with the backend's counters and the credits the ledger
    /// computed for them.
    pub fn mark_completed(&mut self, counters: RowCounters, used_credits: u64) -> DomainResult<()> {
        self.ensure_state(&[JobState::Pending, JobState::Submitted], "complete")?;
        if !self.kind.is_billable() && used_credits > 0 {
            return Err(DomainError::invariant(format!(
                "{} jobs are never billed",
                self.kind
            )));
        }
        self.state = JobState::Completed;
        self.counters = counters;
        self.used_credits = used_credits;
        self.finish();
        Ok(())
    }

    pub fn mark_failed(&mut self, failure: JobFailure) -> DomainResult<()> {
        self.ensure_state(&[JobState::Pending, JobState::Submitted], "fail")?;
        self.state = JobState::Failed;
        self.failure = Some(failure);
        self.finish();
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> DomainResult<()> {
        self.ensure_state(&[JobState::Pending, JobState::Submitted], "cancel")?;
        self.state = JobState::Cancelled;
        self.finish();
        Ok(())
    }

    /// Bump `updated_at`, keeping it strictly increasing.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + chrono::Duration::microseconds(1)
        };
    }

    fn finish(&mut self) {
        self.touch();
        self.finished_at = Some(self.updated_at);
    }

    fn ensure_state(&self, allowed: &[JobState], action: &str) -> DomainResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(DomainError::invariant(format!(
                "cannot {action} a {} job",
                self.state
            )))
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job() -> NewGeocodingJob {
        NewGeocodingJob::new(TenantId::new(), "addresses", "{street}, {city}")
    }

    fn completed(processed: u64, cache_hits: u64, real_rows: u64, processable: u64) -> GeocodingJob {
        let mut job = GeocodingJob::create(new_job()).unwrap();
        job.record_processable_rows(processable).unwrap();
        job.mark_submitted(RemoteId::new("remote-1")).unwrap();
        job.mark_completed(
            RowCounters {
                processed_rows: processed,
                cache_hits,
                real_rows,
            },
            0,
        )
        .unwrap();
        job
    }

    #[test]
    fn create_sets_defaults() {
        let job = GeocodingJob::create(new_job()).unwrap();
        assert_eq!(job.state(), JobState::Pending);
        assert_eq!(job.kind(), GeocodingKind::HighResolution);
        assert_eq!(job.backend(), BackendChoice::External);
        assert_eq!(job.run_timeout(), DEFAULT_RUN_TIMEOUT);
        assert_eq!(job.used_credits(), 0);
        assert_eq!(job.created_at(), job.updated_at());
        assert!(job.remote_id().is_none());
    }

    #[test]
    fn create_requires_a_formatter() {
        let mut new = new_job();
        new.formatter = String::new();
        let err = GeocodingJob::create(new).unwrap_err();
        assert_eq!(err.field(), Some("formatter"));
        assert!(err.to_string().contains("is not present"));
    }

    #[test]
    fn create_requires_geometry_type_for_boundary_kinds() {
        let err = GeocodingJob::create(new_job().with_kind(GeocodingKind::Admin0)).unwrap_err();
        assert_eq!(err.field(), Some("geometry_type"));

        let job = GeocodingJob::create(
            new_job()
                .with_kind(GeocodingKind::Admin0)
                .with_geometry_type(GeometryType::Polygon),
        )
        .unwrap();
        assert_eq!(
            job.backend(),
            BackendChoice::Internal {
                geometry_type: GeometryType::Polygon
            }
        );
    }

    #[test]
    fn unknown_kind_is_a_validation_error() {
        let err = "nonsense".parse::<GeocodingKind>().unwrap_err();
        assert_eq!(err.field(), Some("kind"));
        assert!(err.to_string().contains("is not in range or set"));
        assert_eq!("admin1".parse::<GeocodingKind>().unwrap(), GeocodingKind::Admin1);
    }

    #[test]
    fn kind_serializes_with_wire_names() {
        let json = serde_json::to_string(&GeocodingKind::HighResolution).unwrap();
        assert_eq!(json, "\"high-resolution\"");
        let kind: GeocodingKind = serde_json::from_str("\"namedplace\"").unwrap();
        assert_eq!(kind, GeocodingKind::Namedplace);
    }

    #[test]
    fn zero_run_timeout_is_rejected() {
        let err = GeocodingJob::create(new_job().with_run_timeout(Duration::ZERO)).unwrap_err();
        assert_eq!(err.field(), Some("run_timeout"));
    }

    #[test]
    fn every_transition_bumps_updated_at() {
        let mut job = GeocodingJob::create(new_job()).unwrap();
        let t0 = job.updated_at();
        job.record_processable_rows(10).unwrap();
        let t1 = job.updated_at();
        job.mark_submitted(RemoteId::new("r")).unwrap();
        let t2 = job.updated_at();
        job.mark_cancelled().unwrap();
        let t3 = job.updated_at();
        assert!(t0 < t1 && t1 < t2 && t2 < t3);
        assert_eq!(job.submitted_at(), Some(t2));
        assert_eq!(job.finished_at(), Some(t3));
    }

    #[test]
    fn terminal_states_cannot_be_left() {
        let mut job = GeocodingJob::create(new_job()).unwrap();
        job.mark_cancelled().unwrap();

        assert!(job.mark_completed(RowCounters::default(), 0).is_err());
        assert!(job.mark_failed(JobFailure::new(FailureReason::Poll, "x")).is_err());
        assert!(job.mark_submitted(RemoteId::new("r")).is_err());
        assert!(job.mark_cancelled().is_err());
        assert_eq!(job.state(), JobState::Cancelled);
    }

    #[test]
    fn failure_is_recorded() {
        let mut job = GeocodingJob::create(new_job()).unwrap();
        job.mark_submitted(RemoteId::new("r")).unwrap();
        job.mark_failed(JobFailure::new(FailureReason::Timeout, "15m elapsed"))
            .unwrap();
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.failure().unwrap().reason, FailureReason::Timeout);
    }

    #[test]
    fn non_billable_jobs_reject_credits() {
        let mut job = GeocodingJob::create(
            new_job()
                .with_kind(GeocodingKind::Namedplace)
                .with_geometry_type(GeometryType::Point),
        )
        .unwrap();
        assert!(job.mark_completed(RowCounters::default(), 5).is_err());
        assert!(!job.counts_towards_usage());
    }

    #[test]
    fn failed_and_successful_rows() {
        let cases = [
            ((0, 100, 100, 100), (0, 100)),
            ((10, 150, 155, 160), (5, 155)),
            ((100, 0, 100, 100), (0, 100)),
            ((0, 0, 0, 0), (0, 0)),
            ((100, 0, 0, 100), (100, 0)),
        ];

        for ((processed, hits, real, processable), (failed, successful)) in cases {
            let job = completed(processed, hits, real, processable);
            assert_eq!(job.failed_rows(), failed, "failed rows for {processed}/{hits}/{real}");
            assert_eq!(job.successful_rows(), successful);
            assert_eq!(job.attempted_rows(), processed + hits);
        }
    }

    #[test]
    fn cache_hits_count_as_successful_rows() {
        let job = completed(10, 150, 155, 160);
        assert_eq!(job.failed_rows(), 5);
        assert_eq!(job.successful_rows(), 155);

        // Nothing processable, nothing failed.
        let pending = GeocodingJob::create(new_job()).unwrap();
        assert_eq!(pending.failed_rows(), 0);
    }

    #[test]
    fn record_round_trips_through_json() {
        let job = completed(10, 5, 12, 15);
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["state"], "completed");
        assert_eq!(json["kind"], "high-resolution");
        assert_eq!(json["run_timeout"], 900.0);

        let back: GeocodingJob = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }
}
