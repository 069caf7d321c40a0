//! Geocoding domain module.
//!
//! Business rules for geocoding jobs implemented as deterministic domain
//! logic: the job record and its state machine, the formatter template
//! compiler, quota/credit arithmetic and backend selection. No IO, no async,
//! no clocks other than the timestamps stamped on transitions.

pub mod backend;
pub mod formatter;
pub mod job;
pub mod quota;

pub use backend::BackendChoice;
pub use formatter::{Formatter, Segment};
pub use job::{
    FailureReason, GeocodingJob, GeocodingKind, GeometryType, JobFailure, JobState, NewGeocodingJob,
    RemoteId, RowCounters, DEFAULT_RUN_TIMEOUT,
};
pub use quota::{OrganizationQuota, Pricing, QuotaAccount, QuotaLimit, QuotaPool};
