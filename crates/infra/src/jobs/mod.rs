//! Geocoding job engine.
//!
//! ## Design
//!
//! - Job records are tenant-owned and charged against a quota pool (the
//!   tenant's own, or its organization's)
//! - Backends are trait objects chosen per record at creation time
//! - Runs are cancellable, deadline-bounded tokio tasks
//! - Credit finalization is serialized per quota pool
//! - Failures end in a `failed` record plus one error-sink notification
//!
//! ## Components
//!
//! - `JobStore`: persistence for job records, with conditional updates
//! - `BackendRegistry`/`GeocodingBackend`: the engines doing the work
//! - `CreditLedger`: quota, credits and price
//! - `JobRunner`: the run/cancel state machine
//! - `JobExecutor`: runs in the background with bounded concurrency

pub mod backend;
pub mod executor;
pub mod ledger;
pub mod retry;
pub mod runner;
pub mod sink;
pub mod store;
pub mod table;

pub use backend::{BackendError, BackendRegistry, GeocodingBackend, RemoteStatus, SubmitRequest};
pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig};
pub use ledger::{AccountDirectory, CreditLedger, InMemoryAccountDirectory, LedgerError};
pub use retry::{BackoffStrategy, CancelRetryPolicy, CANCEL_ATTEMPTS};
pub use runner::{CancelOutcome, JobRunner, RunError, RunFailure, RunnerConfig};
pub use sink::{ErrorContext, ErrorSink, InMemoryErrorSink, Notification, TracingErrorSink};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use table::{InMemoryTableRows, TableRows};
