//! Background execution of geocoding runs.

use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use geojobs_core::GeocodingJobId;
use geojobs_geocoding::JobState;

use super::runner::{JobRunner, RunError};
use super::store::JobStore;

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// Maximum runs tracking backends at the same time. Further runs wait
    /// for a slot before contacting anything.
    pub max_concurrent: usize,
    /// Name for logging
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 16,
            name: "geocoding-executor".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub runs_cancelled: u64,
    /// Runs that returned an error instead of a state (e.g. already running).
    pub runs_rejected: u64,
    pub current_running: usize,
}

/// Runs [`JobRunner::run`] on tokio tasks so callers get control back as
/// soon as the run is scheduled.
pub struct JobExecutor<S: JobStore> {
    runner: Arc<JobRunner<S>>,
    config: JobExecutorConfig,
    slots: Arc<Semaphore>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl<S: JobStore + Clone + 'static> JobExecutor<S> {
    pub fn new(runner: Arc<JobRunner<S>>, config: JobExecutorConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        info!(executor = %config.name, max_concurrent = config.max_concurrent, "job executor ready");
        Self {
            runner,
            config,
            slots,
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    pub fn runner(&self) -> &Arc<JobRunner<S>> {
        &self.runner
    }

    /// Schedule a run. Must be called from within a tokio runtime.
    pub fn spawn_run(&self, job_id: GeocodingJobId) -> JoinHandle<Result<JobState, RunError>> {
        let runner = self.runner.clone();
        let slots = self.slots.clone();
        let stats = self.stats.clone();
        let name = self.config.name.clone();

        tokio::spawn(async move {
            let _permit = slots.acquire_owned().await.ok();
            update(&stats, |s| {
                s.runs_started += 1;
                s.current_running += 1;
            });
            debug!(executor = %name, job_id = %job_id, "run started");

            let result = runner.run(job_id).await;

            update(&stats, |s| {
                s.current_running = s.current_running.saturating_sub(1);
                match &result {
                    Ok(JobState::Completed) => s.runs_completed += 1,
                    Ok(JobState::Failed) => s.runs_failed += 1,
                    Ok(JobState::Cancelled) => s.runs_cancelled += 1,
                    Ok(_) => {}
                    Err(_) => s.runs_rejected += 1,
                }
            });

            match &result {
                Ok(state) => debug!(executor = %name, job_id = %job_id, state = %state, "run finished"),
                Err(err) => error!(executor = %name, job_id = %job_id, error = %err, "run rejected"),
            }
            result
        })
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

fn update(stats: &Mutex<ExecutorStats>, f: impl FnOnce(&mut ExecutorStats)) {
    let mut s = stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut s);
}
