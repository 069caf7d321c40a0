//! Engine configuration.

use std::time::Duration;

use tracing::warn;

use geojobs_geocoding::DEFAULT_RUN_TIMEOUT;

use crate::jobs::{CancelRetryPolicy, JobExecutorConfig, RunnerConfig};

pub const ENV_RUN_TIMEOUT_SECS: &str = "GEOJOBS_RUN_TIMEOUT_SECS";
pub const ENV_POLL_INTERVAL_MS: &str = "GEOJOBS_POLL_INTERVAL_MS";
pub const ENV_CANCEL_BACKOFF_MS: &str = "GEOJOBS_CANCEL_BACKOFF_MS";
pub const ENV_MAX_CONCURRENT: &str = "GEOJOBS_MAX_CONCURRENT_RUNS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Deadline given to jobs created without an explicit one.
    pub run_timeout: Duration,
    /// Pause between backend status polls.
    pub poll_interval: Duration,
    /// Pause between cancellation attempts.
    pub cancel_backoff: Duration,
    pub max_concurrent_runs: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_timeout: DEFAULT_RUN_TIMEOUT,
            poll_interval: Duration::from_secs(5),
            cancel_backoff: Duration::ZERO,
            max_concurrent_runs: 16,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `GEOJOBS_*` environment variables.
    ///
    /// Unparseable or zero values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`EngineConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            run_timeout: read(&lookup, ENV_RUN_TIMEOUT_SECS, false)
                .map(Duration::from_secs)
                .unwrap_or(defaults.run_timeout),
            poll_interval: read(&lookup, ENV_POLL_INTERVAL_MS, false)
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            cancel_backoff: read(&lookup, ENV_CANCEL_BACKOFF_MS, true)
                .map(Duration::from_millis)
                .unwrap_or(defaults.cancel_backoff),
            max_concurrent_runs: read(&lookup, ENV_MAX_CONCURRENT, false)
                .map(|n| n as usize)
                .unwrap_or(defaults.max_concurrent_runs),
        }
    }

    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_cancel_backoff(mut self, cancel_backoff: Duration) -> Self {
        self.cancel_backoff = cancel_backoff;
        self
    }

    pub fn runner_config(&self) -> RunnerConfig {
        let cancel_retry = if self.cancel_backoff.is_zero() {
            CancelRetryPolicy::immediate()
        } else {
            CancelRetryPolicy::fixed(self.cancel_backoff)
        };
        RunnerConfig {
            poll_interval: self.poll_interval,
            cancel_retry,
        }
    }

    pub fn executor_config(&self) -> JobExecutorConfig {
        JobExecutorConfig::default().with_max_concurrent(self.max_concurrent_runs)
    }
}

fn read(lookup: &impl Fn(&str) -> Option<String>, key: &str, allow_zero: bool) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(0) if !allow_zero => {
            warn!(key, "zero is not allowed; using default");
            None
        }
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, value = %raw, error = %err, "invalid value; using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = EngineConfig::from_lookup(lookup(&[]));
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.run_timeout, Duration::from_secs(900));
    }

    #[test]
    fn reads_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_RUN_TIMEOUT_SECS, "60"),
            (ENV_POLL_INTERVAL_MS, "250"),
            (ENV_CANCEL_BACKOFF_MS, "10"),
            (ENV_MAX_CONCURRENT, "2"),
        ]));
        assert_eq!(config.run_timeout, Duration::from_secs(60));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.runner_config().cancel_retry, CancelRetryPolicy::fixed(Duration::from_millis(10)));
        assert_eq!(config.executor_config().max_concurrent, 2);
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_RUN_TIMEOUT_SECS, "soon"),
            (ENV_POLL_INTERVAL_MS, "0"),
        ]));
        assert_eq!(config.run_timeout, DEFAULT_RUN_TIMEOUT);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.runner_config().cancel_retry, CancelRetryPolicy::immediate());
    }
}
