//! Table row counts.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::anyhow;
use async_trait::async_trait;

use geojobs_geocoding::GeocodingJob;

/// Knows how many rows of a job's table are eligible for geocoding right now
/// (rows not geocoded yet, after the table's current filters).
#[async_trait]
pub trait TableRows: Send + Sync {
    async fn processable_rows(&self, job: &GeocodingJob) -> anyhow::Result<u64>;
}

/// Row counts keyed by table name, for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTableRows {
    counts: RwLock<HashMap<String, u64>>,
}

impl InMemoryTableRows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, table_name: impl Into<String>, rows: u64) {
        self.counts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(table_name.into(), rows);
    }
}

#[async_trait]
impl TableRows for InMemoryTableRows {
    async fn processable_rows(&self, job: &GeocodingJob) -> anyhow::Result<u64> {
        let counts = self
            .counts
            .read()
            .map_err(|_| anyhow!("row count lock poisoned"))?;
        counts
            .get(job.table_name())
            .copied()
            .ok_or_else(|| anyhow!("unknown table {:?}", job.table_name()))
    }
}
