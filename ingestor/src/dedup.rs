use crate::db::PointStore;
use crate::errors::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Checks the store for an existing point before a live write.
///
/// Only the live path uses this: successive snapshots often repeat the same
/// reading. Backfill windows are disjoint, so the batch path writes directly.
pub struct DedupGuard {
    store: Arc<dyn PointStore>,
    measurement: String,
}

impl DedupGuard {
    pub fn new(store: Arc<dyn PointStore>, measurement: impl Into<String>) -> Self {
        Self {
            store,
            measurement: measurement.into(),
        }
    }

    pub async fn already_written(&self, mac: &str, time: DateTime<Utc>) -> Result<bool> {
        let count = self
            .store
            .count_points(&self.measurement, mac, time)
            .await?;
        Ok(count > 0)
    }
}
