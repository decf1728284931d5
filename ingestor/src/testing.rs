//! In-memory stand-ins for the store and the device cloud.

use crate::api::DeviceApi;
use crate::auth::TokenEndpoint;
use crate::db::PointStore;
use crate::errors::{Error, Result};
use crate::model::{
    DeviceReading, DeviceSnapshot, HistoryPage, HistoryQuery, RawFields, Token,
    TimeSeriesPoint, TokenGrant,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryStore {
    pub writes: Mutex<Vec<Vec<TimeSeriesPoint>>>,
    pub count_queries: AtomicUsize,
    /// Fails every write whose batch contains this mac
    pub fail_mac: Option<String>,
}

impl MemoryStore {
    pub fn points(&self) -> Vec<TimeSeriesPoint> {
        self.writes.lock().unwrap().iter().flatten().cloned().collect()
    }

    pub fn write_calls(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

#[async_trait]
impl PointStore for MemoryStore {
    async fn write_points(&self, points: &[TimeSeriesPoint]) -> Result<()> {
        if let Some(mac) = &self.fail_mac {
            if points.iter().any(|p| p.mac() == mac) {
                return Err(Error::Database(sqlx::Error::PoolTimedOut));
            }
        }
        self.writes.lock().unwrap().push(points.to_vec());
        Ok(())
    }

    async fn count_points(
        &self,
        measurement: &str,
        mac: &str,
        time: DateTime<Utc>,
    ) -> Result<i64> {
        self.count_queries.fetch_add(1, Ordering::SeqCst);
        let count = self
            .points()
            .iter()
            .filter(|p| p.measurement == measurement && p.mac() == mac && p.time == time)
            .count();
        Ok(count as i64)
    }
}

pub struct StaticTokenEndpoint {
    pub calls: AtomicUsize,
}

impl StaticTokenEndpoint {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TokenEndpoint for StaticTokenEndpoint {
    async fn exchange(&self) -> Result<TokenGrant> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TokenGrant {
            access_token: Some("test-token".to_string()),
            expires_in: Some(7200),
        })
    }
}

/// Serves a fixed snapshot and a fixed history, paged by offset/limit
#[derive(Default)]
pub struct FakeApi {
    pub snapshot: Mutex<Vec<Value>>,
    pub history: Vec<RawFields>,
    /// Reported total; defaults to the history length
    pub history_total: Option<u64>,
    /// Caps the page size regardless of the requested limit
    pub max_page: Option<u64>,
    pub snapshot_error: Mutex<Option<Error>>,
    pub queries: Mutex<Vec<HistoryQuery>>,
}

impl FakeApi {
    pub fn with_snapshot(devices: Vec<Value>) -> Self {
        Self {
            snapshot: Mutex::new(devices),
            ..Default::default()
        }
    }

    pub fn with_history(history: Vec<RawFields>) -> Self {
        Self {
            history,
            ..Default::default()
        }
    }

    pub fn offsets(&self) -> Vec<(u64, u64)> {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .map(|q| (q.offset, q.limit))
            .collect()
    }
}

#[async_trait]
impl DeviceApi for FakeApi {
    async fn fetch_snapshot(&self, _token: &Token) -> Result<DeviceSnapshot> {
        if let Some(err) = self.snapshot_error.lock().unwrap().take() {
            return Err(err);
        }
        let devices = self.snapshot.lock().unwrap().clone();
        Ok(DeviceSnapshot {
            total: devices.len() as u64,
            devices,
        })
    }

    async fn fetch_history(&self, _token: &Token, query: &HistoryQuery) -> Result<HistoryPage> {
        self.queries.lock().unwrap().push(query.clone());

        let mut limit = query.limit;
        if let Some(max) = self.max_page {
            limit = limit.min(max);
        }
        let items = self
            .history
            .iter()
            .skip(query.offset as usize)
            .take(limit as usize)
            .cloned()
            .map(|raw| DeviceReading::from_raw(&query.mac, "", &Value::Null, raw))
            .collect::<Result<Vec<_>>>()?;

        Ok(HistoryPage {
            total: self.history_total.unwrap_or(self.history.len() as u64),
            items,
        })
    }
}
