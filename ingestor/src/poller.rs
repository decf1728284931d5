use crate::api::DeviceApi;
use crate::auth::CredentialManager;
use crate::db::PointStore;
use crate::dedup::DedupGuard;
use crate::errors::{Error, Result};
use crate::metrics::{DEVICE_FAILURES_TOTAL, DUPLICATES_SKIPPED_TOTAL};
use crate::model::{record_mac, DeviceEntry, DeviceReading};
use crate::transform::{MissingTimestamp, ReadingTransformer, TagSet};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one live poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub devices: usize,
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum DeviceOutcome {
    Written,
    Duplicate,
}

/// Forwards the latest reading of every device, one point per device
pub struct LivePoller {
    api: Arc<dyn DeviceApi>,
    credentials: Arc<CredentialManager>,
    store: Arc<dyn PointStore>,
    dedup: DedupGuard,
    transformer: ReadingTransformer,
}

impl LivePoller {
    pub fn new(
        api: Arc<dyn DeviceApi>,
        credentials: Arc<CredentialManager>,
        store: Arc<dyn PointStore>,
        transformer: ReadingTransformer,
    ) -> Self {
        let dedup = DedupGuard::new(store.clone(), transformer.measurement());
        Self {
            api,
            credentials,
            store,
            dedup,
            transformer,
        }
    }

    /// Token and snapshot failures fail the cycle; device failures are counted in the summary.
    pub async fn poll_once(&self) -> Result<PollSummary> {
        let token = self.credentials.ensure_valid_token().await?;
        let snapshot = self.api.fetch_snapshot(&token).await?;

        let mut summary = PollSummary {
            devices: snapshot.devices.len(),
            ..Default::default()
        };

        for record in snapshot.devices {
            let mac = record_mac(&record).to_string();
            match self.forward_device(record).await {
                Ok(DeviceOutcome::Written) => summary.written += 1,
                Ok(DeviceOutcome::Duplicate) => summary.skipped += 1,
                Err(e) => {
                    warn!("Failed to forward reading of device {}: {}", mac, e);
                    DEVICE_FAILURES_TOTAL.with_label_values(&[e.kind()]).inc();
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Poll finished: {} devices, {} written, {} duplicates, {} failed",
            summary.devices, summary.written, summary.skipped, summary.failed
        );
        Ok(summary)
    }

    async fn forward_device(&self, record: Value) -> Result<DeviceOutcome> {
        let entry = DeviceEntry::from_value(record)?;
        debug!("Device info: {:?}", entry.info);
        let reading = DeviceReading::from_entry(entry)?;

        let point = self
            .transformer
            .to_point(
                &reading,
                TagSet::MacAndName,
                MissingTimestamp::UseTime(Utc::now()),
            )?
            .ok_or_else(|| Error::Protocol("live reading produced no point".to_string()))?;

        if self.dedup.already_written(&reading.mac, point.time).await? {
            warn!(
                "Already have data for device '{}' MAC {} at {}, skipping...",
                reading.name, reading.mac, point.time
            );
            DUPLICATES_SKIPPED_TOTAL.inc();
            return Ok(DeviceOutcome::Duplicate);
        }

        info!(
            "Writing data for device '{}' MAC {} at {} with data: {:?}",
            reading.name, reading.mac, point.time, point.fields
        );
        self.store.write_points(std::slice::from_ref(&point)).await?;
        Ok(DeviceOutcome::Written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeApi, MemoryStore, StaticTokenEndpoint};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn device(mac: &str, name: &str, data: Value) -> Value {
        json!({
            "info": {"mac": mac, "name": name, "status": {"offline": false}},
            "data": data
        })
    }

    fn poller(api: Arc<FakeApi>, store: Arc<MemoryStore>) -> LivePoller {
        let credentials = Arc::new(CredentialManager::new(Arc::new(StaticTokenEndpoint::new())));
        LivePoller::new(api, credentials, store, ReadingTransformer::new("qingping"))
    }

    #[tokio::test]
    async fn test_writes_one_point_per_device() {
        let api = Arc::new(FakeApi::with_snapshot(vec![
            device(
                "AA:01",
                "Kitchen",
                json!({"temperature": {"value": 21.5}, "timestamp": {"value": 1700000000}}),
            ),
            device(
                "AA:02",
                "Office",
                json!({"humidity": {"value": "48"}, "timestamp": {"value": 1700000000}}),
            ),
        ]));
        let store = Arc::new(MemoryStore::default());

        let summary = poller(api, store.clone()).poll_once().await.unwrap();
        assert_eq!(summary.written, 2);
        assert_eq!(store.write_calls(), 2);

        let points = store.points();
        assert_eq!(points[0].tags["name"], "Kitchen");
        assert_eq!(points[1].fields["humidity"], 48.0);
    }

    #[tokio::test]
    async fn test_repeated_reading_is_skipped() {
        let api = Arc::new(FakeApi::with_snapshot(vec![device(
            "AA:01",
            "Kitchen",
            json!({"temperature": {"value": 21.5}, "timestamp": {"value": 1700000000}}),
        )]));
        let store = Arc::new(MemoryStore::default());
        let poller = poller(api, store.clone());

        poller.poll_once().await.unwrap();
        let second = poller.poll_once().await.unwrap();

        assert_eq!(second.skipped, 1);
        assert_eq!(second.written, 0);
        assert_eq!(store.points().len(), 1);
    }

    // Deliberate change from forwarding all-or-nothing: one malformed device
    // no longer costs the other devices their reading for the cycle.
    #[tokio::test]
    async fn test_malformed_device_does_not_block_others() {
        let api = Arc::new(FakeApi::with_snapshot(vec![
            device(
                "AA:01",
                "Kitchen",
                json!({"temperature": {"value": 21.5}, "timestamp": {"value": 1700000000}}),
            ),
            device(
                "AA:02",
                "Broken",
                json!({"temperature": {"value": "err"}, "timestamp": {"value": 1700000000}}),
            ),
            device(
                "AA:03",
                "Office",
                json!({"temperature": {"value": 19.0}, "timestamp": {"value": 1700000000}}),
            ),
        ]));
        let store = Arc::new(MemoryStore::default());

        let summary = poller(api, store.clone()).poll_once().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.written, 2);

        let macs: Vec<String> = store.points().iter().map(|p| p.mac().to_string()).collect();
        assert_eq!(macs, vec!["AA:01", "AA:03"]);
    }

    #[tokio::test]
    async fn test_bad_device_record_does_not_block_others() {
        let api = Arc::new(FakeApi::with_snapshot(vec![
            device(
                "AA:01",
                "Kitchen",
                json!({"temperature": {"value": 21.5}, "timestamp": {"value": 1700000000}}),
            ),
            json!({"info": {"name": "No mac"}, "data": {"temperature": {"value": 20.0}}}),
            device(
                "AA:03",
                "Office",
                json!({"temperature": 21.5, "timestamp": {"value": 1700000000}}),
            ),
        ]));
        let store = Arc::new(MemoryStore::default());

        let summary = poller(api, store.clone()).poll_once().await.unwrap();
        assert_eq!(summary.devices, 3);
        assert_eq!(summary.written, 1);
        assert_eq!(summary.failed, 2);
        assert_eq!(store.points()[0].mac(), "AA:01");
    }

    #[tokio::test]
    async fn test_one_dedup_lookup_per_device() {
        let api = Arc::new(FakeApi::with_snapshot(vec![
            device("AA:01", "A", json!({"co2": {"value": 400}, "timestamp": {"value": 1700000000}})),
            device("AA:02", "B", json!({"co2": {"value": 410}, "timestamp": {"value": 1700000000}})),
            device("AA:03", "C", json!({"co2": {"value": "bad"}, "timestamp": {"value": 1700000000}})),
        ]));
        let store = Arc::new(MemoryStore::default());
        let poller = poller(api, store.clone());

        poller.poll_once().await.unwrap();
        // The malformed device fails before its lookup.
        assert_eq!(store.count_queries.load(Ordering::SeqCst), 2);

        poller.poll_once().await.unwrap();
        assert_eq!(store.count_queries.load(Ordering::SeqCst), 4);
        assert_eq!(store.points().len(), 2);
    }

    #[tokio::test]
    async fn test_write_failure_is_isolated() {
        let api = Arc::new(FakeApi::with_snapshot(vec![
            device("AA:01", "A", json!({"co2": {"value": 400}, "timestamp": {"value": 1700000000}})),
            device("AA:02", "B", json!({"co2": {"value": 410}, "timestamp": {"value": 1700000000}})),
        ]));
        let store = Arc::new(MemoryStore {
            fail_mac: Some("AA:01".to_string()),
            ..Default::default()
        });

        let summary = poller(api, store.clone()).poll_once().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.written, 1);
        assert_eq!(store.points()[0].mac(), "AA:02");
    }

    #[tokio::test]
    async fn test_missing_timestamp_uses_current_time() {
        let api = Arc::new(FakeApi::with_snapshot(vec![device(
            "AA:01",
            "Kitchen",
            json!({"temperature": {"value": 21.5}}),
        )]));
        let store = Arc::new(MemoryStore::default());

        let before = Utc::now().timestamp();
        poller(api, store.clone()).poll_once().await.unwrap();
        let after = Utc::now().timestamp();

        let time = store.points()[0].time.timestamp();
        assert!(time >= before && time <= after);
    }

    #[tokio::test]
    async fn test_snapshot_failure_fails_cycle() {
        let api = FakeApi::default();
        *api.snapshot_error.lock().unwrap() = Some(Error::Upstream {
            status: 502,
            body: "bad gateway".to_string(),
        });
        let store = Arc::new(MemoryStore::default());

        let err = poller(Arc::new(api), store).poll_once().await.unwrap_err();
        assert!(matches!(err, Error::Upstream { status: 502, .. }));
    }
}
