use crate::api::DeviceApi;
use crate::auth::CredentialManager;
use crate::db::PointStore;
use crate::errors::{Error, Result};
use crate::metrics::BACKFILL_PAGES_TOTAL;
use crate::model::{DeviceReading, HistoryPage, HistoryQuery, Token};
use crate::transform::{MissingTimestamp, ReadingTransformer, TagSet};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Position within a backfill window.
///
/// `total` comes from the probe query and is never re-read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub offset: u64,
    pub total: u64,
}

impl PageCursor {
    pub fn new(total: u64) -> Self {
        Self { offset: 0, total }
    }

    pub fn is_done(&self) -> bool {
        self.offset >= self.total
    }

    /// Advances by the number of items the page actually returned.
    pub fn advance(&mut self, returned: usize) -> Result<()> {
        if returned == 0 {
            return Err(Error::Protocol(format!(
                "history page at offset {} returned no items but total is {}",
                self.offset, self.total
            )));
        }
        self.offset += returned as u64;
        Ok(())
    }
}

/// Time window and device of one backfill run
#[derive(Debug, Clone)]
pub struct BackfillWindow {
    pub mac: String,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BackfillWindow {
    pub fn new(mac: &str, begin: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if mac.trim().is_empty() {
            return Err(Error::Config("device MAC cannot be empty".to_string()));
        }
        if begin > end {
            return Err(Error::Config(format!(
                "begin time {} must be earlier than end time {}",
                begin, end
            )));
        }
        Ok(Self {
            mac: mac.to_string(),
            begin,
            end,
        })
    }
}

/// Parses a command-line time: RFC 3339, or a date / date-time in local time.
pub fn parse_time_arg(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }

    let naive = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| format!("invalid time '{}', expected YYYY-MM-DD[ HH:MM:SS] or RFC 3339", raw))?;

    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| format!("time '{}' does not exist in the local timezone", raw))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    pub total: u64,
    pub pages: u64,
    pub written: u64,
    pub skipped: u64,
}

/// Walks a device's history page by page and uploads each page as a batch
pub struct HistoryFetcher {
    api: Arc<dyn DeviceApi>,
    credentials: Arc<CredentialManager>,
    store: Arc<dyn PointStore>,
    transformer: ReadingTransformer,
}

impl HistoryFetcher {
    pub fn new(
        api: Arc<dyn DeviceApi>,
        credentials: Arc<CredentialManager>,
        store: Arc<dyn PointStore>,
        transformer: ReadingTransformer,
    ) -> Self {
        Self {
            api,
            credentials,
            store,
            transformer,
        }
    }

    pub async fn fetch_page(
        &self,
        token: &Token,
        window: &BackfillWindow,
        offset: u64,
        limit: u64,
    ) -> Result<HistoryPage> {
        let query = HistoryQuery {
            mac: window.mac.clone(),
            start_time: window.begin.timestamp(),
            end_time: window.end.timestamp(),
            offset,
            limit,
        };
        self.api.fetch_history(token, &query).await
    }

    /// Uploads the whole window. Any error aborts the run.
    pub async fn backfill(
        &self,
        window: &BackfillWindow,
        batch_size: u64,
    ) -> Result<BackfillSummary> {
        if batch_size == 0 {
            return Err(Error::Config("batch size must be greater than 0".to_string()));
        }
        info!(
            "Uploading data for device {} from {} to {}",
            window.mac, window.begin, window.end
        );

        // One token for the whole run.
        let token = self.credentials.ensure_valid_token().await?;

        let probe = self.fetch_page(&token, window, 0, 1).await?;
        let mut summary = BackfillSummary {
            total: probe.total,
            ..Default::default()
        };
        if probe.total == 0 {
            warn!("No data fetched for device {} in window", window.mac);
            return Ok(summary);
        }

        let mut cursor = PageCursor::new(probe.total);
        while !cursor.is_done() {
            if let Err(e) = self
                .process_page(&token, window, &mut cursor, batch_size, &mut summary)
                .await
            {
                error!(
                    "Backfill aborted at offset {} (limit {}, total {}): {}",
                    cursor.offset, batch_size, cursor.total, e
                );
                return Err(e);
            }
        }

        info!(
            "Backfill finished for device {}: {} pages, {} points written, {} skipped",
            window.mac, summary.pages, summary.written, summary.skipped
        );
        Ok(summary)
    }

    async fn process_page(
        &self,
        token: &Token,
        window: &BackfillWindow,
        cursor: &mut PageCursor,
        batch_size: u64,
        summary: &mut BackfillSummary,
    ) -> Result<()> {
        info!(
            "Processing batch: {} to {} / {}",
            cursor.offset,
            cursor.offset + batch_size,
            cursor.total
        );
        let page = self
            .fetch_page(token, window, cursor.offset, batch_size)
            .await?;
        BACKFILL_PAGES_TOTAL.inc();
        summary.pages += 1;

        if let (Some(first), Some(last)) = (page.items.first(), page.items.last()) {
            info!(
                "Batch time range: {} to {}",
                describe_time(first),
                describe_time(last)
            );
        }

        if page.items.is_empty() {
            return cursor.advance(0);
        }

        let (written, skipped) = self.upload_batch(&window.mac, &page.items).await?;
        summary.written += written;
        summary.skipped += skipped;

        cursor.advance(page.items.len())
    }

    /// Batch path: no dedup check, items without a timestamp are skipped.
    async fn upload_batch(&self, mac: &str, items: &[DeviceReading]) -> Result<(u64, u64)> {
        let mut points = Vec::with_capacity(items.len());
        let mut skipped = 0;
        for reading in items {
            match self
                .transformer
                .to_point(reading, TagSet::Mac, MissingTimestamp::Skip)?
            {
                Some(point) => points.push(point),
                None => skipped += 1,
            }
        }

        info!("Writing data for device with MAC {}: {} items", mac, points.len());
        if !points.is_empty() {
            self.store.write_points(&points).await?;
        }
        Ok((points.len() as u64, skipped))
    }
}

fn describe_time(reading: &DeviceReading) -> String {
    reading
        .timestamp
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0))
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "<no timestamp>".to_string())
}
