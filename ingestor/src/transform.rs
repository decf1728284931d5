use crate::errors::{Error, Result};
use crate::model::{DeviceReading, TimeSeriesPoint, TIMESTAMP_FIELD};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Which device attributes become tags on the point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagSet {
    /// Historical uploads: the history endpoint does not report a name
    Mac,
    /// Live snapshots
    MacAndName,
}

/// What to do with a reading that carries no timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingTimestamp {
    /// Live snapshots are stamped with the given instant
    UseTime(DateTime<Utc>),
    /// Historical items are skipped with a warning
    Skip,
}

/// Turns device readings into points of a single configured measurement
#[derive(Debug, Clone)]
pub struct ReadingTransformer {
    measurement: String,
}

impl ReadingTransformer {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
        }
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Returns `Ok(None)` only when the reading has no timestamp and `missing` is `Skip`.
    pub fn to_point(
        &self,
        reading: &DeviceReading,
        tag_set: TagSet,
        missing: MissingTimestamp,
    ) -> Result<Option<TimeSeriesPoint>> {
        let secs = match (reading.timestamp, missing) {
            (Some(ts), _) => ts,
            (None, MissingTimestamp::UseTime(now)) => now.timestamp(),
            (None, MissingTimestamp::Skip) => {
                warn!(
                    "No timestamp in data item for device {}: {:?}",
                    reading.mac, reading.fields
                );
                return Ok(None);
            }
        };

        let time = DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| Error::malformed(&reading.mac, TIMESTAMP_FIELD, secs))?;

        let mut fields = BTreeMap::new();
        for (name, value) in &reading.fields {
            fields.insert(name.clone(), coerce_field(&reading.mac, name, value)?);
        }

        let mut tags = BTreeMap::new();
        tags.insert("mac".to_string(), reading.mac.clone());
        if tag_set == TagSet::MacAndName {
            tags.insert("name".to_string(), reading.name.clone());
        }

        Ok(Some(TimeSeriesPoint {
            measurement: self.measurement.clone(),
            tags,
            time,
            fields,
        }))
    }
}

/// Coerces an untyped field value to a finite float.
pub fn coerce_field(device: &str, field: &str, value: &Value) -> Result<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };

    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(Error::malformed(device, field, value)),
    }
}

/// Coerces the reserved timestamp field to whole unix seconds.
pub fn coerce_timestamp(device: &str, value: &Value) -> Result<i64> {
    let secs = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };

    secs.ok_or_else(|| Error::malformed(device, TIMESTAMP_FIELD, value))
}
