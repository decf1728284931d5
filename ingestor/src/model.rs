use crate::errors::{Error, Result};
use crate::transform::coerce_timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Reserved field carrying the reading time in unix seconds.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Bearer token issued by the credential exchange
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    /// Strictly later than expiry; a token is still usable at the exact expiry instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Successful response body of the credential exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: Option<String>,
    pub expires_in: Option<i64>,
}

/// `{"value": ...}` wrapper the cloud API puts around every field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: Value,
}

pub type RawFields = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub mac: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub info: DeviceInfo,
    #[serde(default)]
    pub data: RawFields,
}

impl DeviceEntry {
    /// Decodes one element of the snapshot's device list.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("malformed device record: {}", e)))
    }
}

/// Response of the device list endpoint: latest reading per device.
///
/// Device records stay undecoded so one bad record only affects that device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub devices: Vec<Value>,
}

/// Mac of an undecoded device record, for logging
pub fn record_mac(record: &Value) -> &str {
    record
        .pointer("/info/mac")
        .and_then(Value::as_str)
        .unwrap_or("<unknown>")
}

/// Response of the history endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub total: u64,
    #[serde(default)]
    pub data: Vec<RawFields>,
}

/// One page of history, already split into readings
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub total: u64,
    pub items: Vec<DeviceReading>,
}

/// Query for one page of the history endpoint
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub mac: String,
    pub start_time: i64,
    pub end_time: i64,
    pub offset: u64,
    pub limit: u64,
}

/// A single device reading with the reserved timestamp split off
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReading {
    pub mac: String,
    pub name: String,
    pub status: String,
    pub timestamp: Option<i64>,
    pub fields: BTreeMap<String, Value>,
}

impl DeviceReading {
    pub fn from_raw(mac: &str, name: &str, status: &Value, raw: RawFields) -> Result<Self> {
        let mut fields: BTreeMap<String, Value> =
            raw.into_iter().map(|(k, v)| (k, v.value)).collect();

        let timestamp = match fields.remove(TIMESTAMP_FIELD) {
            Some(value) => Some(coerce_timestamp(mac, &value)?),
            None => None,
        };

        let status = match status {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };

        Ok(Self {
            mac: mac.to_string(),
            name: name.to_string(),
            status,
            timestamp,
            fields,
        })
    }

    pub fn from_entry(entry: DeviceEntry) -> Result<Self> {
        let DeviceEntry { info, data } = entry;
        Self::from_raw(&info.mac, &info.name, &info.status, data)
    }
}

/// A normalized point as written to the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeSeriesPoint {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub time: DateTime<Utc>,
    pub fields: BTreeMap<String, f64>,
}

impl TimeSeriesPoint {
    pub fn mac(&self) -> &str {
        self.tags.get("mac").map(String::as_str).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    #[test]
    fn test_token_expiry_is_strict() {
        let expires_at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let token = Token {
            value: "t".to_string(),
            expires_at,
        };
        assert!(!token.is_expired_at(expires_at - Duration::seconds(1)));
        assert!(!token.is_expired_at(expires_at));
        assert!(token.is_expired_at(expires_at + Duration::seconds(1)));
    }

    #[test]
    fn test_token_debug_hides_value() {
        let token = Token {
            value: "secret-token".to_string(),
            expires_at: Utc::now(),
        };
        assert!(!format!("{:?}", token).contains("secret-token"));
    }

    #[test]
    fn test_snapshot_deserialize() {
        let body = json!({
            "total": 1,
            "devices": [{
                "info": {"mac": "AA:BB", "name": "Office", "status": {"offline": false}, "version": "1.0"},
                "data": {
                    "temperature": {"value": 21.5},
                    "timestamp": {"value": 1700000000}
                }
            }]
        });
        let snapshot: DeviceSnapshot = serde_json::from_value(body).unwrap();
        assert_eq!(snapshot.total, 1);

        assert_eq!(record_mac(&snapshot.devices[0]), "AA:BB");

        let entry = DeviceEntry::from_value(snapshot.devices[0].clone()).unwrap();
        let reading = DeviceReading::from_entry(entry).unwrap();
        assert_eq!(reading.mac, "AA:BB");
        assert_eq!(reading.name, "Office");
        assert_eq!(reading.status, r#"{"offline":false}"#);
        assert_eq!(reading.timestamp, Some(1_700_000_000));
        assert!(!reading.fields.contains_key(TIMESTAMP_FIELD));
    }

    #[test]
    fn test_bad_device_record_is_protocol_error() {
        let body = json!({
            "total": 3,
            "devices": [
                {"info": {"mac": "AA:01"}, "data": {"temperature": {"value": 20}}},
                {"info": {"name": "no mac"}, "data": {}},
                {"info": {"mac": "AA:03"}, "data": {"temperature": 21.5}}
            ]
        });
        let snapshot: DeviceSnapshot = serde_json::from_value(body).unwrap();
        assert_eq!(snapshot.devices.len(), 3);

        assert!(DeviceEntry::from_value(snapshot.devices[0].clone()).is_ok());
        assert_eq!(record_mac(&snapshot.devices[1]), "<unknown>");
        for record in &snapshot.devices[1..] {
            let err = DeviceEntry::from_value(record.clone()).unwrap_err();
            assert!(matches!(err, Error::Protocol(_)));
        }
    }

    #[test]
    fn test_reading_without_timestamp() {
        let mut raw = RawFields::new();
        raw.insert("humidity".to_string(), FieldValue { value: json!("55") });
        let reading = DeviceReading::from_raw("AA:BB", "", &Value::Null, raw).unwrap();
        assert_eq!(reading.timestamp, None);
        assert_eq!(reading.status, "");
    }
}
