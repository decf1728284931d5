use crate::auth::TokenEndpoint;
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::metrics::UPSTREAM_LATENCY_SECONDS;
use crate::model::{
    DeviceReading, DeviceSnapshot, HistoryPage, HistoryQuery, HistoryResponse, Token, TokenGrant,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use reqwest::{header, Client, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const OAUTH_SCOPE: &str = "device_full_access";

const TOKEN_ENDPOINT: &str = "oauth2/token";

/// Data endpoints of the device cloud
#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// Latest reading of every device on the account
    async fn fetch_snapshot(&self, token: &Token) -> Result<DeviceSnapshot>;

    /// One offset/limit page of a device's history
    async fn fetch_history(&self, token: &Token, query: &HistoryQuery) -> Result<HistoryPage>;
}

/// HTTP client for the device cloud's OAuth and data endpoints
pub struct CloudClient {
    client: Client,
    oauth_url: String,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl CloudClient {
    pub fn new(
        oauth_url: &str,
        base_url: &str,
        api_key: &str,
        api_secret: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("sensor-ingestor/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            oauth_url: oauth_url.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.oauth_url,
            &config.api_base_url,
            &config.api_key,
            &config.api_secret,
            config.request_timeout,
        )
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        token: &Token,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let start = Instant::now();

        let sent = self
            .client
            .get(&url)
            .query(query)
            .bearer_auth(&token.value)
            .header(header::CONTENT_TYPE, "application/json")
            .send()
            .await;
        let body = match sent {
            Ok(response) => read_success_body(response).await,
            Err(e) => Err(e.into()),
        };
        observe_latency(endpoint, start);

        let (status, body) = body?;
        debug!("GET {} returned {}", endpoint, status);
        serde_json::from_str(&body).map_err(|e| {
            Error::Protocol(format!("unexpected response shape from {}: {}", endpoint, e))
        })
    }
}

#[async_trait]
impl TokenEndpoint for CloudClient {
    async fn exchange(&self) -> Result<TokenGrant> {
        let start = Instant::now();
        let sent = self
            .client
            .post(&self.oauth_url)
            .header(
                header::AUTHORIZATION,
                basic_auth_header(&self.api_key, &self.api_secret),
            )
            .form(&[
                ("grant_type", "client_credentials"),
                ("scope", OAUTH_SCOPE),
            ])
            .send()
            .await;
        let received = match sent {
            Ok(response) => {
                let status = response.status();
                response.text().await.map(|body| (status, body))
            }
            Err(e) => Err(e),
        };
        observe_latency(TOKEN_ENDPOINT, start);
        let (status, body) = received?;

        if !status.is_success() {
            return Err(Error::Auth(format!(
                "error getting token: HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| Error::Auth(format!("malformed token response: {}", e)))
    }
}

#[async_trait]
impl DeviceApi for CloudClient {
    async fn fetch_snapshot(&self, token: &Token) -> Result<DeviceSnapshot> {
        let snapshot: DeviceSnapshot = self
            .get_json("devices", token, &[("timestamp", cache_buster())])
            .await?;
        info!("Got data from {} devices", snapshot.total);
        Ok(snapshot)
    }

    async fn fetch_history(&self, token: &Token, query: &HistoryQuery) -> Result<HistoryPage> {
        let params = [
            ("mac", query.mac.clone()),
            ("start_time", query.start_time.to_string()),
            ("end_time", query.end_time.to_string()),
            ("timestamp", cache_buster()),
            ("limit", query.limit.to_string()),
            ("offset", query.offset.to_string()),
        ];
        let response: HistoryResponse = self.get_json("devices/data", token, &params).await?;
        info!(
            "Data has {} items, current query has {} items.",
            response.total,
            response.data.len()
        );

        let items = response
            .data
            .into_iter()
            .map(|raw| DeviceReading::from_raw(&query.mac, "", &Value::Null, raw))
            .collect::<Result<Vec<_>>>()?;

        Ok(HistoryPage {
            total: response.total,
            items,
        })
    }
}

/// `Basic base64(key:secret)`
pub fn basic_auth_header(key: &str, secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", key, secret)))
}

/// Recorded for failed requests too, so timeouts show up in the histogram.
fn observe_latency(endpoint: &str, start: Instant) {
    UPSTREAM_LATENCY_SECONDS
        .with_label_values(&[endpoint])
        .observe(start.elapsed().as_secs_f64());
}

fn cache_buster() -> String {
    Utc::now().timestamp_millis().to_string()
}

/// Returns the status and body on success, or `Upstream` carrying the body.
async fn read_success_body(response: Response) -> Result<(u16, String)> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(Error::Upstream {
            status: status.as_u16(),
            body,
        });
    }
    Ok((status.as_u16(), body))
}
