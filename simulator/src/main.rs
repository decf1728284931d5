mod telemetry;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::Utc;
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use telemetry::{generate_fields, history_times, Device};
use tracing::{info, warn};

/// Local stand-in for the device cloud's OAuth and data endpoints
#[derive(Debug, Parser)]
#[command(name = "cloud-simulator")]
struct Args {
    #[arg(long, env = "SIM_ADDR", default_value = "0.0.0.0:8081")]
    addr: String,

    #[arg(long, env = "DEVICES", default_value_t = 5)]
    devices: usize,

    /// Seconds between history samples
    #[arg(long, env = "SAMPLE_INTERVAL_SECS", default_value_t = 60)]
    sample_interval: i64,

    /// Lifetime of issued tokens
    #[arg(long, env = "TOKEN_TTL_SECS", default_value_t = 7200)]
    token_ttl: i64,
}

struct AppState {
    devices: Vec<Device>,
    sample_interval: i64,
    token_ttl: i64,
    tokens: Mutex<HashSet<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    grant_type: String,
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    mac: String,
    start_time: i64,
    end_time: i64,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    10
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting device cloud simulator");
    info!(
        "Address: {}, Devices: {}, Sample interval: {}s",
        args.addr, args.devices, args.sample_interval
    );

    let state = Arc::new(AppState {
        devices: Device::fleet(args.devices),
        sample_interval: args.sample_interval.max(1),
        token_ttl: args.token_ttl,
        tokens: Mutex::new(HashSet::new()),
    });

    let app = Router::new()
        .route("/oauth2/token", post(issue_token))
        .route("/v1/apis/devices", get(list_devices))
        .route("/v1/apis/devices/data", get(device_history))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(&args.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", args.addr, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("HTTP server error: {}", e);
    }
}

async fn issue_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(req): Form<TokenRequest>,
) -> Response {
    let basic = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Basic "));
    if !basic || req.grant_type != "client_credentials" {
        warn!("Rejected token request: grant_type={}", req.grant_type);
        return (StatusCode::UNAUTHORIZED, "invalid_client").into_response();
    }

    let token = uuid::Uuid::new_v4().simple().to_string();
    if let Ok(mut tokens) = state.tokens.lock() {
        tokens.insert(token.clone());
    }
    info!("Issued token for scope {:?}", req.scope);

    Json(json!({
        "access_token": token,
        "expires_in": state.token_ttl,
        "token_type": "bearer",
        "scope": req.scope.unwrap_or_default()
    }))
    .into_response()
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return false;
    };
    state
        .tokens
        .lock()
        .map(|tokens| tokens.contains(token))
        .unwrap_or(false)
}

async fn list_devices(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
    }

    // Devices report on the sample grid, so consecutive polls often repeat a reading.
    let now = Utc::now().timestamp();
    let timestamp = now - now.rem_euclid(state.sample_interval);

    let mut rng = rand::thread_rng();
    let devices: Vec<Value> = state
        .devices
        .iter()
        .map(|d| {
            json!({
                "info": {
                    "mac": d.mac,
                    "name": d.name,
                    "status": {"offline": false},
                    "version": "1.0.0"
                },
                "data": generate_fields(&mut rng, timestamp)
            })
        })
        .collect();

    Json(json!({"total": devices.len(), "devices": devices})).into_response()
}

async fn device_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HistoryParams>,
) -> Response {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
    }
    if !state.devices.iter().any(|d| d.mac == params.mac) {
        return (StatusCode::NOT_FOUND, format!("unknown device {}", params.mac)).into_response();
    }
    if params.start_time > params.end_time {
        return (StatusCode::BAD_REQUEST, "start_time after end_time").into_response();
    }

    let times: Vec<i64> =
        history_times(params.start_time, params.end_time, state.sample_interval).collect();
    let mut rng = rand::thread_rng();
    let data: Vec<Value> = times
        .iter()
        .skip(params.offset)
        .take(params.limit)
        .map(|ts| generate_fields(&mut rng, *ts))
        .collect();

    Json(json!({"total": times.len(), "data": data})).into_response()
}
