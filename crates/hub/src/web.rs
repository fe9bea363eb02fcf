use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::commands;
use crate::device::PulseOutcome;
use crate::error::CommandError;
use crate::state::SharedState;
use crate::store::HardwareErrorRecord;

/// Records returned by `GET /api/hardware_errors`.
const HARDWARE_ERROR_PAGE: usize = 50;
const DEFAULT_PULSE_SECS: f64 = 5.0;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/hardware_errors", get(api_hardware_errors))
        .route("/api/sensor", get(api_sensor))
        .route("/api/sensor/refresh", post(api_sensor_refresh))
        .route("/api/zones/{id}/on", post(api_zone_on))
        .route("/api/zones/{id}/off", post(api_zone_off))
        .route("/api/zones/{id}/pulse", post(api_zone_pulse))
        .route("/api/stop", post(api_stop))
        .with_state(state)
}

async fn api_status(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.to_status().await)
}

async fn api_hardware_errors(State(state): State<SharedState>) -> Json<Vec<HardwareErrorRecord>> {
    Json(state.storage.hardware_errors.recent(HARDWARE_ERROR_PAGE))
}

async fn api_sensor(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.sensor.status())
}

async fn api_sensor_refresh(State(state): State<SharedState>) -> impl IntoResponse {
    let reading = state.sensor.refresh().await;
    let detail = match reading.humidity {
        Some(h) if !reading.is_stale => format!("manual refresh: humidity {h:.1}%"),
        _ => "manual refresh: no reading".to_string(),
    };
    state.record_sensor(detail).await;
    Json(reading)
}

// ── Zone commands ───────────────────────────────────────────

#[derive(Serialize)]
struct CommandAck {
    ok: bool,
    device_id: String,
    action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<&'static str>,
}

impl CommandAck {
    fn new(device_id: String, action: &'static str) -> Self {
        Self {
            ok: true,
            device_id,
            action,
            outcome: None,
        }
    }
}

#[derive(Deserialize)]
struct PulseParams {
    #[serde(default = "default_pulse_secs")]
    secs: f64,
}

fn default_pulse_secs() -> f64 {
    DEFAULT_PULSE_SECS
}

async fn api_zone_on(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<CommandAck>, CommandError> {
    commands::turn_on(&state, &id).await?;
    Ok(Json(CommandAck::new(id, "on")))
}

async fn api_zone_off(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<CommandAck>, CommandError> {
    commands::turn_off(&state, &id).await?;
    Ok(Json(CommandAck::new(id, "off")))
}

async fn api_zone_pulse(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(params): Query<PulseParams>,
) -> Result<Json<CommandAck>, CommandError> {
    let outcome = commands::pulse(&state, &id, params.secs).await?;
    let mut ack = CommandAck::new(id, "pulse");
    ack.outcome = Some(match outcome {
        PulseOutcome::Completed => "completed",
        PulseOutcome::Interrupted => "interrupted",
    });
    Ok(Json(ack))
}

async fn api_stop(State(state): State<SharedState>) -> impl IntoResponse {
    let failures = commands::stop_all(&state).await;
    let failed: Vec<_> = failures
        .iter()
        .map(|(id, e)| json!({ "device_id": id, "error": e.to_string() }))
        .collect();
    Json(json!({ "ok": failed.is_empty(), "failed": failed }))
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

impl CommandError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownDevice(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::AlreadyRunning(_) | Self::Stopped(_) => StatusCode::CONFLICT,
            Self::Device { source, .. } if source.is_cooldown() => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Device { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for CommandError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "command failed");
        }
        let mut body = json!({ "error": { "code": status.as_u16(), "message": self.to_string() } });
        if let Self::Device { source, .. } = &self {
            body["error"]["kind"] = json!(source.kind());
            if let Some(remaining) = source.cooldown_remaining() {
                body["error"]["retry_in_secs"] = json!(remaining.as_secs());
            }
        }
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

/// Port from `WEB_PORT`, falling back to the configured one.
pub fn resolve_port(configured: u16) -> u16 {
    env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(configured)
}

#[cfg(not(feature = "tls"))]
pub async fn serve(state: SharedState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "api listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("web server error")
}

#[cfg(feature = "tls")]
pub async fn serve(state: SharedState, port: u16, shutdown: CancellationToken) -> Result<()> {
    use axum_server::tls_rustls::RustlsConfig;
    use std::time::Duration;

    let cert = env::var("TLS_CERT").context("TLS_CERT must be set with the tls feature")?;
    let key = env::var("TLS_KEY").context("TLS_KEY must be set with the tls feature")?;
    let tls = RustlsConfig::from_pem_file(&cert, &key)
        .await
        .with_context(|| format!("failed to load TLS cert {cert} / key {key}"))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let handle = axum_server::Handle::new();
    let on_shutdown = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        on_shutdown.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    info!(%addr, "api listening on https://{addr}");

    axum_server::bind_rustls(addr, tls)
        .handle(handle)
        .serve(router(state).into_make_service())
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
