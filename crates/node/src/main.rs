mod sim;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::{env, time::SystemTime};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{AirSim, Scenario};

/// Payload key style. The hub accepts both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Keys {
    Short,
    Long,
}

struct Node {
    sim: Mutex<AirSim>,
    keys: Keys,
}

type SharedNode = Arc<Node>;

fn seconds_of_day() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64() % 86_400.0)
        .unwrap_or_default()
}

fn router(node: SharedNode) -> Router {
    Router::new().route("/", get(reading)).with_state(node)
}

async fn reading(State(node): State<SharedNode>) -> Response {
    let next = node
        .sim
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .next(seconds_of_day());

    match next {
        sim::Response::Reading(s) => {
            debug!(temperature = s.temperature, humidity = s.humidity, "served reading");
            let body = match node.keys {
                Keys::Short => json!({ "temp": s.temperature, "hum": s.humidity }),
                Keys::Long => json!({ "temperature": s.temperature, "humidity": s.humidity }),
            };
            Json(body).into_response()
        }
        sim::Response::ServerError => {
            warn!("injected 500");
            (StatusCode::INTERNAL_SERVER_ERROR, "sensor read failed").into_response()
        }
        sim::Response::Garbled => {
            warn!("injected garbled body");
            ([(header::CONTENT_TYPE, "application/json")], "{\"temp\": 21.").into_response()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let keys = match env::var("SIM_KEYS").as_deref() {
        Ok("long") => Keys::Long,
        _ => Keys::Short,
    };
    let port: u16 = env::var("PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8081);
    let diurnal_period_s: f64 = env::var("SIM_DIURNAL_PERIOD_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(86_400.0);

    let node = Arc::new(Node {
        sim: Mutex::new(AirSim::new(scenario, diurnal_period_s)),
        keys,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    info!(%addr, %scenario, ?keys, "sensor node listening");

    axum::serve(listener, router(node))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("sensor node server error")
}

// ===========================================================================
// Tests
// ===========================================================================
