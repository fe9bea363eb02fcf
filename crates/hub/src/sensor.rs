//! Cached, timeout-bounded environment readings and the humidity skip rule.
//!
//! [`SensorGate::read`] never fails: a fetch error leaves the previous reading
//! in place, marked stale. A missing or stale reading never causes a skip, so
//! a sensor outage costs observability but not irrigation.

use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_HUMIDITY_SKIP_THRESHOLD: f64 = 95.0;

/// Plausible outdoor range; readings outside it are logged but kept.
const PLAUSIBLE_TEMPERATURE: std::ops::RangeInclusive<f64> = -50.0..=70.0;

// ---------------------------------------------------------------------------
// Source side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub temperature: f64,
    pub humidity: f64,
}

/// Why a fetch produced nothing. Absorbed by the gate, never surfaced.
#[derive(Debug, Error)]
pub enum SensorUnavailable {
    #[error("sensor timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("sensor unreachable: {0}")]
    Unreachable(String),
    #[error("malformed sensor payload: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait SensorSource: Send + Sync {
    async fn fetch(&self) -> Result<Measurement, SensorUnavailable>;
    fn describe(&self) -> String;
}

/// Pull a measurement out of a sensor payload. Accepts `temp`/`hum` or
/// `temperature`/`humidity`, as numbers or numeric strings.
pub fn parse_payload(body: &Value) -> Result<Measurement, SensorUnavailable> {
    let temperature = number_field(body, &["temp", "temperature"])?;
    let humidity = number_field(body, &["hum", "humidity"])?;

    if !(0.0..=100.0).contains(&humidity) {
        return Err(SensorUnavailable::Malformed(format!(
            "humidity {humidity} outside 0-100"
        )));
    }
    if !PLAUSIBLE_TEMPERATURE.contains(&temperature) {
        warn!(temperature, "sensor temperature outside plausible range");
    }
    Ok(Measurement {
        temperature,
        humidity,
    })
}

fn number_field(body: &Value, keys: &[&str]) -> Result<f64, SensorUnavailable> {
    let raw = keys
        .iter()
        .find_map(|k| body.get(*k))
        .ok_or_else(|| SensorUnavailable::Malformed(format!("missing {}", keys.join("/"))))?;
    raw.as_f64()
        .or_else(|| raw.as_str().and_then(|s| s.trim().parse().ok()))
        .filter(|v: &f64| v.is_finite())
        .ok_or_else(|| SensorUnavailable::Malformed(format!("{} is not a number: {raw}", keys[0])))
}

/// The environment sensor's HTTP endpoint.
pub struct HttpSensor {
    url: String,
    client: reqwest::Client,
}

impl HttpSensor {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build sensor http client")?;
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("http://{url}")
        };
        Ok(Self { url, client })
    }
}

#[async_trait]
impl SensorSource for HttpSensor {
    async fn fetch(&self) -> Result<Measurement, SensorUnavailable> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| SensorUnavailable::Unreachable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SensorUnavailable::Unreachable(format!("HTTP {status}")));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| SensorUnavailable::Malformed(e.to_string()))?;
        parse_payload(&body)
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSettings {
    pub cache_ttl: Duration,
    pub fetch_timeout: Duration,
    pub humidity_skip_threshold: f64,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            humidity_skip_threshold: DEFAULT_HUMIDITY_SKIP_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorReading {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub captured_at: Option<DateTime<Utc>>,
    pub is_stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SensorStatus {
    pub source: Option<String>,
    pub reading: SensorReading,
    pub cache_valid: bool,
    pub cache_age_secs: Option<u64>,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub humidity_skip_threshold: f64,
}

#[derive(Debug, Clone, Copy)]
struct Cached {
    measurement: Measurement,
    captured_at: DateTime<Utc>,
    fetched_at: Instant,
    failed_since: bool,
}

#[derive(Debug, Default)]
struct FetchStats {
    consecutive_errors: u32,
    last_error: Option<String>,
}

pub struct SensorGate {
    source: Option<Box<dyn SensorSource>>,
    settings: SensorSettings,
    // Replaced wholesale on each successful fetch.
    cache: RwLock<Option<Cached>>,
    in_flight: tokio::sync::Mutex<()>,
    stats: Mutex<FetchStats>,
}

impl SensorGate {
    /// `source == None` means no sensor is configured: readings stay empty
    /// and the gate never skips.
    pub fn new(source: Option<Box<dyn SensorSource>>, settings: SensorSettings) -> Self {
        Self {
            source,
            settings,
            cache: RwLock::new(None),
            in_flight: tokio::sync::Mutex::new(()),
            stats: Mutex::new(FetchStats::default()),
        }
    }

    pub fn settings(&self) -> &SensorSettings {
        &self.settings
    }

    fn cached(&self) -> Option<Cached> {
        *self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh(&self) -> Option<SensorReading> {
        let c = self.cached()?;
        (!c.failed_since && c.fetched_at.elapsed() < self.settings.cache_ttl)
            .then(|| to_reading(&c, false))
    }

    /// Cached reading, fetching first if it is older than the TTL.
    pub async fn read(&self) -> SensorReading {
        if let Some(r) = self.fresh() {
            return r;
        }
        let _flight = self.in_flight.lock().await;
        // Someone else may have refreshed while we waited.
        if let Some(r) = self.fresh() {
            return r;
        }
        self.fetch().await
    }

    /// Fetch now regardless of the TTL.
    pub async fn refresh(&self) -> SensorReading {
        let _flight = self.in_flight.lock().await;
        self.fetch().await
    }

    /// Cached reading with its staleness, without touching the network.
    pub fn current(&self) -> SensorReading {
        match self.cached() {
            Some(c) => {
                let stale = c.failed_since || c.fetched_at.elapsed() > self.settings.cache_ttl;
                to_reading(&c, stale)
            }
            None => SensorReading {
                is_stale: true,
                ..SensorReading::default()
            },
        }
    }

    pub async fn should_skip_irrigation(&self) -> bool {
        let reading = self.read().await;
        self.skip_for(&reading)
    }

    /// Skip only on a fresh reading whose humidity exceeds the threshold.
    pub fn skip_for(&self, reading: &SensorReading) -> bool {
        !reading.is_stale
            && reading
                .humidity
                .is_some_and(|h| h > self.settings.humidity_skip_threshold)
    }

    pub fn status(&self) -> SensorStatus {
        let stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        let cached = self.cached();
        let reading = self.current();
        SensorStatus {
            source: self.source.as_ref().map(|s| s.describe()),
            cache_valid: cached.is_some() && !reading.is_stale,
            cache_age_secs: cached.map(|c| c.fetched_at.elapsed().as_secs()),
            reading,
            consecutive_errors: stats.consecutive_errors,
            last_error: stats.last_error.clone(),
            humidity_skip_threshold: self.settings.humidity_skip_threshold,
        }
    }

    async fn fetch(&self) -> SensorReading {
        let Some(source) = &self.source else {
            return self.current();
        };

        let timeout = self.settings.fetch_timeout;
        let outcome = match tokio::time::timeout(timeout, source.fetch()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SensorUnavailable::Timeout(timeout)),
        };

        match outcome {
            Ok(measurement) => {
                let cached = Cached {
                    measurement,
                    captured_at: Utc::now(),
                    fetched_at: Instant::now(),
                    failed_since: false,
                };
                *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(cached);
                let previous = std::mem::take(
                    &mut *self.stats.lock().unwrap_or_else(PoisonError::into_inner),
                );
                if previous.consecutive_errors > 0 {
                    info!(after_errors = previous.consecutive_errors, "sensor recovered");
                }
                debug!(
                    temperature = measurement.temperature,
                    humidity = measurement.humidity,
                    "sensor reading"
                );
                to_reading(&cached, false)
            }
            Err(e) => {
                {
                    let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
                    stats.consecutive_errors = stats.consecutive_errors.saturating_add(1);
                    stats.last_error = Some(e.to_string());
                    if stats.consecutive_errors == 1 {
                        warn!(error = %e, "sensor fetch failed, using stale reading");
                    } else {
                        debug!(error = %e, errors = stats.consecutive_errors, "sensor still unavailable");
                    }
                }
                if let Some(c) = self
                    .cache
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .as_mut()
                {
                    c.failed_since = true;
                }
                self.current()
            }
        }
    }
}

fn to_reading(c: &Cached, is_stale: bool) -> SensorReading {
    SensorReading {
        temperature: Some(c.measurement.temperature),
        humidity: Some(c.measurement.humidity),
        captured_at: Some(c.captured_at),
        is_stale,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{spawn_stub, ScriptedSensor};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn gate(humidity: Option<f64>) -> (SensorGate, Arc<ScriptedSensor>) {
        let src = ScriptedSensor::new(humidity);
        let gate = SensorGate::new(Some(Box::new(Arc::clone(&src))), SensorSettings::default());
        (gate, src)
    }

    // -- Payload parsing --------------------------------------------------

    #[test]
    fn parse_short_keys() {
        let m = parse_payload(&json!({ "temp": 21.5, "hum": 40 })).unwrap();
        assert_eq!(m.temperature, 21.5);
        assert_eq!(m.humidity, 40.0);
    }

    #[test]
    fn parse_long_keys_and_numeric_strings() {
        let m = parse_payload(&json!({ "temperature": "19.0", "humidity": " 97.2 " })).unwrap();
        assert_eq!(m.temperature, 19.0);
        assert_eq!(m.humidity, 97.2);
    }

    #[test]
    fn parse_rejects_missing_and_out_of_range() {
        assert!(parse_payload(&json!({ "temp": 20 })).is_err());
        assert!(parse_payload(&json!({ "temp": 20, "hum": "wet" })).is_err());
        assert!(parse_payload(&json!({ "temp": 20, "hum": 120 })).is_err());
    }

    #[test]
    fn implausible_temperature_is_accepted() {
        let m = parse_payload(&json!({ "temp": 85, "hum": 10 })).unwrap();
        assert_eq!(m.temperature, 85.0);
    }

    // -- Fail-open --------------------------------------------------------

    #[tokio::test]
    async fn never_captured_does_not_skip() {
        let (gate, _) = gate(None);
        assert!(!gate.should_skip_irrigation().await);
        let r = gate.current();
        assert!(r.humidity.is_none());
        assert!(r.is_stale);
    }

    #[tokio::test]
    async fn no_sensor_configured_does_not_skip() {
        let gate = SensorGate::new(None, SensorSettings::default());
        assert!(!gate.should_skip_irrigation().await);
        assert!(gate.status().source.is_none());
    }

    #[tokio::test]
    async fn humid_reading_skips_only_above_threshold() {
        let (gate, src) = gate(Some(97.0));
        assert!(gate.should_skip_irrigation().await);

        src.set(Some(95.0));
        gate.refresh().await;
        assert!(!gate.should_skip_irrigation().await);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_value_but_marks_stale() {
        let (gate, src) = gate(Some(97.0));
        assert!(gate.should_skip_irrigation().await);

        src.set(None);
        let r = gate.refresh().await;
        assert_eq!(r.humidity, Some(97.0));
        assert!(r.is_stale);
        assert!(!gate.skip_for(&r));

        let st = gate.status();
        assert_eq!(st.consecutive_errors, 1);
        assert!(st.last_error.unwrap().contains("scripted outage"));
        assert!(!st.cache_valid);
    }

    // -- Caching ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn reads_within_ttl_fetch_once() {
        let (gate, src) = gate(Some(40.0));
        gate.read().await;
        tokio::time::advance(Duration::from_secs(30)).await;
        gate.read().await;
        assert_eq!(src.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        gate.read().await;
        assert_eq!(src.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reads_share_one_fetch() {
        let (gate, src) = gate(Some(40.0));
        let (a, b, c) = tokio::join!(gate.read(), gate.read(), gate.read());
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(src.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_sensor_times_out() {
        struct Hung;
        #[async_trait]
        impl SensorSource for Hung {
            async fn fetch(&self) -> Result<Measurement, SensorUnavailable> {
                std::future::pending().await
            }
            fn describe(&self) -> String {
                "hung".into()
            }
        }

        let gate = SensorGate::new(Some(Box::new(Hung)), SensorSettings::default());
        let started = Instant::now();
        let r = gate.read().await;
        assert!(r.humidity.is_none());
        assert!(started.elapsed() >= DEFAULT_FETCH_TIMEOUT);
        assert!(gate.status().last_error.unwrap().contains("timed out"));
    }

    // -- HTTP source ------------------------------------------------------

    #[tokio::test]
    async fn http_sensor_reads_endpoint() {
        let router = Router::new().route(
            "/",
            get(|| async { Json(json!({ "temperature": 22.0, "humidity": 55.5 })) }),
        );
        let addr = spawn_stub(router).await;
        let sensor = HttpSensor::new(&addr.to_string(), Duration::from_secs(2)).unwrap();
        let m = sensor.fetch().await.unwrap();
        assert_eq!(m.humidity, 55.5);
    }

    #[tokio::test]
    async fn http_sensor_server_error() {
        let router = Router::new().route("/", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let addr = spawn_stub(router).await;
        let sensor = HttpSensor::new(&addr.to_string(), Duration::from_secs(2)).unwrap();
        assert!(matches!(
            sensor.fetch().await,
            Err(SensorUnavailable::Unreachable(_))
        ));
    }
}
