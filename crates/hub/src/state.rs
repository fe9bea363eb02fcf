use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::device::{DeviceRegistry, DeviceStatus, PulseOutcome};
use crate::error::{DeviceError, PulseError};
use crate::health::HealthRecord;
use crate::run::{RunCoordinator, RunHandle, RunState};
use crate::sensor::{SensorGate, SensorReading};
use crate::store::{HardwareErrorRecord, Storage, TIMESTAMP_FORMAT};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<AppState>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Everything the scheduler and the command handlers share. Built once in
/// `main` and handed around as [`SharedState`].
pub struct AppState {
    pub started_at: Instant,
    pub registry: Arc<DeviceRegistry>,
    pub sensor: SensorGate,
    pub runs: RunCoordinator,
    pub storage: Storage,
    manual: Mutex<Option<ManualHold>>,
    events: RwLock<VecDeque<SystemEvent>>,
}

/// A manually switched-on zone keeps the run slot until it is switched off.
struct ManualHold {
    device_id: String,
    _handle: RunHandle,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Valve,
    Scheduler,
    Sensor,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
    pub current_run: RunState,
    pub devices: Vec<DeviceStatus>,
    pub hardware_status: BTreeMap<String, HealthRecord>,
    pub environment: SensorReading,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl AppState {
    pub fn new(registry: Arc<DeviceRegistry>, sensor: SensorGate, storage: Storage) -> Self {
        Self {
            started_at: Instant::now(),
            registry,
            sensor,
            runs: RunCoordinator::new(),
            storage,
            manual: Mutex::new(None),
            events: RwLock::new(VecDeque::with_capacity(MAX_EVENTS)),
        }
    }

    /// Display name for a zone, if it exists.
    pub fn zone_name(&self, device_id: &str) -> Option<String> {
        self.registry.identity(device_id).map(|i| i.name.clone())
    }

    // ── Manual hold ─────────────────────────────────────────

    pub fn hold_manual(&self, device_id: &str, handle: RunHandle) {
        *self.manual.lock().unwrap_or_else(PoisonError::into_inner) = Some(ManualHold {
            device_id: device_id.to_string(),
            _handle: handle,
        });
    }

    /// Drop the manual hold if it belongs to `device_id`. Returns whether it did.
    pub fn release_manual_for(&self, device_id: &str) -> bool {
        let mut hold = self.manual.lock().unwrap_or_else(PoisonError::into_inner);
        if hold.as_ref().is_some_and(|h| h.device_id == device_id) {
            *hold = None;
            return true;
        }
        false
    }

    pub fn release_manual(&self) -> bool {
        self.manual
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    // ── Valve pulses ────────────────────────────────────────

    /// Pulse one zone and record it: the ON event once the valve is confirmed
    /// open, the OFF event once it is closed, a journaled error otherwise.
    pub async fn pulse_zone(
        self: &Arc<Self>,
        device_id: &str,
        duration: Duration,
        cancel: CancellationToken,
    ) -> Result<PulseOutcome, PulseError> {
        let (activated_tx, activated_rx) = oneshot::channel();
        let app = Arc::clone(self);
        let id = device_id.to_string();
        let on_event = tokio::spawn(async move {
            if activated_rx.await.is_ok() {
                app.record_valve(&id, true).await;
            }
        });

        let outcome = self
            .registry
            .pulse(device_id, duration, cancel, Some(activated_tx))
            .await;
        let _ = on_event.await;

        match &outcome {
            Ok(_) => self.record_valve(device_id, false).await,
            Err(e) => {
                self.record_hardware_error(device_id, e.stage(), e.device_error())
                    .await
            }
        }
        outcome
    }

    // ── Event ring ──────────────────────────────────────────

    /// Record a valve state change.
    pub async fn record_valve(&self, device_id: &str, on: bool) {
        let state_str = if on { "ON" } else { "OFF" };
        self.push_event(EventKind::Valve, format!("{device_id} set {state_str}"))
            .await;
    }

    pub async fn record_scheduler(&self, detail: String) {
        self.push_event(EventKind::Scheduler, detail).await;
    }

    pub async fn record_sensor(&self, detail: String) {
        self.push_event(EventKind::Sensor, detail).await;
    }

    /// Record an error event.
    pub async fn record_error(&self, detail: String) {
        self.push_event(EventKind::Error, detail).await;
    }

    /// Record a generic system event.
    pub async fn record_system(&self, detail: String) {
        self.push_event(EventKind::System, detail).await;
    }

    /// Journal a device failure and surface it as an error event.
    pub async fn record_hardware_error(&self, device_id: &str, context: &str, err: &DeviceError) {
        let record = HardwareErrorRecord {
            time: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            device_id: device_id.to_string(),
            error_type: format!("{context}:{}", err.kind()),
            error_msg: err.to_string(),
        };
        if let Err(e) = self.storage.hardware_errors.append(record) {
            error!(device = %device_id, error = %format!("{e:#}"), "could not journal hardware error");
        }
        self.record_error(format!("{device_id} {context}: {err}")).await;
    }

    pub async fn recent_events(&self) -> Vec<SystemEvent> {
        self.events.read().await.iter().rev().cloned().collect()
    }

    /// Build the JSON-serialisable status snapshot. Touches no hardware.
    pub async fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            timestamp: Utc::now(),
            current_run: self.runs.snapshot(),
            devices: self.registry.statuses(),
            hardware_status: self.registry.health().snapshot(),
            environment: self.sensor.current(),
            events: self.recent_events().await,
        }
    }

    async fn push_event(&self, kind: EventKind, detail: String) {
        let mut events = self.events.write().await;
        if events.len() >= MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
