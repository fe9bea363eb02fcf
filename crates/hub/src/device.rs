//! Uniform on/off/pulse contract over every actuator kind.
//!
//! The registry is built once at startup. Each device is stored as a boxed
//! [`Actuator`] so dispatch is fixed at construction. Every call is bounded by
//! the device's timeout and routed through the [`HealthTracker`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DeviceError, PulseError};
use crate::health::{HealthPolicy, HealthTracker};

/// Attempts made to switch a valve off at the end of a pulse.
const PULSE_OFF_ATTEMPTS: u32 = 3;
const PULSE_OFF_RETRY_DELAY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    On,
    Off,
    #[default]
    Unknown,
}

impl State {
    pub fn from_on(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DeviceKind {
    ContactRelay { gpio_pin: u8, active_low: bool },
    NetworkSwitch { address: String, output: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: DeviceKind,
    #[serde(skip)]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseOutcome {
    /// The full duration elapsed.
    Completed,
    /// The cancellation token fired before the duration elapsed.
    Interrupted,
}

/// Per-device view for the status surface. Never touches the hardware.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    #[serde(flatten)]
    pub identity: DeviceIdentity,
    pub state: State,
    pub last_changed: Option<DateTime<Utc>>,
}

/// One physical output. Implementations normalise their own failures into
/// [`DeviceError`]; timeouts and health tracking are applied by the registry.
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn set(&self, on: bool) -> Result<(), DeviceError>;
    async fn query(&self) -> Result<State, DeviceError>;
    /// Identity/readiness probe. Returns a short description for the log.
    async fn probe(&self) -> Result<String, DeviceError>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
struct LastKnown {
    state: State,
    changed: Option<DateTime<Utc>>,
}

struct Entry {
    identity: DeviceIdentity,
    actuator: Box<dyn Actuator>,
    last_known: Mutex<LastKnown>,
}

impl Entry {
    fn remember(&self, state: State) {
        let mut lk = self.last_known.lock().unwrap_or_else(PoisonError::into_inner);
        if lk.state != state {
            lk.changed = Some(Utc::now());
        }
        lk.state = state;
    }

    fn last_known(&self) -> LastKnown {
        *self.last_known.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct DeviceRegistry {
    entries: Vec<Entry>,
    health: HealthTracker,
}

impl DeviceRegistry {
    pub fn new(devices: Vec<(DeviceIdentity, Box<dyn Actuator>)>, policy: HealthPolicy) -> Self {
        let health = HealthTracker::new(policy, devices.iter().map(|(id, _)| id.device_id.clone()));
        let entries = devices
            .into_iter()
            .map(|(identity, actuator)| Entry {
                identity,
                actuator,
                last_known: Mutex::new(LastKnown::default()),
            })
            .collect();
        Self { entries, health }
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn identity(&self, device_id: &str) -> Option<&DeviceIdentity> {
        self.entry(device_id).ok().map(|e| &e.identity)
    }

    pub fn device_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.identity.device_id.as_str())
    }

    pub fn last_known(&self, device_id: &str) -> State {
        self.entry(device_id)
            .map(|e| e.last_known().state)
            .unwrap_or_default()
    }

    pub fn statuses(&self) -> Vec<DeviceStatus> {
        self.entries
            .iter()
            .map(|e| {
                let lk = e.last_known();
                DeviceStatus {
                    identity: e.identity.clone(),
                    state: lk.state,
                    last_changed: lk.changed,
                }
            })
            .collect()
    }

    fn entry(&self, device_id: &str) -> Result<&Entry, DeviceError> {
        self.entries
            .iter()
            .find(|e| e.identity.device_id == device_id)
            .ok_or_else(|| DeviceError::NotInitialized(format!("no device '{device_id}'")))
    }

    // ── Single-device operations ─────────────────────────────────────────

    pub async fn turn_on(&self, device_id: &str) -> Result<(), DeviceError> {
        self.switch(device_id, true).await
    }

    pub async fn turn_off(&self, device_id: &str) -> Result<(), DeviceError> {
        self.switch(device_id, false).await
    }

    async fn switch(&self, device_id: &str, on: bool) -> Result<(), DeviceError> {
        let entry = self.entry(device_id)?;
        let wanted = State::from_on(on);
        let timeout = entry.identity.timeout;

        let changed = self
            .health
            .guard(device_id, move || async move {
                bounded(timeout, async move {
                    if entry.actuator.query().await? == wanted {
                        return Ok(false);
                    }
                    entry.actuator.set(on).await?;
                    Ok(true)
                })
                .await
            })
            .await?;

        entry.remember(wanted);
        if changed {
            info!(device = %device_id, state = ?wanted, "device switched");
        } else {
            debug!(device = %device_id, state = ?wanted, "device already in requested state");
        }
        Ok(())
    }

    pub async fn query(&self, device_id: &str) -> Result<State, DeviceError> {
        let entry = self.entry(device_id)?;
        let timeout = entry.identity.timeout;
        let state = self
            .health
            .guard(device_id, move || bounded(timeout, entry.actuator.query()))
            .await?;
        if state != State::Unknown {
            entry.remember(state);
        }
        Ok(state)
    }

    pub async fn probe(&self, device_id: &str) -> Result<String, DeviceError> {
        let entry = self.entry(device_id)?;
        let timeout = entry.identity.timeout;
        self.health
            .guard(device_id, move || bounded(timeout, entry.actuator.probe()))
            .await
    }

    // ── Multi-device operations ──────────────────────────────────────────

    /// Turn off every other device not known to be off, then turn the target
    /// on. Failures on the others are logged and do not block the target.
    pub async fn exclusive_on(&self, device_id: &str) -> Result<(), DeviceError> {
        self.entry(device_id)?;
        for other in self.entries.iter().filter(|e| e.identity.device_id != device_id) {
            if other.last_known().state == State::Off {
                continue;
            }
            if let Err(e) = self.turn_off(&other.identity.device_id).await {
                warn!(
                    device = %other.identity.device_id,
                    target = %device_id,
                    error = %e,
                    "could not switch off before exclusive on"
                );
            }
        }
        self.turn_on(device_id).await
    }

    /// Best-effort off for every device. Returns the failures.
    pub async fn all_off(&self) -> Vec<(String, DeviceError)> {
        let mut failures = Vec::new();
        for e in &self.entries {
            if let Err(err) = self.turn_off(&e.identity.device_id).await {
                error!(device = %e.identity.device_id, error = %err, "all-off failed for device");
                failures.push((e.identity.device_id.clone(), err));
            }
        }
        failures
    }

    /// Exclusive-on, wait, off. The sequence runs in its own task so the off
    /// command is issued even if the caller's future is dropped mid-wait.
    ///
    /// `activated` fires once the valve is confirmed on. It is dropped unsent
    /// when activation fails.
    pub async fn pulse(
        self: &Arc<Self>,
        device_id: &str,
        duration: Duration,
        cancel: CancellationToken,
        activated: Option<oneshot::Sender<()>>,
    ) -> Result<PulseOutcome, PulseError> {
        self.entry(device_id).map_err(PulseError::Activation)?;

        let registry = Arc::clone(self);
        let id = device_id.to_string();
        let task = tokio::spawn(async move {
            registry.run_pulse(&id, duration, cancel, activated).await
        });

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(PulseError::Deactivation(DeviceError::protocol(format!(
                "pulse task aborted: {e}"
            )))),
        }
    }

    async fn run_pulse(
        &self,
        device_id: &str,
        duration: Duration,
        cancel: CancellationToken,
        activated: Option<oneshot::Sender<()>>,
    ) -> Result<PulseOutcome, PulseError> {
        if let Err(e) = self.exclusive_on(device_id).await {
            // A cooling-down device was never touched.
            if !e.is_cooldown() {
                self.settle_off(device_id).await;
            }
            return Err(PulseError::Activation(e));
        }
        if let Some(tx) = activated {
            let _ = tx.send(());
        }

        let outcome = tokio::select! {
            _ = tokio::time::sleep(duration) => PulseOutcome::Completed,
            _ = cancel.cancelled() => PulseOutcome::Interrupted,
        };
        if outcome == PulseOutcome::Interrupted {
            info!(device = %device_id, "pulse interrupted");
        }

        let mut attempt = 1;
        loop {
            match self.turn_off(device_id).await {
                Ok(()) => return Ok(outcome),
                Err(e) if attempt >= PULSE_OFF_ATTEMPTS || e.is_cooldown() => {
                    error!(device = %device_id, attempts = attempt, error = %e, "valve may be left OPEN");
                    return Err(PulseError::Deactivation(e));
                }
                Err(e) => {
                    warn!(device = %device_id, attempt, error = %e, "off failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(PULSE_OFF_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Unconditional off after a failed activation, whatever state the failed
    /// call left the output in. Bypasses the health tracker: the activation
    /// failure has already been counted.
    async fn settle_off(&self, device_id: &str) {
        let Ok(entry) = self.entry(device_id) else {
            return;
        };
        match bounded(entry.identity.timeout, entry.actuator.set(false)).await {
            Ok(()) => entry.remember(State::Off),
            Err(e) => {
                debug!(device = %device_id, error = %e, "off after failed activation also failed")
            }
        }
    }
}

async fn bounded<T>(
    timeout: Duration,
    op: impl std::future::Future<Output = Result<T, DeviceError>>,
) -> Result<T, DeviceError> {
    tokio::time::timeout(timeout, op)
        .await
        .map_err(|_| DeviceError::Timeout(timeout))?
}

// ===========================================================================
// Tests
// ===========================================================================
