//! Per-device failure tracking with retry cooldowns.
//!
//! Every device call goes through [`HealthTracker::guard`], which decides
//! whether the call may reach the hardware at all and records the outcome.
//!
//! ## Per-device state machine
//!
//! ```text
//! Healthy ──[N consecutive errors]──▶ Failed ──[cooldown elapsed]──▶ RetryEligible
//!    ▲                                  ▲                                │
//!    │                                  └──────[probe fails]─────────────┤
//!    └─────────────────────────────────────────[probe succeeds]──────────┘
//! ```
//!
//! While `Failed`, callers get a synthetic `DeviceError::Unreachable` carrying
//! the remaining cooldown and the operation is never invoked. While
//! `RetryEligible`, exactly one probe may be in flight.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::DeviceError;

pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 3;
pub const DEFAULT_RETRY_COOLDOWN: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Policy + public records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub max_consecutive_errors: u32,
    pub retry_cooldown: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            retry_cooldown: DEFAULT_RETRY_COOLDOWN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthState {
    Healthy,
    Failed,
    FailedRetryEligible,
}

/// Point-in-time copy of one device's health, safe to hand to the API.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub device_id: String,
    pub state: HealthState,
    pub consecutive_error_count: u32,
    pub is_failed: bool,
    pub can_retry: bool,
    pub cooldown_remaining_secs: Option<u64>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub last_seen: String,
    pub last_error_ago: String,
}

// ---------------------------------------------------------------------------
// Internal per-device state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Tracked {
    consecutive_errors: u32,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<DateTime<Utc>>,
    /// Monotonic twin of `last_error`; the cooldown is measured against it.
    last_error_at: Option<Instant>,
    last_error_message: Option<String>,
    probe_in_flight: bool,
}

impl Tracked {
    fn state(&self, policy: &HealthPolicy, now: Instant) -> HealthState {
        if self.consecutive_errors < policy.max_consecutive_errors {
            return HealthState::Healthy;
        }
        match self.last_error_at {
            Some(at) if now.saturating_duration_since(at) < policy.retry_cooldown => {
                HealthState::Failed
            }
            _ => HealthState::FailedRetryEligible,
        }
    }

    fn cooldown_remaining(&self, policy: &HealthPolicy, now: Instant) -> Duration {
        self.last_error_at
            .map(|at| {
                policy
                    .retry_cooldown
                    .saturating_sub(now.saturating_duration_since(at))
            })
            .unwrap_or_default()
    }
}

fn lock(slot: &Mutex<Tracked>) -> MutexGuard<'_, Tracked> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the probe flag if a probe is dropped before it reports.
struct ProbeSlot<'a> {
    slot: &'a Mutex<Tracked>,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        lock(self.slot).probe_in_flight = false;
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

pub struct HealthTracker {
    policy: HealthPolicy,
    // One mutex per device: a slow report on A never waits on B.
    devices: BTreeMap<String, Mutex<Tracked>>,
}

impl HealthTracker {
    pub fn new<I, S>(policy: HealthPolicy, device_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let devices = device_ids
            .into_iter()
            .map(|id| (id.into(), Mutex::new(Tracked::default())))
            .collect();
        Self { policy, devices }
    }

    fn slot(&self, device_id: &str) -> Result<&Mutex<Tracked>, DeviceError> {
        self.devices
            .get(device_id)
            .ok_or_else(|| DeviceError::NotInitialized(format!("no device '{device_id}'")))
    }

    /// Run `operation` unless the device is short-circuited, and record the
    /// outcome.
    pub async fn guard<T, F, Fut>(&self, device_id: &str, operation: F) -> Result<T, DeviceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, DeviceError>>,
    {
        let slot = self.slot(device_id)?;

        // ── Admission ───────────────────────────────────────
        let _probe = {
            let mut t = lock(slot);
            let now = Instant::now();
            match t.state(&self.policy, now) {
                HealthState::Healthy => None,
                HealthState::Failed => {
                    return Err(DeviceError::cooling_down(
                        t.cooldown_remaining(&self.policy, now),
                    ));
                }
                HealthState::FailedRetryEligible if t.probe_in_flight => {
                    return Err(DeviceError::Unreachable {
                        reason: "retry probe already in progress".into(),
                        cooldown_remaining: Some(Duration::ZERO),
                    });
                }
                HealthState::FailedRetryEligible => {
                    t.probe_in_flight = true;
                    info!(device = %device_id, "cooldown elapsed, probing failed device");
                    Some(ProbeSlot { slot })
                }
            }
        };

        // ── Operation ───────────────────────────────────────
        let outcome = operation().await;
        match &outcome {
            Ok(_) => self.report_success(device_id),
            Err(e) => self.report_failure(device_id, &e.to_string()),
        }
        outcome
    }

    pub fn report_success(&self, device_id: &str) {
        let Ok(slot) = self.slot(device_id) else {
            return;
        };
        let mut t = lock(slot);
        if t.consecutive_errors >= self.policy.max_consecutive_errors {
            info!(
                device = %device_id,
                after_errors = t.consecutive_errors,
                "device recovered"
            );
        }
        t.consecutive_errors = 0;
        t.last_success = Some(Utc::now());
    }

    pub fn report_failure(&self, device_id: &str, message: &str) {
        let Ok(slot) = self.slot(device_id) else {
            return;
        };
        let mut t = lock(slot);
        t.consecutive_errors = t.consecutive_errors.saturating_add(1);
        t.last_error = Some(Utc::now());
        t.last_error_at = Some(Instant::now());
        t.last_error_message = Some(message.to_string());

        let max = self.policy.max_consecutive_errors;
        if t.consecutive_errors == max {
            error!(
                device = %device_id,
                errors = t.consecutive_errors,
                cooldown_sec = self.policy.retry_cooldown.as_secs(),
                error = %message,
                "device marked FAILED"
            );
        } else if t.consecutive_errors > max {
            warn!(device = %device_id, error = %message, "retry failed, cooldown restarted");
        } else {
            warn!(
                device = %device_id,
                errors = t.consecutive_errors,
                max,
                error = %message,
                "device error"
            );
        }
    }

    pub fn state(&self, device_id: &str) -> Option<HealthState> {
        let slot = self.devices.get(device_id)?;
        Some(lock(slot).state(&self.policy, Instant::now()))
    }

    pub fn record(&self, device_id: &str) -> Option<HealthRecord> {
        let slot = self.devices.get(device_id)?;
        Some(self.build_record(device_id, &lock(slot), Instant::now(), Utc::now()))
    }

    /// Copy of every device's health record, keyed by device id.
    pub fn snapshot(&self) -> BTreeMap<String, HealthRecord> {
        let now = Instant::now();
        let wall = Utc::now();
        self.devices
            .iter()
            .map(|(id, slot)| (id.clone(), self.build_record(id, &lock(slot), now, wall)))
            .collect()
    }

    fn build_record(
        &self,
        device_id: &str,
        t: &Tracked,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> HealthRecord {
        let state = t.state(&self.policy, now);
        let cooldown_remaining_secs = match state {
            HealthState::Failed => Some(t.cooldown_remaining(&self.policy, now).as_secs()),
            _ => None,
        };
        HealthRecord {
            device_id: device_id.to_string(),
            state,
            consecutive_error_count: t.consecutive_errors,
            is_failed: state != HealthState::Healthy,
            can_retry: state != HealthState::Failed,
            cooldown_remaining_secs,
            last_success_time: t.last_success,
            last_error_time: t.last_error,
            last_error_message: t.last_error_message.clone(),
            last_seen: ago(t.last_success, wall),
            last_error_ago: ago(t.last_error, wall),
        }
    }
}

fn ago(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    match at {
        Some(at) => format_ago((now - at).num_seconds()),
        None => "never".to_string(),
    }
}

/// Compact "time ago" string for the status surface.
pub fn format_ago(secs: i64) -> String {
    let secs = secs.max(0);
    match secs {
        s if s < 60 => format!("{s}s ago"),
        s if s < 3600 => format!("{}m ago", s / 60),
        s if s < 86_400 => format!("{}h ago", s / 3600),
        s => format!("{}d ago", s / 86_400),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tracker() -> HealthTracker {
        HealthTracker::new(HealthPolicy::default(), ["R1", "S2"])
    }

    async fn fail_once(t: &HealthTracker, id: &str, calls: &AtomicUsize) -> DeviceError {
        t.guard(id, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(DeviceError::unreachable("connection refused"))
        })
        .await
        .unwrap_err()
    }

    async fn succeed_once(t: &HealthTracker, id: &str, calls: &AtomicUsize) {
        t.guard(id, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
    }

    // -- Threshold + short-circuit ----------------------------------------

    #[tokio::test(start_paused = true)]
    async fn failed_after_threshold_and_short_circuits() {
        let t = tracker();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let err = fail_once(&t, "S2", &calls).await;
            assert!(!err.is_cooldown());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let rec = t.record("S2").unwrap();
        assert!(rec.is_failed);
        assert_eq!(rec.state, HealthState::Failed);
        assert_eq!(rec.consecutive_error_count, 3);
        assert!(!rec.can_retry);

        // 4th call within the cooldown never reaches the device.
        let err = fail_once(&t, "S2", &calls).await;
        assert!(err.is_cooldown());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn success_before_threshold_resets_counter() {
        let t = tracker();
        let calls = AtomicUsize::new(0);

        fail_once(&t, "R1", &calls).await;
        fail_once(&t, "R1", &calls).await;
        succeed_once(&t, "R1", &calls).await;
        fail_once(&t, "R1", &calls).await;
        fail_once(&t, "R1", &calls).await;

        let rec = t.record("R1").unwrap();
        assert_eq!(rec.consecutive_error_count, 2);
        assert!(!rec.is_failed);
    }

    // -- Cooldown ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn probe_after_cooldown_success_resets() {
        let t = tracker();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            fail_once(&t, "S2", &calls).await;
        }

        tokio::time::advance(DEFAULT_RETRY_COOLDOWN).await;
        assert_eq!(t.state("S2"), Some(HealthState::FailedRetryEligible));

        succeed_once(&t, "S2", &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let rec = t.record("S2").unwrap();
        assert_eq!(rec.consecutive_error_count, 0);
        assert!(!rec.is_failed);
        assert_eq!(rec.state, HealthState::Healthy);
        assert!(rec.last_success_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_restarts_cooldown() {
        let t = tracker();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            fail_once(&t, "S2", &calls).await;
        }

        tokio::time::advance(DEFAULT_RETRY_COOLDOWN + Duration::from_secs(1)).await;
        let err = fail_once(&t, "S2", &calls).await;
        assert!(!err.is_cooldown(), "probe must hit the device");
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        tokio::time::advance(Duration::from_secs(150)).await;
        let err = fail_once(&t, "S2", &calls).await;
        assert!(err.is_cooldown());
        assert_eq!(err.cooldown_remaining(), Some(Duration::from_secs(150)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_probe_in_flight() {
        let t = tracker();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            fail_once(&t, "S2", &calls).await;
        }
        tokio::time::advance(DEFAULT_RETRY_COOLDOWN).await;

        let slow = t.guard("S2", || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        });
        let eager = t.guard("S2", || async { Ok(()) });
        let (slow, eager) = tokio::join!(slow, eager);

        assert!(slow.is_ok());
        assert!(eager.unwrap_err().is_cooldown());
        assert_eq!(t.state("S2"), Some(HealthState::Healthy));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_probe_frees_the_slot() {
        let t = tracker();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            fail_once(&t, "S2", &calls).await;
        }
        tokio::time::advance(DEFAULT_RETRY_COOLDOWN).await;

        let hung = t.guard("S2", || async {
            std::future::pending::<()>().await;
            Ok(())
        });
        assert!(tokio::time::timeout(Duration::from_millis(50), hung)
            .await
            .is_err());

        // The abandoned probe did not wedge the device.
        succeed_once(&t, "S2", &calls).await;
        assert_eq!(t.state("S2"), Some(HealthState::Healthy));
    }

    // -- Isolation --------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn devices_are_independent() {
        let t = tracker();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            fail_once(&t, "S2", &calls).await;
        }
        succeed_once(&t, "R1", &calls).await;

        let snap = t.snapshot();
        assert!(snap["S2"].is_failed);
        assert!(!snap["R1"].is_failed);
        assert_eq!(snap["R1"].last_error_ago, "never");
    }

    #[tokio::test]
    async fn unknown_device_is_not_initialized() {
        let t = tracker();
        let err = t
            .guard("nope", || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::NotInitialized(_)));
    }

    // -- Formatting -------------------------------------------------------

    #[test]
    fn format_ago_units() {
        assert_eq!(format_ago(-5), "0s ago");
        assert_eq!(format_ago(42), "42s ago");
        assert_eq!(format_ago(125), "2m ago");
        assert_eq!(format_ago(7200), "2h ago");
        assert_eq!(format_ago(3 * 86_400 + 5), "3d ago");
    }
}
