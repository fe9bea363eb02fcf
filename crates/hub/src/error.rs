//! Error taxonomy shared by the device, scheduling, and command layers.
//!
//! Plumbing (config, file storage, startup) uses `anyhow`; everything a
//! caller must branch on is a typed error here.

use std::time::Duration;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Device errors
// ---------------------------------------------------------------------------

/// Failure of a single actuator call, normalised across device kinds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Connection refused, I/O failure, or a short-circuit by the health
    /// tracker. `cooldown_remaining` is set only for the short-circuit case.
    #[error("unreachable: {reason}")]
    Unreachable {
        reason: String,
        cooldown_remaining: Option<Duration>,
    },
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("not initialized: {0}")]
    NotInitialized(String),
}

impl DeviceError {
    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::Unreachable {
            reason: reason.into(),
            cooldown_remaining: None,
        }
    }

    /// Synthetic error returned while a failed device waits out its cooldown.
    pub fn cooling_down(remaining: Duration) -> Self {
        Self::Unreachable {
            reason: format!(
                "device marked failed, next retry in {}s",
                remaining.as_secs()
            ),
            cooldown_remaining: Some(remaining),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// True when the error came from the health tracker rather than the device.
    pub fn is_cooldown(&self) -> bool {
        matches!(
            self,
            Self::Unreachable {
                cooldown_remaining: Some(_),
                ..
            }
        )
    }

    pub fn cooldown_remaining(&self) -> Option<Duration> {
        match self {
            Self::Unreachable {
                cooldown_remaining, ..
            } => *cooldown_remaining,
            _ => None,
        }
    }

    /// Short tag stored in the hardware error journal.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unreachable {
                cooldown_remaining: Some(_),
                ..
            } => "cooldown",
            Self::Unreachable { .. } => "unreachable",
            Self::Timeout(_) => "timeout",
            Self::Protocol(_) => "protocol",
            Self::NotInitialized(_) => "not_initialized",
        }
    }
}

/// Which half of a pulse failed. An activation failure leaves the device
/// commanded off; a deactivation failure means it may still be open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PulseError {
    #[error("activation failed: {0}")]
    Activation(DeviceError),
    #[error("deactivation failed: {0}")]
    Deactivation(DeviceError),
}

impl PulseError {
    pub fn device_error(&self) -> &DeviceError {
        match self {
            Self::Activation(e) | Self::Deactivation(e) => e,
        }
    }

    /// Journal tag, e.g. `activation_failed`.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Activation(_) => "activation_failed",
            Self::Deactivation(_) => "deactivation_failed",
        }
    }
}

impl From<PulseError> for DeviceError {
    fn from(err: PulseError) -> Self {
        match err {
            PulseError::Activation(e) | PulseError::Deactivation(e) => e,
        }
    }
}

// ---------------------------------------------------------------------------
// Run slot + scheduling
// ---------------------------------------------------------------------------

/// The exclusive-run slot is already held. Expected contention, not a fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("already running: {label}")]
pub struct AlreadyRunning {
    pub label: String,
}

/// A persisted schedule record that cannot be turned into a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("schedule {id} ('{program}'): {reason}")]
pub struct ScheduleEvaluationError {
    pub id: u64,
    pub program: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Manual commands
// ---------------------------------------------------------------------------

/// Outcome of a rejected manual command. Each variant renders as a distinct
/// HTTP status in the API layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown zone '{0}'")]
    UnknownDevice(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    AlreadyRunning(#[from] AlreadyRunning),
    #[error("stop requested while switching '{0}' on")]
    Stopped(String),
    #[error("zone '{device_id}': {source}")]
    Device {
        device_id: String,
        #[source]
        source: DeviceError,
    },
}

impl CommandError {
    pub fn device(device_id: &str, source: impl Into<DeviceError>) -> Self {
        Self::Device {
            device_id: device_id.to_string(),
            source: source.into(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
