//! Manual zone commands. They compete with the scheduler for the same
//! exclusive-run slot and are rejected immediately when it is taken.

use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::device::PulseOutcome;
use crate::error::{CommandError, DeviceError};
use crate::state::SharedState;

/// Upper bound for a manual pulse.
pub const MAX_PULSE: Duration = Duration::from_secs(3600);

fn zone_name(app: &SharedState, device_id: &str) -> Result<String, CommandError> {
    app.zone_name(device_id)
        .ok_or_else(|| CommandError::UnknownDevice(device_id.to_string()))
}

/// Open one zone and keep the run slot until it is switched off again.
pub async fn turn_on(app: &SharedState, device_id: &str) -> Result<(), CommandError> {
    let name = zone_name(app, device_id)?;
    let handle = app.runs.try_acquire(format!("Manual {name}"))?;
    app.runs.update_step(&handle, format!("manual: {device_id}"));
    let stop = handle.cancel_token();

    if let Err(e) = app.registry.exclusive_on(device_id).await {
        app.record_hardware_error(device_id, "manual_on", &e).await;
        // Dropping the handle releases the slot.
        return Err(CommandError::device(device_id, e));
    }

    // Hold first, then check: a stop that lands after the check also sees
    // the hold and releases it.
    app.hold_manual(device_id, handle);
    if stop.is_cancelled() {
        app.release_manual_for(device_id);
        if let Err(e) = app.registry.turn_off(device_id).await {
            app.record_hardware_error(device_id, "manual_off", &e).await;
        }
        info!(device = %device_id, "stop arrived while switching on, zone closed");
        return Err(CommandError::Stopped(device_id.to_string()));
    }
    app.record_valve(device_id, true).await;
    Ok(())
}

/// Close one zone. Always permitted, even while a program runs.
pub async fn turn_off(app: &SharedState, device_id: &str) -> Result<(), CommandError> {
    zone_name(app, device_id)?;

    if let Err(e) = app.registry.turn_off(device_id).await {
        app.record_hardware_error(device_id, "manual_off", &e).await;
        return Err(CommandError::device(device_id, e));
    }

    if app.release_manual_for(device_id) {
        info!(device = %device_id, "manual hold released");
    }
    app.record_valve(device_id, false).await;
    Ok(())
}

/// Open one zone for `secs` seconds, holding the slot for the duration.
pub async fn pulse(
    app: &SharedState,
    device_id: &str,
    secs: f64,
) -> Result<PulseOutcome, CommandError> {
    let name = zone_name(app, device_id)?;
    if !secs.is_finite() || secs <= 0.0 || secs > MAX_PULSE.as_secs_f64() {
        return Err(CommandError::InvalidRequest(format!(
            "secs must be in (0, {}], got {secs}",
            MAX_PULSE.as_secs()
        )));
    }
    let duration = Duration::from_secs_f64(secs);

    let handle = app.runs.try_acquire(format!("Manual {name}"))?;
    app.runs.update_step(&handle, format!("pulse: {device_id} ({secs}s)"));
    if let Ok(d) = chrono::Duration::from_std(duration) {
        app.runs.set_planned_end(&handle, Some(Utc::now() + d));
    }

    // The handle moves into the task so the slot stays held until the valve
    // is off, even if this request is abandoned.
    let task_app = SharedState::clone(app);
    let id = device_id.to_string();
    let task = tokio::spawn(async move {
        let outcome = task_app
            .pulse_zone(&id, duration, handle.cancel_token())
            .await;
        drop(handle);
        outcome
    });

    match task.await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => Err(CommandError::device(device_id, e)),
        Err(e) => Err(CommandError::device(
            device_id,
            DeviceError::protocol(format!("pulse task failed: {e}")),
        )),
    }
}

/// Stop whatever is running and switch every zone off. Returns per-device
/// failures.
pub async fn stop_all(app: &SharedState) -> Vec<(String, DeviceError)> {
    if let Some(label) = app.runs.request_stop() {
        app.record_system(format!("stop requested for {label}")).await;
    }
    let failures = app.registry.all_off().await;
    for (device_id, e) in &failures {
        app.record_hardware_error(device_id, "all_off", e).await;
    }
    if app.release_manual() {
        info!("manual hold released by stop");
    }
    if failures.is_empty() {
        app.record_system("all zones off".to_string()).await;
    } else {
        warn!(failed = failures.len(), "stop-all left devices in unknown state");
    }
    failures
}

// ===========================================================================
// Tests
// ===========================================================================
