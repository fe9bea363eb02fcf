//! Time-driven schedule execution.
//!
//! Every `check_interval` the loop re-reads the schedule file and evaluates
//! each trigger against the local wall clock. A due trigger starts only when
//! the exclusive-run slot is free and the humidity gate allows it; triggers
//! that cannot start are dropped for the day, never queued.
//!
//! ## Per-trigger flow within one cycle
//!
//! ```text
//! not due / handled this minute ──▶ ignore
//! due ──[slot busy]──────────────▶ skip (logged)
//!     ──[humidity > threshold]───▶ skip (journaled + last_skipped)
//!     ──[acquire ok]─────────────▶ mark last_run ──▶ spawn program
//! ```
//!
//! A program runs its steps strictly in sequence as pulses. A failing step is
//! journaled and skipped; a stop request abandons the rest and turns
//! everything off. The run slot is released on every exit path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{Local, NaiveDateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::device::PulseOutcome;
use crate::run::RunHandle;
use crate::state::SharedState;
use crate::store::{SkipRecord, SkipSummary, TIMESTAMP_FORMAT};
use crate::trigger::{handled_this_minute, Trigger};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What one cycle decided. Started programs carry their task handles.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub started: Vec<(String, JoinHandle<ProgramReport>)>,
    pub skipped_busy: Vec<String>,
    pub skipped_humidity: Vec<String>,
    pub invalid: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProgramReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub stopped: bool,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    app: SharedState,
    /// Last reported problem per schedule id, so a broken record is logged
    /// once rather than every cycle.
    invalid_reported: Mutex<HashMap<u64, String>>,
}

impl Scheduler {
    pub fn new(app: SharedState) -> Arc<Self> {
        Arc::new(Self {
            app,
            invalid_reported: Mutex::new(HashMap::new()),
        })
    }

    /// Run the loop until `shutdown` fires. Intended to be `tokio::spawn`-ed
    /// from main.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_sec = interval.as_secs(), "scheduler started");
        self.app
            .record_scheduler("scheduler started".to_string())
            .await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => {
                    info!("scheduler shutting down");
                    break;
                }
            }

            let now = Local::now().naive_local();
            let this = Arc::clone(&self);
            // A panic inside the cycle surfaces as a JoinError instead of
            // unwinding through the loop.
            match tokio::spawn(async move { this.run_cycle(now).await }).await {
                Ok(report) => {
                    if !report.started.is_empty() || !report.skipped_humidity.is_empty() {
                        debug!(
                            started = report.started.len(),
                            skipped_humidity = report.skipped_humidity.len(),
                            skipped_busy = report.skipped_busy.len(),
                            "scheduler cycle"
                        );
                    }
                }
                Err(e) => {
                    error!(error = %e, "scheduler cycle failed");
                    self.app
                        .record_error(format!("scheduler cycle failed: {e}"))
                        .await;
                    self.recover().await;
                }
            }
        }
    }

    async fn recover(&self) {
        if self.app.runs.is_active() {
            return;
        }
        let failures = self.app.registry.all_off().await;
        if !failures.is_empty() {
            error!(failed = failures.len(), "all-off after cycle fault incomplete");
        }
    }

    // ── One cycle ───────────────────────────────────────────────────────

    pub async fn run_cycle(&self, now: NaiveDateTime) -> CycleReport {
        let app = &self.app;
        let mut report = CycleReport::default();
        let mut records = app.storage.schedules.load();

        for idx in 0..records.len() {
            let trigger = match Trigger::try_from(&records[idx]) {
                Ok(t) => {
                    self.clear_invalid(t.id);
                    t
                }
                Err(e) => {
                    report.invalid += 1;
                    self.report_invalid(e.id, e.to_string());
                    continue;
                }
            };
            if !trigger.is_due(now) || handled_this_minute(&records[idx], now) {
                continue;
            }
            let program = trigger.program_name.clone();

            // ── Guard: exclusive slot ──────────────────────
            if let Some(holder) = app.runs.snapshot().label {
                info!(%program, running = %holder, "run already active, trigger skipped");
                report.skipped_busy.push(program);
                continue;
            }

            // ── Guard: humidity ────────────────────────────
            let reading = app.sensor.read().await;
            if app.sensor.skip_for(&reading) {
                let humidity = reading.humidity.unwrap_or_default();
                let time = now.format(TIMESTAMP_FORMAT).to_string();
                info!(
                    %program,
                    humidity,
                    threshold = app.sensor.settings().humidity_skip_threshold,
                    "humidity above threshold, program skipped"
                );
                let skip = SkipRecord {
                    time: time.clone(),
                    schedule_id: trigger.id,
                    schedule_name: program.clone(),
                    humidity,
                    temp: reading.temperature,
                };
                if let Err(e) = app.storage.skipped_runs.append(skip) {
                    error!(error = %format!("{e:#}"), "could not journal skipped run");
                }
                let summary = SkipSummary {
                    time,
                    humidity,
                    temp: reading.temperature,
                };
                if let Err(e) = app
                    .storage
                    .schedules
                    .mark_skipped(&mut records, trigger.id, summary)
                {
                    error!(error = %format!("{e:#}"), "could not record last_skipped");
                }
                app.record_scheduler(format!("{program} skipped: humidity {humidity:.1}%"))
                    .await;
                report.skipped_humidity.push(program);
                continue;
            }

            // ── Acquire + launch ───────────────────────────
            let handle = match app.runs.try_acquire(&program) {
                Ok(h) => h,
                Err(busy) => {
                    info!(%program, running = %busy.label, "run slot taken, trigger skipped");
                    report.skipped_busy.push(program);
                    continue;
                }
            };
            if let Err(e) = app
                .storage
                .schedules
                .mark_last_run(&mut records, trigger.id, now)
            {
                error!(error = %format!("{e:#}"), %program, "could not record last_run");
            }
            if let Ok(d) = chrono::Duration::from_std(trigger.total_duration()) {
                app.runs.set_planned_end(&handle, Some(Utc::now() + d));
            }
            info!(%program, steps = trigger.steps.len(), "starting scheduled program");
            app.record_scheduler(format!("{program} started")).await;

            let task = tokio::spawn(execute_program(SharedState::clone(app), trigger, handle));
            report.started.push((program, task));
        }

        report
    }

    fn report_invalid(&self, id: u64, message: String) {
        let mut seen = self
            .invalid_reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if seen.get(&id) != Some(&message) {
            warn!(schedule = id, error = %message, "ignoring invalid schedule");
            seen.insert(id, message);
        }
    }

    fn clear_invalid(&self, id: u64) {
        self.invalid_reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

// ---------------------------------------------------------------------------
// Program execution
// ---------------------------------------------------------------------------

/// Run every step of `trigger` in order. Owns `handle`, so the slot is freed
/// when this returns or unwinds.
pub async fn execute_program(app: SharedState, trigger: Trigger, handle: RunHandle) -> ProgramReport {
    let mut report = ProgramReport::default();
    let program = trigger.program_name.as_str();
    let total = trigger.steps.len();

    for (i, step) in trigger.steps.iter().enumerate() {
        if handle.is_stop_requested() {
            report.stopped = true;
            break;
        }
        let desc = format!("{}/{total}: {} ({}m)", i + 1, step.device_id, step.minutes());
        info!(%program, step = %desc, "program step");
        app.runs.update_step(&handle, desc);

        match app
            .pulse_zone(&step.device_id, step.duration, handle.cancel_token())
            .await
        {
            Ok(PulseOutcome::Completed) => report.completed.push(step.device_id.clone()),
            Ok(PulseOutcome::Interrupted) => {
                report.stopped = true;
                break;
            }
            Err(e) => {
                error!(%program, device = %step.device_id, error = %e, "step failed, continuing");
                report.failed.push(step.device_id.clone());
            }
        }
    }

    if report.stopped {
        info!(%program, "program stopped");
        let failures = app.registry.all_off().await;
        for (device_id, e) in &failures {
            app.record_hardware_error(device_id, "all_off", e).await;
        }
        app.record_scheduler(format!("{program} stopped")).await;
    } else {
        info!(
            %program,
            completed = report.completed.len(),
            failed = report.failed.len(),
            "program finished"
        );
        app.record_scheduler(format!(
            "{program} finished ({} ok, {} failed)",
            report.completed.len(),
            report.failed.len()
        ))
        .await;
    }

    app.runs.release(handle);
    report
}

// ===========================================================================
// Tests
// ===========================================================================
