mod commands;
mod config;
mod device;
mod error;
mod health;
mod netswitch;
mod relay;
mod run;
mod scheduler;
mod sensor;
mod state;
mod store;
mod trigger;
mod web;

#[cfg(test)]
mod testutil;

use anyhow::Result;
use std::{env, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use scheduler::Scheduler;
use state::{AppState, SharedState};
use store::Storage;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    if cfg.device_count() == 0 {
        warn!(path = %config_path, "no devices configured");
    }

    // ── Devices ─────────────────────────────────────────────────────
    let registry = Arc::new(config::build_registry(&cfg)?);
    let ids: Vec<String> = registry.device_ids().map(str::to_string).collect();
    for id in &ids {
        match registry.probe(id).await {
            Ok(detail) => info!(device = %id, %detail, "device probe ok"),
            Err(e) => warn!(device = %id, error = %e, "device probe failed"),
        }
    }
    // Start from a known state: every zone closed.
    for (id, e) in registry.all_off().await {
        error!(device = %id, error = %e, "startup all-off failed");
    }

    // ── Sensor + storage ────────────────────────────────────────────
    let sensor = config::build_sensor_gate(&cfg)?;
    let storage = Storage::open(&cfg.controller.data_dir)?;
    info!(
        data_dir = %cfg.controller.data_dir.display(),
        schedules = storage.schedules.load().len(),
        "storage ready"
    );

    // ── Shared state ────────────────────────────────────────────────
    let shared: SharedState = Arc::new(AppState::new(registry, sensor, storage));
    shared.record_system("hub started".to_string()).await;

    let shutdown = CancellationToken::new();

    // ── Scheduler ───────────────────────────────────────────────────
    let sched = Scheduler::new(SharedState::clone(&shared));
    let sched_task = tokio::spawn(sched.run(cfg.check_interval(), shutdown.clone()));

    // ── Web server ──────────────────────────────────────────────────
    let web_state = SharedState::clone(&shared);
    let port = web::resolve_port(cfg.controller.web_port);
    let web_shutdown = shutdown.clone();
    let web_task = tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, port, web_shutdown.clone()).await {
            error!(error = %format!("{e:#}"), "web server stopped");
            web_shutdown.cancel();
        }
    });

    // ── Shutdown ────────────────────────────────────────────────────
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!(error = %e, "signal handler failed");
            }
            info!("shutdown requested");
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();

    let failures = commands::stop_all(&shared).await;
    if !failures.is_empty() {
        error!(failed = failures.len(), "some devices may still be on");
    }
    let _ = tokio::join!(sched_task, web_task);
    info!("hub stopped");
    Ok(())
}
