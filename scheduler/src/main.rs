// Yard dispatch scheduler entry point

use anyhow::{Context, Result};
use common::auth::AuthContext;
use common::bootstrap::init_entity_store;
use common::clock::SystemClock;
use common::config::Settings;
use common::fanout::{spawn_event_logger, EventBus, FanOut};
use common::scheduler::{SchedulerEngine, SchedulerSupervisor};
use common::telemetry;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings.validate().context("Invalid configuration")?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;
    info!("Starting yard dispatch scheduler");

    telemetry::init_metrics(settings.observability.metrics_port)?;

    info!(
        backend = ?settings.store.backend,
        poll_interval_seconds = settings.scheduler.poll_interval_seconds,
        timezone = %settings.scheduler.timezone,
        "Configuration loaded"
    );

    let store = init_entity_store(&settings).await?;

    let bus = Arc::new(EventBus::default());
    let event_logger = spawn_event_logger(&bus);

    let engine = Arc::new(SchedulerEngine::new(
        settings.scheduler_config()?,
        store,
        FanOut::from_bus(bus.clone()),
        Arc::new(SystemClock),
    ));
    let supervisor = SchedulerSupervisor::new(engine, settings.auth.policy());

    let (auth_tx, auth_rx) = watch::channel(settings.auth.context());
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let supervisor_task = tokio::spawn(async move { supervisor.run(auth_rx, shutdown_rx).await });

    wait_for_shutdown(&auth_tx).await?;

    info!("Initiating graceful shutdown");
    if shutdown_tx.send(()).is_err() {
        warn!("Supervisor already stopped");
    }
    if let Err(e) = supervisor_task.await {
        error!(error = %e, "Supervisor task ended abnormally");
    }
    event_logger.abort();
    telemetry::shutdown_tracer();

    info!("Scheduler stopped");
    Ok(())
}

/// Block until Ctrl+C or SIGTERM; SIGHUP reloads the auth context
#[cfg(unix)]
async fn wait_for_shutdown(auth_tx: &watch::Sender<AuthContext>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to listen for SIGHUP")?;
    let mut terminate = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;

    loop {
        tokio::select! {
            _ = hangup.recv() => reload_auth_context(auth_tx),
            _ = terminate.recv() => {
                info!("Received SIGTERM");
                return Ok(());
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C");
                return Ok(());
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_auth_tx: &watch::Sender<AuthContext>) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C");
    Ok(())
}

/// Re-read settings and publish the auth context if it changed
///
/// A configuration that fails to load or validate keeps the current context.
#[cfg_attr(not(unix), allow(dead_code))]
fn reload_auth_context(auth_tx: &watch::Sender<AuthContext>) {
    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "Failed to reload configuration");
            return;
        }
    };
    if let Err(e) = settings.validate() {
        error!(error = %e, "Reloaded configuration is invalid, keeping current auth context");
        return;
    }

    let next = settings.auth.context();
    let changed = auth_tx.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next.clone();
            true
        }
    });
    info!(
        changed,
        authenticated = next.is_authenticated,
        role = %next.role,
        "Auth context reloaded"
    );
}
