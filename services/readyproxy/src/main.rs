//! readyproxy
//!
//! Liveness-gated TCP forwarding proxy.
//!
//! This service:
//! - Optionally launches the backend it fronts
//! - Accepts TCP connections on every configured port mapping
//! - Answers configured health-check requests itself
//! - Forwards connections to the backend once it accepts connections
//! - Sends a placeholder response while the backend is unavailable

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use readyproxy::{
    BackendProcess, Cli, Dispatcher, LogFormat, MappingListener, PlaceholderMode,
    ShutdownCoordinator,
};

#[tokio::main]
async fn main() -> Result<()> {
    let (config, skipped) = Cli::parse()
        .into_config()
        .context("invalid configuration")?;

    init_tracing(&config.log_level, config.log_format);

    info!("Starting readyproxy");
    for e in &skipped {
        warn!(error = %e, "Skipping malformed port mapping");
    }
    info!(
        mapping_count = config.mappings.len(),
        target_host = %config.proxy.target_host,
        health_check = config.proxy.health_check.is_some(),
        placeholder_http = config.proxy.placeholder.mode == PlaceholderMode::Http,
        shutdown_grace_secs = config.shutdown_grace.as_secs(),
        "Configuration loaded"
    );

    let coordinator = ShutdownCoordinator::new();
    // Separate flag so the backend outlives the session drain.
    let backend_stop = ShutdownCoordinator::new();

    let backend_task = if config.backend_command.is_empty() {
        None
    } else {
        let backend =
            BackendProcess::spawn(&config.backend_command).context("failed to start backend")?;
        Some(tokio::spawn(
            backend.supervise(backend_stop.signal(), config.shutdown_grace),
        ))
    };

    let dispatcher = Dispatcher::new(config.proxy.clone());
    let mut listener_handles = Vec::new();
    let mut listener_stats = Vec::new();

    for mapping in &config.mappings {
        match MappingListener::bind(*mapping, dispatcher.clone(), coordinator.signal()).await {
            Ok(listener) => {
                listener_stats.push(listener.stats());
                listener_handles.push(tokio::spawn(listener.run()));
            }
            Err(e) => {
                error!(mapping = %mapping, error = %e, "Failed to bind listener");
            }
        }
    }

    if listener_handles.is_empty() {
        backend_stop.trigger();
        if let Some(task) = backend_task {
            if let Err(e) = task.await {
                error!(error = %e, "Backend supervisor task failed");
            }
        }
        bail!("no listener could be bound");
    }

    info!(listener_count = listener_handles.len(), "Proxy running");

    if let Err(e) = coordinator.run_signal_handler().await {
        error!(error = %e, "Failed to wait for termination signal");
        coordinator.trigger();
    }

    for handle in listener_handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Listener task failed");
        }
    }

    let deadline = Instant::now() + config.shutdown_grace;
    let mut drained = true;
    for stats in &listener_stats {
        drained &= stats.wait_idle(deadline).await;
    }
    if !drained {
        let active: u64 = listener_stats.iter().map(|s| s.active()).sum();
        warn!(active, "Shutdown grace period elapsed with sessions still active");
    }

    backend_stop.trigger();
    if let Some(task) = backend_task {
        if let Err(e) = task.await {
            error!(error = %e, "Backend supervisor task failed");
        }
    }

    info!("readyproxy stopped");
    Ok(())
}

/// Install the global subscriber (prefer RUST_LOG, fallback to the configured level).
fn init_tracing(log_level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
