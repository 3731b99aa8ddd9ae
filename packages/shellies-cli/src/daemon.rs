//! Agent mode: keep the device inventory fresh until told to stop.
//!
//! - Loads the last snapshot into a fresh registry
//! - Announces the configured devices and polls everything that shows up
//! - Re-polls stale devices in the background
//! - Handles graceful shutdown via SIGTERM/SIGINT

use anyhow::{Context, Result};
use shellies_core::config::{AgentConfig, local_interface_address};
use shellies_core::{HttpFetcher, Reconciler, Registry, SnapshotStore, discovery};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Run the agent in the foreground
pub async fn run_daemon(config: AgentConfig) -> Result<()> {
    match config.interface.as_deref().and_then(local_interface_address) {
        Some(addr) => tracing::info!("Listen for shellies on {}", addr),
        None => tracing::info!("Listen for shellies on all interfaces"),
    }

    let snapshots = Arc::new(SnapshotStore::new(&config.cache_file));
    let registry = Arc::new(Registry::from_records(snapshots.load()));
    let fetcher = HttpFetcher::new(config.fetch_timeout, config.credentials.clone())?;

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    let reconciler = Arc::new(
        Reconciler::new(
            registry.clone(),
            snapshots.clone(),
            fetcher,
            config.scheduler.clone(),
        )
        .with_shutdown(shutdown.clone()),
    );

    tracing::info!(
        "Starting agent: {} known devices, snapshot at {:?}",
        registry.len(),
        snapshots.path()
    );

    let (sender, events) = discovery::channel();
    let run = tokio::spawn(reconciler.clone().run(events));

    discovery::announce_static_hosts(&config.static_hosts, &sender).await;

    shutdown.cancelled().await;
    reconciler.shutdown();
    drop(sender);

    run.await.context("Reconciler task panicked")?;

    match snapshots.save_registry(&registry) {
        Ok(count) => tracing::info!("Saved {} devices", count),
        Err(e) => tracing::error!("Final snapshot failed: {}", e),
    }

    tracing::info!("Agent stopped");
    Ok(())
}

/// Cancel `shutdown` on SIGTERM or SIGINT
fn setup_signal_handlers(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                let shutdown_term = shutdown.clone();
                tokio::spawn(async move {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, shutting down");
                    shutdown_term.cancel();
                });
            }
            Err(e) => tracing::warn!("Failed to register SIGTERM handler: {}", e),
        }
    }

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received Ctrl+C, shutting down");
                shutdown.cancel();
            }
            Err(e) => tracing::warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });
}
