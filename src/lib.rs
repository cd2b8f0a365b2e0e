pub mod auth;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod monitor;
pub mod plugins;
pub mod rate_limit;
pub mod routes;
pub mod security;
pub mod state;
pub mod transform;
pub mod utils;

use crate::config::GatewayConfig;
use crate::gateway::health::HealthChecker;
use crate::state::AppState;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Build state, start background tasks and serve until shutdown.
pub async fn run(config: GatewayConfig) -> Result<()> {
    let bind_address = format!("{}:{}", config.host, config.port);
    let state = AppState::build(config).await?;

    seed_admin_user(&state).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background_tasks = spawn_background_tasks(&state, shutdown_rx);

    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    tracing::info!(
        address = %bind_address,
        services = state.services.services().len(),
        "Gateway listening"
    );

    let drain_grace = Duration::from_millis(state.config.server.timeout_ms);
    let app = routes::build_router(state.clone());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(drain_grace))
    .await
    .context("Server error")?;

    // Drain is handled by axum's graceful shutdown; now stop the loops,
    // run plugin shutdown hooks (reverse registration order) and leave.
    tracing::info!("Shutting down background tasks");
    let _ = shutdown_tx.send(true);
    for task in background_tasks {
        task.abort();
    }
    state.plugins.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal(drain_grace: Duration) {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!(
        grace_ms = drain_grace.as_millis() as u64,
        "Shutdown signal received, draining in-flight requests"
    );
    // In-flight requests get one server timeout to finish; after that the
    // process leaves regardless.
    tokio::spawn(async move {
        tokio::time::sleep(drain_grace).await;
        tracing::warn!("Drain grace elapsed, forcing shutdown");
        std::process::exit(0);
    });
}

/// Health probes, the cache/quota sweeper and the resource sampler.
fn spawn_background_tasks(
    state: &Arc<AppState>,
    shutdown: watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut tasks = HealthChecker::new().spawn_all(&state.services, shutdown.clone());

    {
        let state = state.clone();
        let mut shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        state.store.sweep().await;
                        state.rate_limiter.sweep();
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    {
        let state = state.clone();
        let mut shutdown = shutdown.clone();
        let interval =
            Duration::from_millis(state.config.monitoring.resource_sample_interval_ms.max(1000));
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        state.monitor.record_resources(monitor::sample_resources());
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    tasks
}

/// Bootstrap admin credentials from the environment, when provided.
async fn seed_admin_user(state: &Arc<AppState>) -> Result<()> {
    let (Ok(username), Ok(password)) = (
        std::env::var("ADMIN_USERNAME"),
        std::env::var("ADMIN_PASSWORD"),
    ) else {
        return Ok(());
    };
    state
        .auth
        .store()
        .add_user(&username, &password, HashSet::from([auth::Permission::Admin]))
        .await?;
    tracing::info!(username = %username, "Seeded admin user");
    Ok(())
}
