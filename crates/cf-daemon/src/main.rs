//! cf-daemon entry point.
//!
//! This file is intentionally thin: it resolves configuration, connects to
//! Postgres, wires the background pipeline (queue bridge, worker pool,
//! maintenance sweeps) and starts the HTTP server. All route handlers live
//! in `routes.rs`; all shared state lives in `state.rs`.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use cf_daemon::{routes, state};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience); silent if absent since
    // production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let config = cf_config::Config::from_env().context("configuration failed to load")?;

    let pool = cf_db::connect(&config.database_url, 20)
        .await
        .context("failed to connect to Postgres")?;
    cf_db::migrate(&pool).await.context("failed to run migrations")?;
    cf_lock::migrate(&pool).await.context("failed to run cf-lock migrations")?;

    let (updates, _) = tokio::sync::broadcast::channel(1024);
    let shared = Arc::new(state::AppState::new(&config, pool.clone(), updates.clone())?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    spawn_shutdown_signal(shutdown_tx);

    let (queue_tx, queue_rx) = cf_queue::work_queue(config.tunables.queue_bridge_batch_size as usize * 2);

    let bridge = cf_queue::QueueBridge::new(
        pool.clone(),
        queue_tx,
        config.tunables.queue_bridge_batch_size,
        "cf-daemon".to_string(),
        config.tunables.queue_bridge_poll_interval,
    );
    tokio::spawn(bridge.run(shutdown_rx.clone()));

    let worker_pool = cf_worker::WorkerPool::new(
        pool.clone(),
        Arc::clone(&shared.encryption_key),
        cf_countries::CountryRegistry::standard(),
        shared.breakers.clone(),
        updates.clone(),
        cf_worker::WorkerPoolConfig {
            concurrency: config.tunables.worker_concurrency,
            task_timeout: config.tunables.worker_task_timeout,
            lock_ttl: config.tunables.lock_ttl,
            max_retries: config.tunables.worker_max_retries,
            ..Default::default()
        },
    );
    tokio::spawn(worker_pool.run(queue_rx, shutdown_rx.clone()));

    cf_maintenance::spawn_all(
        pool.clone(),
        cf_maintenance::MaintenanceConfig {
            webhook_event_ttl_days: config.tunables.webhook_event_ttl_days,
            orphan_sweep_interval: config.tunables.orphan_sweep_interval,
            stale_pending_sweep: config
                .tunables
                .stale_pending_timeout
                .map(|t| (config.tunables.orphan_sweep_interval, t)),
            ..Default::default()
        },
        shutdown_rx.clone(),
    );

    let app = routes::build_router(Arc::clone(&shared)).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let addr = bind_addr_from_config(&config).unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8899)));
    info!("cf-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_config(config: &cf_config::Config) -> Option<SocketAddr> {
    config.daemon_addr.as_ref()?.parse().ok()
}

/// Resolves once the shutdown watch flips to `true`, handed to axum's
/// `with_graceful_shutdown` so the HTTP listener stops accepting new
/// connections at the same moment the background loops start winding down.
async fn wait_for_shutdown(mut rx: tokio::sync::watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Flip the shared shutdown watch to `true` on SIGINT so every spawned
/// loop (queue bridge, worker slots, maintenance sweeps) winds down instead
/// of being killed mid-transaction.
fn spawn_shutdown_signal(tx: tokio::sync::watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = tx.send(true);
        }
    });
}
