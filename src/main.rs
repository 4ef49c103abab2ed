//! Bridge Tracker - cross-chain transfer tracking and reconciliation
//!
//! Follows submitted transfers between Ethereum and Polkadot until each one
//! reaches exactly one final outcome, merging status from the bridge history
//! API, XCM push subscriptions and the swap router.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

mod api;
mod clock;
mod config;
mod error;
mod events;
mod metrics;
mod notify;
mod reconcile;
mod sources;
mod state;
mod sweeper;
mod transfer;

use clock::SystemClock;
use config::{LoggingConfig, Settings};
use metrics::MetricsServer;
use notify::TracingNotifier;
use reconcile::Reconciler;
use sources::{
    HistorySource, HttpHistoryClient, HttpSwapClient, Poller, SubscriptionSource, SwapSource,
    WsTransport,
};
use state::{MemoryPersistence, Persistence, PgPersistence, TransferStore};
use sweeper::StalenessSweeper;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging
    init_logging(&settings.logging);

    info!(
        instance_id = %settings.tracker.instance_id,
        "Starting Bridge Tracker v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Open persistence
    let persistence: Arc<dyn Persistence> = match &settings.database {
        Some(database) => {
            let pg = PgPersistence::new(database).await?;
            info!("Database connection established");
            pg.run_migrations().await?;
            Arc::new(pg)
        }
        None => {
            info!("No database configured, transfers are kept in memory only");
            Arc::new(MemoryPersistence::new())
        }
    };

    let store = Arc::new(TransferStore::open(persistence).await?);
    let clock = Arc::new(SystemClock);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(settings.tracker.event_channel_capacity);

    let mut handles = Vec::new();

    // Start reconciler
    let reconciler = Reconciler::new(
        store.clone(),
        Arc::new(TracingNotifier),
        clock.clone(),
        settings.tracker.conflict_policy,
    );
    let reconciler_handle = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move {
            if let Err(e) = reconciler.run(events_rx, shutdown).await {
                error!("Reconciler error: {}", e);
            }
        }
    });

    // Start status sources
    if settings.history.enabled {
        let poller = Arc::new(Poller::new(
            HistorySource::new(HttpHistoryClient::new(&settings.history)?),
            store.clone(),
            events_tx.clone(),
            Duration::from_secs(settings.history.poll_interval_secs),
        ));
        handles.push(tokio::spawn(poller.run(shutdown_rx.clone())));
    }

    if settings.swap.enabled {
        let poller = Arc::new(Poller::new(
            SwapSource::new(HttpSwapClient::new(&settings.swap)?),
            store.clone(),
            events_tx.clone(),
            Duration::from_secs(settings.swap.poll_interval_secs),
        ));
        handles.push(tokio::spawn(poller.run(shutdown_rx.clone())));
    }

    if settings.subscription.enabled {
        let source = Arc::new(SubscriptionSource::new(
            WsTransport::new(&settings.subscription),
            store.clone(),
            events_tx.clone(),
            clock.clone(),
            Duration::from_secs(settings.subscription.resync_interval_secs),
        ));
        handles.push(tokio::spawn(source.run(shutdown_rx.clone())));
    }

    // Start staleness sweeper
    let sweeper = Arc::new(StalenessSweeper::new(
        store.clone(),
        events_tx,
        clock,
        settings.sweeper.clone(),
    ));
    handles.push(tokio::spawn(sweeper.run(shutdown_rx.clone())));

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let store = store.clone();
        async move {
            if let Err(e) = api::run_server(config, store).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    info!("Bridge Tracker is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            error!("Background task ended abnormally: {}", e);
        }
    }
    if let Err(e) = reconciler_handle.await {
        error!("Reconciler task ended abnormally: {}", e);
    }

    // Abort servers
    api_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Bridge Tracker stopped");
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,bridge_tracker=debug,sqlx=warn,hyper=warn")
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
