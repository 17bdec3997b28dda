//! Wallet Engine - transaction lifecycle for unattended payment bots
//!
//! Runs one transaction monitor per enabled chain. Instances sharing a
//! database elect a single active monitor per chain; the others stand by.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use wallet_engine::config::Settings;
use wallet_engine::lock::{LockTimings, MonitoringLock, SystemClock};
use wallet_engine::metrics::MetricsServer;
use wallet_engine::monitor::{MonitorRegistry, RunningFlag, TransactionMonitor};
use wallet_engine::state::StateManager;
use wallet_engine::wallet::{build_wallet, EnvKeyStore, WalletRegistry};

/// Interval of the database health check
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Wallet Engine v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Initialize database connection
    let state_manager = Arc::new(StateManager::new(&settings.database).await?);
    info!("Database connection established");

    // Run migrations
    state_manager.run_migrations().await?;
    info!("Database migrations complete");

    let keys = Arc::new(EnvKeyStore::new(&settings.wallet));
    let lock = Arc::new(MonitoringLock::new(
        state_manager.clone(),
        Arc::new(SystemClock),
        LockTimings::from(&settings.monitor),
    ));

    // One wallet and one monitor per enabled chain
    let wallets = WalletRegistry::new();
    let monitors = Arc::new(MonitorRegistry::new());
    for (name, chain_settings) in settings.enabled_chains() {
        let wallet = build_wallet(
            chain_settings.clone(),
            state_manager.clone(),
            keys.clone(),
            settings.monitor.db_retry_max_elapsed(),
        )?;
        info!("Chain {} configured as {}", name, wallet.chain());
        wallets.register(wallet.clone());
        monitors.register(TransactionMonitor::new(
            wallet,
            lock.clone(),
            settings.monitor.clone(),
        ));
    }

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

    // Start monitors; standby chains keep retrying
    let shutdown = RunningFlag::new();
    shutdown.set(true);
    let standby_handle = tokio::spawn({
        let monitors = monitors.clone();
        let shutdown = shutdown.clone();
        let retry = Duration::from_secs(settings.monitor.standby_retry_secs);
        async move { monitors.run_standby(shutdown, retry).await }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let state_manager = state_manager.clone();
        async move {
            loop {
                tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;
                if let Err(e) = state_manager.health_check().await {
                    warn!("Database health check failed: {}", e);
                }
            }
        }
    });

    info!("Wallet Engine is running for chains {:?}", wallets.chains());
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown: stop retrying, then release held locks
    shutdown.set(false);
    if let Err(e) = standby_handle.await {
        error!("Standby task failed: {}", e);
    }
    monitors.stop_all().await;

    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Wallet Engine stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,wallet_engine=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
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
