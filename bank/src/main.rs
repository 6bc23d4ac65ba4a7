use std::sync::Arc;

use regiobank::api::{self, AppState};
use regiobank::config::Config;
use regiobank::metrics::Metrics;
use regiobank::notify::{self, NotifyBus};
use regiobank::{db, gc};

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting regiobank");

    let config = Config::load()?;
    tracing::info!(bind_address = %config.http.bind_address, "Configuration loaded");

    let pool = db::create_pool(&config.database.url, config.database.max_connections).await?;
    tracing::info!("Database connected");

    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    let notify_bus = NotifyBus::new();
    let metrics = Arc::new(Metrics::new());
    let config = Arc::new(config);

    let (gc_shutdown_tx, gc_shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);
    let (notify_shutdown_tx, notify_shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    let shutdown_signal = async move {
        wait_for_shutdown_signal().await;
        let _ = gc_shutdown_tx.send(()).await;
        let _ = notify_shutdown_tx.send(()).await;
    };

    let gc_thresholds = gc::GcThresholds {
        abort_after: chrono::Duration::seconds(config.gc.abort_after_secs),
        clean_after: chrono::Duration::seconds(config.gc.clean_after_secs),
        delete_after: chrono::Duration::seconds(config.gc.delete_after_secs),
    };
    let gc_interval = std::time::Duration::from_secs(config.gc.interval_secs);
    let gc_pool = pool.clone();
    let gc_task = tokio::spawn(gc::run(gc_pool, gc_thresholds, gc_interval, gc_shutdown_rx));

    let notify_pool = pool.clone();
    let notify_bus_task = notify_bus.clone();
    let notify_task = tokio::spawn(notify::run(notify_pool, notify_bus_task, notify_shutdown_rx));

    let state = AppState {
        pool: pool.clone(),
        config: config.clone(),
        metrics: metrics.clone(),
        notify: notify_bus.clone(),
    };
    let bind_address = config.http.bind_address.clone();

    tracing::info!("managers initialized, starting processing");

    tokio::select! {
        result = api::start_server(&bind_address, state) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "ambient HTTP surface error");
            }
        }
        _ = gc_task => {
            tracing::error!("garbage collector task ended unexpectedly");
        }
        _ = notify_task => {
            tracing::error!("notification bus task ended unexpectedly");
        }
        _ = shutdown_signal => {
            tracing::info!("shutdown signal received");
        }
    }

    tracing::info!("regiobank stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,regiobank=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(filter)
        .init();
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
