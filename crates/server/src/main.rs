//! meetq queue node.
//!
//! Builds the queue components enabled in configuration, runs them until
//! SIGINT/SIGTERM and then stops them in order.

use std::time::Duration;

use anyhow::Context;
use meetq_common::{Config, get_metrics};
use meetq_queue::names::channels;
use meetq_queue::{HandlerError, PubSubMessage, QueueManager, init_global, shutdown_global};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Period of the metrics snapshot log line.
const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.as_str().into());
    let json = config.logging.json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load().context("failed to load configuration")?;
    init_tracing(&config);

    info!("Starting meetq queue node...");

    let manager = QueueManager::from_config(&config)
        .await
        .context("failed to build queue components")?;

    if let Some(pubsub) = manager.pubsub() {
        pubsub
            .subscribe(channels::SYSTEM_EVENTS, |message: PubSubMessage| async move {
                info!(
                    event_type = %message.message_type,
                    source = %message.source,
                    "Received system event"
                );
                Ok::<(), HandlerError>(())
            })
            .await?;
    }

    let manager = init_global(manager)
        .await
        .context("failed to start queue components")?;
    let components: Vec<String> = manager
        .stats()
        .await
        .keys()
        .filter(|key| key.as_str() != "running")
        .cloned()
        .collect();
    info!(components = ?components, "Queue node ready");

    let metrics_logger = tokio::spawn(async {
        let mut ticker = tokio::time::interval(METRICS_LOG_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            info!(metrics = ?get_metrics().snapshot(), "Queue metrics");
        }
    });

    shutdown_signal().await;

    metrics_logger.abort();
    shutdown_global().await;
    info!("Queue node stopped");
    Ok(())
}
