//! # Argus Orchestrator
//!
//! Standalone orchestrator process: consumes the batch-event topic, drives the saga and
//! runs the compensation sweep until it receives Ctrl+C or SIGTERM.
//!
//! ## Usage
//!
//! ```bash
//! # Run with configuration from ./config
//! cargo run --bin argus-orchestrator
//!
//! # Run with a specific environment overlay
//! ARGUS_ENV=production cargo run --bin argus-orchestrator
//! ```

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use argus_core::barrier::CompletionBarrier;
use argus_core::config::{ArgusConfig, BusProviderKind, ConfigManager};
use argus_core::logging;
use argus_core::messaging::{EventBus, EventConsumer, PgmqBus, ReliablePublisher};
use argus_core::orchestration::{Compensator, OrchestrationEngine};
use argus_core::repository::migrations::DatabaseMigrations;
use argus_core::repository::{BatchRepository, PgBatchRepository};
use argus_core::store::SharedStoreProvider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let manager = ConfigManager::load().context("Failed to load configuration")?;
    let config: &ArgusConfig = manager.config();

    logging::init_structured_logging(&config.logging);

    info!("🚀 Starting Argus Orchestrator...");
    info!("   Version: {}", env!("CARGO_PKG_VERSION"));
    info!("   Environment: {}", manager.environment());
    info!(
        "   Build Mode: {}",
        if cfg!(debug_assertions) {
            "Debug"
        } else {
            "Release"
        }
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(config.database.acquire_timeout())
        .connect(&config.database.url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    if config.database.run_migrations {
        let applied = DatabaseMigrations::default()
            .run_all(&pool)
            .await
            .context("Failed to apply database migrations")?;
        info!(applied = applied.len(), "🗄️ Database schema up to date");
    }

    let store = SharedStoreProvider::connect_redis(&config.redis)
        .await
        .context("Failed to connect to the shared store")?;

    let bus = match config.bus.provider {
        BusProviderKind::Pgmq => {
            EventBus::Pgmq(Box::new(PgmqBus::new(pool.clone(), config.bus.partitions)))
        }
        BusProviderKind::InMemory => {
            warn!("In-memory bus selected; events will not leave this process");
            EventBus::in_memory(config.bus.partitions)
        }
    };
    bus.ensure_topic(&config.bus.dead_letter_topic)
        .await
        .context("Failed to create dead-letter topic")?;

    let batches: Arc<dyn BatchRepository> = Arc::new(PgBatchRepository::new(pool.clone()));
    let publisher = ReliablePublisher::new(
        bus.clone(),
        config.bus.topic.clone(),
        config.bus.dead_letter_topic.clone(),
        config.publisher.clone(),
    );
    let barrier = CompletionBarrier::new(store, config.barrier.ttl());
    let engine = OrchestrationEngine::new(batches.clone(), barrier, publisher);

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let consumer = EventConsumer::new(
        bus,
        engine.clone(),
        config.bus.topic.clone(),
        config.consumer.clone(),
    );
    {
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = consumer.run(shutdown).await {
                error!(error = %e, "Event consumer exited with error");
            }
        });
    }

    if config.compensation.enabled {
        let compensator = Compensator::new(engine, batches, config.compensation.clone());
        let shutdown = shutdown.clone();
        tasks.spawn(async move { compensator.run(shutdown).await });
    } else {
        info!("Compensation sweep disabled");
    }

    info!("🎉 Argus Orchestrator started successfully!");
    info!("   Press Ctrl+C to shutdown gracefully");

    shutdown_signal().await;

    info!("🛑 Shutdown signal received, draining in-flight handlers...");
    shutdown.cancel();

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Background task panicked during shutdown");
        }
    }

    pool.close().await;
    info!("👋 Argus Orchestrator shutdown complete");

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
