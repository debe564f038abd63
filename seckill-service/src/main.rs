mod admission;
mod api;
mod buffer;
mod cache;
mod commit;
mod config;
mod error;
mod kafka;
mod models;
mod schema;
mod store;
#[cfg(test)]
mod testing;

use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use diesel::PgConnection;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

use anyhow::{Context, Result};
use clap::Parser;
use diesel::Connection;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use crate::cache::{RedisStockCache, StockCache};
use crate::store::OrderStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = config::Args::parse();
    args.validate()?;

    // Run migrations first
    info!("Running database migrations...");
    let mut conn = PgConnection::establish(&args.database_url)?;
    conn.run_pending_migrations(MIGRATIONS).map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");

    let store = Arc::new(
        store::PgStore::connect(&args.database_url, args.database_pool_size)
            .await
            .context("connecting to the order store")?,
    );

    let cache_config = args.cache();
    let cache = Arc::new(
        RedisStockCache::connect(&cache_config)
            .await
            .context("connecting to the stock cache")?,
    );
    let stock: Vec<_> = store
        .items()
        .await?
        .into_iter()
        .map(|item| (item.id, i64::from(item.stock)))
        .collect();
    cache.warm_up(&stock).await?;

    let kafka_config = args.kafka();
    kafka::ensure_topic(&kafka_config).await;
    let log = Arc::new(kafka::KafkaLog::new(&kafka_config).context("creating the log producer")?);
    let consumer = kafka::create_consumer(&kafka_config).context("creating the log consumer")?;

    let shutdown = CancellationToken::new();

    let buffer_config = args.buffer();
    let (buffer, buffer_rx) = buffer::channel(buffer_config.capacity);
    let drain_worker = buffer::DrainWorker::new(log.clone(), cache.clone(), &buffer_config);
    let drain_task = tokio::spawn(drain_worker.run(buffer_rx, shutdown.clone()));

    let commit_processor = commit::CommitProcessor::new(store.clone(), cache.clone());
    let commit_shutdown = shutdown.clone();
    let commit_task = tokio::spawn(async move {
        commit_processor.run(consumer, commit_shutdown).await;
    });

    log.activate_reader().await.context("activating the order reader")?;

    let admission = Arc::new(admission::AdmissionController::new(
        cache.clone(),
        buffer,
        cache_config.dedup_window,
    ));
    let app = api::create_router(api::AppState { admission, store });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;

    info!("Seckill service ready at http://0.0.0.0:{}/api/seckill/:item_id/:buyer_id", args.port);

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutting down");
        signal.cancel();
    });

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    shutdown.cancel();
    if let Err(e) = drain_task.await {
        error!("Drain worker panicked: {}", e);
    }
    if let Err(e) = commit_task.await {
        error!("Commit processor panicked: {}", e);
    }
    info!("Shutdown complete");

    Ok(())
}
