use std::sync::Arc;

use anyhow::Context;

use relay_common::config::AppConfig;
use relay_common::db;
use relay_engine::{PgEventStore, RetryPolicy};
use relay_notifier::{Dispatcher, DispatcherConfig, build_sink};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_notifier=info,relay_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Notification relay dispatcher starting...");

    let config = AppConfig::from_env()?;

    // A standalone dispatcher is only useful against a shared durable store.
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required for the standalone dispatcher")?;
    let pool = db::create_pool(database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;

    let store = Arc::new(PgEventStore::new(pool, RetryPolicy::from_config(&config)));
    let sink = build_sink(&config)?;
    let dispatcher = Arc::new(Dispatcher::new(
        store,
        sink,
        DispatcherConfig::from_app_config(&config),
    ));

    let shutdown = dispatcher.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received shutdown signal, stopping gracefully...");
                shutdown.cancel();
            }
            Err(err) => tracing::error!(error = %err, "Failed to listen for shutdown signal"),
        }
    });

    dispatcher.run().await?;

    tracing::info!("Notification relay dispatcher stopped.");
    Ok(())
}
