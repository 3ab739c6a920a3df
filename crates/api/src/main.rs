//! Notification relay API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use relay_common::config::AppConfig;
use relay_common::db;
use relay_engine::{EventStore, MemoryEventStore, PgEventStore, RetryPolicy};
use relay_notifier::{Dispatcher, DispatcherConfig, build_sink};

use relay_api::routes::create_router;
use relay_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("relay_api=debug,relay_engine=debug,relay_notifier=info,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting notification relay API server...");

    let config = AppConfig::from_env()?;
    let policy = RetryPolicy::from_config(&config);

    let store: Arc<dyn EventStore> = match config.database_url.as_deref() {
        Some(url) => {
            let pool = db::create_pool(url, config.db_max_connections).await?;
            db::run_migrations(&pool).await?;
            Arc::new(PgEventStore::new(pool, policy))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store; nothing survives a restart");
            Arc::new(MemoryEventStore::new(policy))
        }
    };

    if config.ingress_api_keys.is_empty() {
        tracing::warn!("INGRESS_API_KEYS not set, producer authentication is disabled");
    }

    let mut state = AppState::new(store.clone(), config.clone());
    let shutdown = CancellationToken::new();

    let dispatcher_task = if config.run_dispatcher {
        let sink = build_sink(&config)?;
        let dispatcher = Arc::new(Dispatcher::new(
            store,
            sink,
            DispatcherConfig::from_app_config(&config),
        ));
        state = state.with_dispatcher(dispatcher.clone());

        // Stop the dispatcher together with the server.
        let token = dispatcher.shutdown_token();
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            server_shutdown.cancelled().await;
            token.cancel();
        });

        // Corrupt store data stops the whole process.
        let fatal = shutdown.clone();
        Some(tokio::spawn(async move {
            let result = dispatcher.run().await;
            if result.is_err() {
                fatal.cancel();
            }
            result
        }))
    } else {
        tracing::info!("Dispatcher disabled in this process (RUN_DISPATCHER=false)");
        None
    };

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => tracing::info!("Received shutdown signal, stopping gracefully..."),
                    Err(err) => {
                        tracing::error!(error = %err, "Failed to listen for shutdown signal");
                        signal.cancelled().await;
                    }
                },
                _ = signal.cancelled() => tracing::error!("Dispatcher failed, stopping server"),
            }
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(task) = dispatcher_task {
        task.await??;
    }

    tracing::info!("Notification relay API server stopped.");
    Ok(())
}
