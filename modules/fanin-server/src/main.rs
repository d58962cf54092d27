use std::sync::Arc;

use anyhow::Result;
use fanin_engine::Barrier;
use fanin_server::{build_router, AppConfig, AppState, Shutdown, StoreBackend};
use fanin_store::{BarrierStore, FileBarrierStore, PgBarrierStore};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Start initializing func..");

    // Load config
    let config = AppConfig::from_env()?;
    let combine = config.merge_mode.combine(&config.merge_separator);

    // Barrier store. Any failure here is fatal; there is no retry.
    let store: Arc<dyn BarrierStore> = match &config.backend {
        StoreBackend::Postgres {
            database_url,
            retired_key_ttl,
        } => {
            let store = PgBarrierStore::connect(database_url)
                .await?
                .with_retired_key_ttl(*retired_key_ttl);
            tracing::info!("Connected to database");
            store.migrate().await?;
            tracing::info!("Migrations complete");
            Arc::new(store)
        }
        StoreBackend::File {
            state_dir,
            lock_timeout,
            lock_stale_after,
        } => {
            let store = FileBarrierStore::open(state_dir, combine.clone())?
                .with_policy(config.corrupt_state)
                .with_lock_timeout(*lock_timeout)
                .with_lock_stale_after(*lock_stale_after);
            tracing::info!(state_dir = %state_dir.display(), "Using file-backed run state");
            Arc::new(store)
        }
    };

    let barrier = Barrier::new(store, combine, config.number_of_funcs)?
        .with_retention(config.retention);

    let shutdown = Arc::new(Shutdown::new());
    let app = build_router(AppState {
        barrier,
        merge_mode: config.merge_mode,
        type_override: config.type_override.clone(),
        default_run_id: config.default_run_id.clone(),
        shutdown: shutdown.clone(),
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(
        addr = %addr,
        width = config.number_of_funcs,
        retention = ?config.retention,
        message = %config.message,
        "Listening for events"
    );

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.signal().await })
        .await?;

    if shutdown.is_fatal() {
        anyhow::bail!("stopped after a fatal store error");
    }
    Ok(())
}
