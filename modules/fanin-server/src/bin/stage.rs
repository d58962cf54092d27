use std::sync::Arc;

use anyhow::Result;
use fanin_server::shutdown::terminated;
use fanin_server::{build_stage_router, MessageStage, StageConfig, StageState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = StageConfig::from_env()?;

    let app = build_stage_router(StageState {
        stage: Arc::new(MessageStage::new(config.message.clone())),
        name: config.func_name.clone(),
        type_override: config.type_override.clone(),
    });

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, stage = %config.func_name, "Listening for events");

    axum::serve(listener, app)
        .with_graceful_shutdown(terminated())
        .await?;
    Ok(())
}
