use anyhow::Result;
use tracing_subscriber::EnvFilter;

use cisnr_assistant::server::{build_router, AppState};
use cisnr_assistant::{ChatEngine, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("Refusing to start: {}", e);
            return Err(e.into());
        }
    };

    tracing::info!("Connecting to Qdrant: {}", settings.qdrant_url);
    tracing::info!("Vector index: {}", settings.vector_index_name);

    let engine = ChatEngine::from_settings(&settings)?;
    if !engine.vector_store_healthy().await {
        tracing::warn!("Vector store is not reachable yet; chat requests will fail until it is");
    }

    let state = AppState::new(engine, &settings.secret_key, settings.static_dir.clone());
    let app = build_router(state, settings.http_timeout);

    let listener = tokio::net::TcpListener::bind(settings.bind_address()).await?;
    tracing::info!("CISNR assistant listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
