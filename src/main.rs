use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use idphoto_gate::{
    ark::ArkClient, config::Config, db::Database, http, state::AppState,
    storage::LocalFileStorage,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")),
        )
        .init();

    let config = Config::from_env()?;
    let bind_address = config.bind_address();

    let db = Database::new(&config).await?;
    let storage = LocalFileStorage::new(config.storage_dir.clone(), config.store_timeout);
    let generator = ArkClient::new(config.ark.clone()).context("build provider client")?;
    info!(
        db = %config.db_path.display(),
        storage = %config.storage_dir.display(),
        model = %config.ark.model,
        "state initialized"
    );

    let router = http::router(AppState::new(config, db, storage, Arc::new(generator)));
    let tcp_listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("bind {bind_address}"))?;
    info!("ID photo service listening on http://{bind_address}");

    axum::serve(tcp_listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
