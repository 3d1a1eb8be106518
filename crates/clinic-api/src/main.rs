mod auth;
mod config;
mod error;
mod routes;
mod store;

use std::sync::Arc;

use config::AppConfig;
use routes::{app_router, AppState};
use store::ServerStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; deployments inject the environment
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("clinic_api=info".parse()?),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting clinic-api with config: {:?}", config);

    let store = ServerStore::open(&config.db_path, config.token_retry_limit)?;
    let bind_addr = config.bind_addr.clone();
    let router = app_router(AppState::new(config, store));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("clinic-api listening on {}", bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}
