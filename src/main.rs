use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod catalog;
mod config;
mod domain;
mod downloads;
mod errors;
mod gate;
mod handlers;
mod jsonp;
mod models;
mod repositories;
mod routes;
mod startup;
mod storage;

use crate::catalog::ImageCatalog;
use crate::config::Config;
use crate::downloads::GateRegistry;
use crate::errors::AppError;

/// AppState holds shared resources for the web server.
pub struct AppState {
    pub catalog: ImageCatalog,
    pub gates: GateRegistry,
    pub config: Config,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Initialize tracing (logging)
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "image_hub=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    let bind_address = config.bind_address;

    let state: Arc<AppState> = startup::build_state(config).await?;
    let app = routes::create_router(state);

    tracing::info!("Server listening on http://{}", bind_address);

    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
