use crate::{
    catalog::ImageCatalog,
    config::Config,
    domain::{CacheStore, SystemClock},
    downloads::GateRegistry,
    errors::AppError,
    jsonp::{HttpScriptLoader, JsonpClient},
    repositories::{JsonpImageSource, ProxyImageWriter},
    storage::{FileCacheStore, MemoryCacheStore},
    AppState,
};
use std::{sync::Arc, time::Duration};
use tracing;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Picks the persisted cache when a directory is configured.
async fn create_cache_store(config: &Config) -> Result<Arc<dyn CacheStore>, AppError> {
    match &config.cache_dir {
        Some(dir) => {
            let store = FileCacheStore::open(dir).await.map_err(|e| {
                tracing::error!("Startup: Failed to open cache directory {}: {}", dir.display(), e);
                AppError::InternalServerError(format!("Failed to open cache directory: {}", e))
            })?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!("Startup: No cache directory configured, using in-memory cache");
            Ok(Arc::new(MemoryCacheStore::new()))
        }
    }
}

/// Wires the backend clients, cache and gate registry into the shared state.
pub async fn build_state(config: Config) -> Result<Arc<AppState>, AppError> {
    tracing::info!("Startup: Initializing HTTP client...");
    let http = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| AppError::InternalServerError(format!("Failed to build HTTP client: {}", e)))?;

    let source = JsonpImageSource::new(
        JsonpClient::new(Arc::new(HttpScriptLoader::new(http.clone()))),
        config.api_base_url.clone(),
    );
    let writer = ProxyImageWriter::new(http, config.proxy_url.clone());
    let cache = create_cache_store(&config).await?;

    let catalog = ImageCatalog::new(Arc::new(source), Arc::new(writer), cache, Arc::new(SystemClock));
    let gates = GateRegistry::new(config.countdown_secs, config.gate_session_ttl);

    tracing::info!("Startup: Application state ready.");
    Ok(Arc::new(AppState {
        catalog,
        gates,
        config,
    }))
}
