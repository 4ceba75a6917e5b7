pub mod api;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod float_catalog;
pub mod market;
pub mod models;
pub mod queue;
pub mod read_layer;
pub mod store;
pub mod sync;
pub mod tradeup;

use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::api::state::AppState;
use crate::config::Config;
use crate::fetcher::{Fetcher, PacingBounds};
use crate::float_catalog::FloatCatalog;
use crate::market::new_market_adapter;
use crate::queue::{JobBroker, RedisJobBroker};
use crate::read_layer::ReadLayer;
use crate::store::SqliteStore;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Wires every component together the way `main` and the worker binary
/// both need it.
pub fn build_state(config: Config) -> anyhow::Result<Arc<AppState>> {
    let config = Arc::new(config);
    let fetcher = Fetcher::with_default_transport(PacingBounds {
        start_ms: config.steam_rate_ms,
        min_ms: config.steam_rate_min_ms,
        max_ms: config.steam_rate_max_ms,
    });
    let market = new_market_adapter(fetcher.clone(), &config);
    let float_catalog = Arc::new(FloatCatalog::new(config.skin_float_source_url.clone()));
    let store = SqliteStore::new(&config.database_path)?;
    let broker: Arc<dyn JobBroker> =
        Arc::new(RedisJobBroker::new(&config.redis_url, &config.catalog_sync_queue)?);
    let read_layer = Arc::new(ReadLayer::new(store.clone(), market.clone()));

    Ok(Arc::new(AppState {
        config,
        fetcher,
        market,
        float_catalog,
        store,
        broker,
        read_layer,
    }))
}

pub fn build_router(state: Arc<AppState>) -> axum::Router {
    api::routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
