//! Application configuration loaded from the environment.
//!
//! Follows the same `from_env` idiom as the rest of this family of
//! services: read a var, fall back to a documented default, clamp into the
//! documented range, never panic on a malformed value.

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub market_api_base: String,

    pub redis_url: String,
    pub catalog_sync_queue: String,
    pub catalog_sync_concurrency: u32,

    pub steam_page_size: u32,
    pub steam_max_auto_limit: u32,

    pub steam_rate_ms: u64,
    pub steam_rate_min_ms: u64,
    pub steam_rate_max_ms: u64,

    pub skin_float_source_url: Option<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "./tradeup.db".to_string());

        let port: u16 = env_parse("PORT", 8080);

        let market_api_base = env::var("MARKET_API_BASE")
            .unwrap_or_else(|_| "https://steamcommunity.com".to_string());

        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1".to_string());
        let catalog_sync_queue =
            env::var("CATALOG_SYNC_QUEUE").unwrap_or_else(|_| "catalog-sync".to_string());
        let catalog_sync_concurrency: u32 = env_parse("CATALOG_SYNC_CONCURRENCY", 1).max(1);

        let steam_page_size: u32 = env_parse("STEAM_PAGE_SIZE", 30u32).clamp(20, 80);
        let steam_max_auto_limit: u32 = env_parse("STEAM_MAX_AUTO_LIMIT", 1200u32).clamp(500, 5000);

        let steam_rate_ms: u64 = env_parse("STEAM_RATE_MS", 3000u64).max(800);
        let steam_rate_min_ms: u64 = env_parse("STEAM_RATE_MIN_MS", 1200u64).max(800);
        let steam_rate_max_ms: u64 =
            env_parse("STEAM_RATE_MAX_MS", 12000u64).max(steam_rate_min_ms + 500);

        let skin_float_source_url = env::var("SKIN_FLOAT_SOURCE_URL").ok();

        Ok(Self {
            database_path,
            port,
            market_api_base,
            redis_url,
            catalog_sync_queue,
            catalog_sync_concurrency,
            steam_page_size,
            steam_max_auto_limit,
            steam_rate_ms,
            steam_rate_min_ms,
            steam_rate_max_ms,
            skin_float_source_url,
        })
    }

}
