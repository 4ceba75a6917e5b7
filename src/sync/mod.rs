//! Sync Worker: the durable job that enumerates every collection tag,
//! paginates each rarity through the Market Adapter, and reconciles the
//! observed items against the persistent store.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::float_catalog::FloatCatalog;
use crate::market::MarketAdapter;
use crate::models::{Collection, Rarity, Skin};
use crate::queue::{JobBroker, JobProgress, JobStatus, SyncJob};
use crate::store::SqliteStore;

const HARD_CAP_PER_COLLECTION: u32 = 600;
const MIN_RESUME_DELAY: Duration = Duration::from_secs(1);
const MAX_RESUME_DELAY: Duration = Duration::from_secs(5 * 60);

pub struct SyncWorker {
    market: Arc<MarketAdapter>,
    store: Arc<SqliteStore>,
    float_catalog: Arc<FloatCatalog>,
    broker: Arc<dyn JobBroker>,
    page_size: u32,
    max_auto_limit: u32,
}

impl SyncWorker {
    pub fn new(
        market: Arc<MarketAdapter>,
        store: Arc<SqliteStore>,
        float_catalog: Arc<FloatCatalog>,
        broker: Arc<dyn JobBroker>,
        config: &Config,
    ) -> Self {
        Self {
            market,
            store,
            float_catalog,
            broker,
            page_size: config.steam_page_size,
            max_auto_limit: config.steam_max_auto_limit,
        }
    }

    /// Runs a full catalog sync for `job_id`, updating its progress and
    /// status as it goes. Rate-limit failures pause and resume the job
    /// in place rather than failing it.
    pub async fn run(&self, job_id: &str) -> AppResult<()> {
        let mut job = self
            .broker
            .get(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(job_id.to_string()))?;

        job.status = JobStatus::Running;
        job.started_at = Some(now_unix_ms());
        self.broker.save(&job).await?;

        self.float_catalog.ensure_remote(&reqwest::Client::new()).await;

        let tags = match self.market.fetch_collection_tags().await {
            Ok(tags) => tags,
            Err(e) => return self.fail(&mut job, e).await,
        };

        job.progress.total_collections = tags.len() as u64;
        self.broker.save(&job).await?;

        for tag in &tags {
            job.progress.current_collection_tag = Some(tag.tag.clone());
            job.progress.current_collection_name = Some(tag.name.clone());
            self.broker.save(&job).await?;

            if let Err(e) = self.sync_one_collection(&mut job, &tag.tag, &tag.name).await {
                return self.fail(&mut job, e).await;
            }

            job.progress.synced_collections += 1;
            self.broker.save(&job).await?;
        }

        self.store.invalidate_catalog_ready();
        let _ = self.store.catalog_ready();

        job.status = JobStatus::Completed;
        job.finished_at = Some(now_unix_ms());
        job.progress.current_collection_tag = None;
        job.progress.current_collection_name = None;
        job.progress.current_rarity = None;
        self.broker.save(&job).await?;

        Ok(())
    }

    async fn sync_one_collection(
        &self,
        job: &mut SyncJob,
        tag: &str,
        display_name: &str,
    ) -> AppResult<()> {
        let collection = Collection {
            id: tag.to_string(),
            display_name: display_name.to_string(),
            steam_tag: tag.to_string(),
            normalized_name: display_name.to_lowercase(),
        };

        let mut observed = Vec::new();

        for rarity in Rarity::ALL {
            job.progress.current_rarity = Some(format!("{rarity:?}"));
            self.broker.save(job).await?;

            let mut start = 0u32;
            let mut seen_for_rarity = 0u32;

            loop {
                let page = self
                    .fetch_page_with_pause(job, tag, rarity, start)
                    .await?;

                if page.items.is_empty() {
                    break;
                }

                for item in &page.items {
                    let (base_name, exterior, is_stattrak, is_souvenir) =
                        Skin::parse_name(&item.market_hash_name);
                    let range = self.float_catalog.lookup(&base_name);

                    observed.push(Skin {
                        market_hash_name: item.market_hash_name.clone(),
                        collection_id: collection.id.clone(),
                        base_name,
                        exterior,
                        rarity,
                        is_stattrak,
                        is_souvenir,
                        sell_listings: item.sell_listings,
                        last_known_price: item.price,
                        float_min: range.map(|r| r.min_float),
                        float_max: range.map(|r| r.max_float),
                    });
                }

                seen_for_rarity += page.items.len() as u32;
                start += self.page_size;

                if (page.items.len() as u32) < self.page_size
                    || seen_for_rarity >= self.max_auto_limit
                    || seen_for_rarity >= HARD_CAP_PER_COLLECTION
                    || (start as u64) >= page.total
                {
                    break;
                }
            }
        }

        self.store.sync_collection(&collection, &observed)?;
        Ok(())
    }

    async fn fetch_page_with_pause(
        &self,
        job: &mut SyncJob,
        tag: &str,
        rarity: Rarity,
        start: u32,
    ) -> AppResult<crate::market::SearchResult> {
        loop {
            match self
                .market
                .search_by_collection(tag, Some(rarity), start, self.page_size, true)
                .await
            {
                Ok(result) => return Ok(result),
                Err(AppError::RateLimited { retry_after }) => {
                    self.pause_for(job, retry_after).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn pause_for(&self, job: &mut SyncJob, retry_after: Duration) -> AppResult<()> {
        let delay = retry_after.clamp(MIN_RESUME_DELAY, MAX_RESUME_DELAY);
        warn!(delay_ms = delay.as_millis() as u64, "pausing sync worker for rate limit");

        job.status = JobStatus::Paused;
        job.resume_after_ms = Some(delay.as_millis() as u64);
        self.broker.save(job).await?;

        sleep(delay).await;

        job.status = JobStatus::Running;
        job.resume_after_ms = None;
        self.broker.save(job).await?;
        Ok(())
    }

    async fn fail(&self, job: &mut SyncJob, error: AppError) -> AppResult<()> {
        job.status = JobStatus::Failed;
        job.error = Some(error.to_string());
        job.finished_at = Some(now_unix_ms());
        self.broker.save(job).await?;
        info!(job_id = %job.id, error = %error, "sync job failed");
        Err(error)
    }
}

fn now_unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{FetchRequest, Fetcher, HttpTransport, TransportError, TransportResponse};
    use crate::queue::InMemoryJobBroker;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct EmptyCatalogTransport {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl HttpTransport for EmptyCatalogTransport {
        async fn get(
            &self,
            _url: &str,
            _query: &[(String, String)],
        ) -> Result<TransportResponse, TransportError> {
            let mut calls = self.calls.lock();
            *calls += 1;
            Ok(TransportResponse {
                status: 200,
                body: serde_json::json!({"facets": {}}),
                retry_after: None,
            })
        }
    }

    #[tokio::test]
    async fn empty_collection_catalog_completes_with_zero_collections() {
        let transport = Arc::new(EmptyCatalogTransport {
            calls: Mutex::new(0),
        });
        let fetcher = Fetcher::new(transport, crate::fetcher::PacingBounds::default());
        let config = Config {
            database_path: ":memory:".to_string(),
            port: 0,
            market_api_base: "https://example.test".to_string(),
            redis_url: "redis://127.0.0.1".to_string(),
            catalog_sync_queue: "catalog-sync".to_string(),
            catalog_sync_concurrency: 1,
            steam_page_size: 30,
            steam_max_auto_limit: 1200,
            steam_rate_ms: 3000,
            steam_rate_min_ms: 1200,
            steam_rate_max_ms: 12000,
            skin_float_source_url: None,
        };
        let market = Arc::new(MarketAdapter::new(fetcher, &config));
        let store = SqliteStore::new(":memory:").unwrap();
        let float_catalog = Arc::new(FloatCatalog::new(None));
        let broker: Arc<dyn JobBroker> = Arc::new(InMemoryJobBroker::default());

        let worker = SyncWorker::new(market, store.clone(), float_catalog, broker.clone(), &config);
        let job = broker.enqueue().await.unwrap();
        worker.run(&job.id).await.unwrap();

        let finished = broker.get(&job.id).await.unwrap().unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(finished.progress.total_collections, 0);
    }
}
