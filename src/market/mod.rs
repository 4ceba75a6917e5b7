//! Market Adapter: typed endpoints built on the [`Fetcher`], each one
//! idempotent and cached under its own key prefix.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;
use tracing::warn;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::fetcher::{FetchRequest, Fetcher};
use crate::models::{parse_price, Rarity};

const LISTING_TOTAL_ATTEMPTS: u32 = 3;
const LISTING_TOTAL_PAUSE: Duration = Duration::from_secs(16);
const SEARCH_PAGE_CAP: u32 = 10;

pub struct MarketItem {
    pub market_hash_name: String,
    pub sell_listings: u64,
    pub price: Option<f64>,
}

pub struct SearchResult {
    pub total: u64,
    pub items: Vec<MarketItem>,
}

pub struct CollectionTag {
    pub tag: String,
    pub name: String,
    pub count: u64,
}

pub struct InspectLink {
    pub listing_id: String,
    pub asset_id: String,
    pub inspect_link: String,
}

#[derive(Deserialize)]
struct RawListing {
    #[serde(default)]
    asset: Option<RawAsset>,
    #[serde(default)]
    sell_price_text: Option<String>,
    #[serde(default)]
    listingid: Option<String>,
}

#[derive(Deserialize)]
struct RawAsset {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    market_actions: Option<Vec<RawMarketAction>>,
}

#[derive(Deserialize)]
struct RawMarketAction {
    #[serde(default)]
    link: Option<String>,
}

#[derive(Deserialize)]
struct RawSearchResponse {
    #[serde(default)]
    total_count: u64,
    #[serde(default)]
    results: Vec<RawListing>,
}

#[derive(Deserialize)]
struct RawPriceOverview {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    lowest_price: Option<String>,
    #[serde(default)]
    median_price: Option<String>,
}

#[derive(Deserialize)]
struct RawAppFilters {
    #[serde(default)]
    facets: Option<RawFacets>,
}

#[derive(Deserialize)]
struct RawFacets {
    #[serde(rename = "730_ItemSet")]
    item_set: Option<RawFacetBucket>,
}

#[derive(Deserialize)]
struct RawFacetBucket {
    #[serde(default)]
    tags: std::collections::HashMap<String, RawFacetTag>,
}

#[derive(Deserialize)]
struct RawFacetTag {
    #[serde(default)]
    localized_name: String,
    #[serde(default)]
    count: u64,
}

pub struct MarketAdapter {
    fetcher: Fetcher,
    base_url: String,
}

impl MarketAdapter {
    pub fn new(fetcher: Fetcher, config: &Config) -> Self {
        Self {
            fetcher,
            base_url: config.market_api_base.clone(),
        }
    }

    /// `getPriceUSD` — parses the vendor's free-form price string, falling
    /// back to `None` whenever the call fails or the field is unparseable.
    pub async fn get_price_usd(&self, market_hash_name: &str) -> AppResult<Option<f64>> {
        let url = format!("{}/market/priceoverview/", self.base_url);
        let request = FetchRequest {
            url,
            query: vec![
                ("appid".to_string(), "730".to_string()),
                ("currency".to_string(), "1".to_string()),
                ("market_hash_name".to_string(), market_hash_name.to_string()),
            ],
            cache_key: format!("price:{market_hash_name}"),
        };

        let raw: RawPriceOverview = match self.fetcher.get_data(request).await {
            Ok(v) => v,
            Err(AppError::RateLimited { retry_after }) => {
                return Err(AppError::RateLimited { retry_after })
            }
            Err(_) => return Ok(None),
        };

        if !raw.success {
            return Ok(None);
        }

        let text = raw.lowest_price.or(raw.median_price);
        Ok(text.and_then(|t| parse_price(&t)))
    }

    /// `searchByRarity` — `count` must sit in `[1, 30]`.
    pub async fn search_by_rarity(
        &self,
        rarity: Rarity,
        start: u32,
        count: u32,
        normal_only: bool,
    ) -> AppResult<SearchResult> {
        let count = count.clamp(1, 30);
        self.search(rarity.tag(), None, start, count, normal_only)
            .await
    }

    /// `searchByCollection` — internally paginates the upstream search at
    /// a hard cap of [`SEARCH_PAGE_CAP`] calls per invocation.
    pub async fn search_by_collection(
        &self,
        collection_tag: &str,
        rarity: Option<Rarity>,
        start: u32,
        count: u32,
        normal_only: bool,
    ) -> AppResult<SearchResult> {
        let count = count.clamp(1, 30);
        let rarity_tag = rarity.map(|r| r.tag());

        let mut items = Vec::new();
        let mut total = 0u64;
        let mut cursor = start;
        let mut pages = 0u32;

        loop {
            let page = self
                .search(collection_tag, rarity_tag, cursor, count, normal_only)
                .await?;
            total = page.total;
            let got = page.items.len() as u32;
            items.extend(page.items);
            pages += 1;
            cursor += count;

            if got < count || pages >= SEARCH_PAGE_CAP || (cursor as u64) >= total {
                break;
            }
        }

        Ok(SearchResult { total, items })
    }

    async fn search(
        &self,
        primary_tag: &str,
        rarity_tag: Option<&str>,
        start: u32,
        count: u32,
        normal_only: bool,
    ) -> AppResult<SearchResult> {
        let mut query_parts = vec![primary_tag.to_string()];
        if let Some(rt) = rarity_tag {
            query_parts.push(rt.to_string());
        }
        let category_query = query_parts.join(",");

        let url = format!("{}/market/search/render/", self.base_url);
        let cache_key = format!(
            "search:{category_query}:{start}:{count}:{normal_only}"
        );
        let request = FetchRequest {
            url,
            query: vec![
                ("appid".to_string(), "730".to_string()),
                ("norender".to_string(), "1".to_string()),
                ("start".to_string(), start.to_string()),
                ("count".to_string(), count.to_string()),
                ("category_730_ItemSet[]".to_string(), category_query),
            ],
            cache_key,
        };

        let raw: RawSearchResponse = self.fetcher.get_data(request).await?;

        let items = raw
            .results
            .into_iter()
            .filter_map(|listing| {
                let market_hash_name = listing
                    .asset
                    .as_ref()
                    .and_then(|a| a.id.clone())
                    .unwrap_or_default();
                if market_hash_name.is_empty() {
                    return None;
                }
                if normal_only
                    && (market_hash_name.contains("StatTrak\u{2122}")
                        || market_hash_name.starts_with("Souvenir "))
                {
                    return None;
                }
                let price = listing.sell_price_text.as_deref().and_then(parse_price);
                Some(MarketItem {
                    market_hash_name,
                    sell_listings: 0,
                    price,
                })
            })
            .collect::<Vec<_>>();

        let mut items = items;
        items.sort_by(|a, b| a.market_hash_name.cmp(&b.market_hash_name));

        Ok(SearchResult {
            total: raw.total_count,
            items,
        })
    }

    /// `fetchCollectionTags` — derived from the `730_ItemSet` app-filter
    /// facet.
    pub async fn fetch_collection_tags(&self) -> AppResult<Vec<CollectionTag>> {
        let url = format!("{}/market/appfilters/730", self.base_url);
        let request = FetchRequest {
            url,
            query: vec![],
            cache_key: "appfilters".to_string(),
        };

        let raw: RawAppFilters = self.fetcher.get_data(request).await?;
        let tags = raw
            .facets
            .and_then(|f| f.item_set)
            .map(|bucket| {
                bucket
                    .tags
                    .into_iter()
                    .map(|(tag, meta)| CollectionTag {
                        tag,
                        name: meta.localized_name,
                        count: meta.count,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(tags)
    }

    /// `fetchListingTotalCount` — up to three attempts with a 16-second
    /// pause whenever the upstream replies `429`.
    pub async fn fetch_listing_total_count(
        &self,
        market_hash_name: &str,
    ) -> AppResult<Option<u64>> {
        let url = format!("{}/market/listings/730/{}", self.base_url, market_hash_name);

        for attempt in 1..=LISTING_TOTAL_ATTEMPTS {
            let request = FetchRequest {
                url: url.clone(),
                query: vec![("count".to_string(), "1".to_string())],
                cache_key: format!("listingTotal:{market_hash_name}"),
            };

            match self.fetcher.get_data::<RawSearchResponse>(request).await {
                Ok(raw) => return Ok(Some(raw.total_count)),
                Err(AppError::RateLimited { .. }) if attempt < LISTING_TOTAL_ATTEMPTS => {
                    warn!(attempt, market_hash_name, "listing total rate limited, pausing");
                    sleep(LISTING_TOTAL_PAUSE).await;
                }
                Err(AppError::RateLimited { .. }) => return Ok(None),
                Err(_) => return Ok(None),
            }
        }

        Ok(None)
    }

    /// `fetchListingInspectLinks` — populates the inspect-link template
    /// with literal values; owner/amount are fixed to `0`/`1`.
    pub async fn fetch_listing_inspect_links(
        &self,
        market_hash_name: &str,
        start: u32,
        count: u32,
    ) -> AppResult<Vec<InspectLink>> {
        let url = format!("{}/market/listings/730/{}/render", self.base_url, market_hash_name);
        let request = FetchRequest {
            url,
            query: vec![
                ("start".to_string(), start.to_string()),
                ("count".to_string(), count.to_string()),
            ],
            cache_key: format!("inspect:{market_hash_name}:{start}:{count}"),
        };

        let raw: RawSearchResponse = self.fetcher.get_data(request).await?;

        let links = raw
            .results
            .into_iter()
            .filter_map(|listing| {
                let listing_id = listing.listingid?;
                let asset_id = listing.asset.as_ref()?.id.clone()?;
                let template = listing
                    .asset
                    .as_ref()?
                    .market_actions
                    .as_ref()?
                    .first()?
                    .link
                    .clone()?;
                let inspect_link = template
                    .replace("%listingid%", &listing_id)
                    .replace("%assetid%", &asset_id)
                    .replace("%owner%", "0")
                    .replace("%amount%", "1");
                Some(InspectLink {
                    listing_id,
                    asset_id,
                    inspect_link,
                })
            })
            .collect();

        Ok(links)
    }
}

pub fn new_market_adapter(fetcher: Fetcher, config: &Config) -> Arc<MarketAdapter> {
    Arc::new(MarketAdapter::new(fetcher, config))
}
