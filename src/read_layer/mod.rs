//! Persistent Read Layer: a façade for read-only endpoints that prefers
//! the store once the catalog is ready, and falls back transparently to
//! the live Market Adapter on any store error.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::error::AppResult;
use crate::market::MarketAdapter;
use crate::models::{Exterior, Rarity};
use crate::store::{SkinFilter, SqliteStore};

#[derive(Debug, Clone, Serialize)]
pub struct SkinsTotals {
    pub rarities: Vec<Rarity>,
    pub totals: HashMap<Rarity, u64>,
    pub sum: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkinSummary {
    pub market_hash_name: String,
    pub price: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PagedSkins {
    pub rarity: Rarity,
    pub start: u32,
    pub count: u32,
    pub total: u64,
    pub items: Vec<SkinSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupedTarget {
    pub base_name: String,
    pub exteriors: Vec<Exterior>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionSummary {
    pub id: String,
    pub display_name: String,
    pub steam_tag: String,
}

pub struct ReadLayer {
    store: Arc<SqliteStore>,
    market: Arc<MarketAdapter>,
}

impl ReadLayer {
    pub fn new(store: Arc<SqliteStore>, market: Arc<MarketAdapter>) -> Self {
        Self { store, market }
    }

    fn catalog_ready(&self) -> bool {
        match self.store.catalog_ready() {
            Ok(ready) => ready,
            Err(e) => {
                warn!(error = %e, "catalog-ready probe failed, treating as not ready");
                false
            }
        }
    }

    pub async fn rarity_totals(
        &self,
        rarities: &[Rarity],
        normal_only: bool,
    ) -> AppResult<SkinsTotals> {
        if self.catalog_ready() {
            if let Ok(totals) = self.rarity_totals_from_store(rarities, normal_only) {
                return Ok(totals);
            }
            warn!("store read failed for rarity totals, falling back to live API");
        }
        self.rarity_totals_from_live(rarities, normal_only).await
    }

    fn rarity_totals_from_store(
        &self,
        rarities: &[Rarity],
        normal_only: bool,
    ) -> AppResult<SkinsTotals> {
        let filter = SkinFilter {
            collection_id: None,
            rarity: None,
            normal_only,
        };
        let counts = self.store.group_counts_by_rarity(&filter)?;

        let mut totals = HashMap::new();
        let mut sum = 0u64;
        for &rarity in rarities {
            let count = counts.get(&rarity).copied().unwrap_or(0);
            totals.insert(rarity, count);
            sum += count;
        }
        Ok(SkinsTotals {
            rarities: rarities.to_vec(),
            totals,
            sum,
        })
    }

    async fn rarity_totals_from_live(
        &self,
        rarities: &[Rarity],
        normal_only: bool,
    ) -> AppResult<SkinsTotals> {
        let mut totals = HashMap::new();
        let mut sum = 0u64;
        for &rarity in rarities {
            let page = self.market.search_by_rarity(rarity, 0, 1, normal_only).await?;
            totals.insert(rarity, page.total);
            sum += page.total;
        }
        Ok(SkinsTotals {
            rarities: rarities.to_vec(),
            totals,
            sum,
        })
    }

    /// Cross-rarity list of every known collection, ordered by display
    /// name — `collection.findMany({orderBy: name asc})`.
    pub async fn collection_summaries(&self) -> AppResult<Vec<CollectionSummary>> {
        if self.catalog_ready() {
            if let Ok(collections) = self.store.list_collections() {
                return Ok(collections
                    .into_iter()
                    .map(|c| CollectionSummary {
                        id: c.id,
                        display_name: c.display_name,
                        steam_tag: c.steam_tag,
                    })
                    .collect());
            }
            warn!("store read failed for collection summaries, falling back to live API");
        }

        let mut tags = self.market.fetch_collection_tags().await?;
        tags.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tags
            .into_iter()
            .map(|t| CollectionSummary {
                id: t.tag.clone(),
                display_name: t.name,
                steam_tag: t.tag,
            })
            .collect())
    }

    pub async fn single_rarity_page(
        &self,
        rarity: Rarity,
        start: u32,
        count: u32,
        normal_only: bool,
    ) -> AppResult<PagedSkins> {
        let count = count.clamp(1, 30);
        if self.catalog_ready() {
            let filter = SkinFilter {
                collection_id: None,
                rarity: Some(rarity),
                normal_only,
            };
            match (self.store.count_skins(&filter), self.store.find_skins_paged(&filter, start, count)) {
                (Ok(total), Ok(skins)) => {
                    return Ok(PagedSkins {
                        rarity,
                        start,
                        count,
                        total,
                        items: skins
                            .into_iter()
                            .map(|s| SkinSummary {
                                market_hash_name: s.market_hash_name,
                                price: s.last_known_price,
                            })
                            .collect(),
                    });
                }
                _ => warn!("store read failed for single-rarity page, falling back to live API"),
            }
        }

        let page = self.market.search_by_rarity(rarity, start, count, normal_only).await?;
        Ok(PagedSkins {
            rarity,
            start,
            count,
            total: page.total,
            items: page
                .items
                .into_iter()
                .map(|i| SkinSummary {
                    market_hash_name: i.market_hash_name,
                    price: i.price,
                })
                .collect(),
        })
    }

    pub async fn all_names_by_rarity(
        &self,
        rarity: Rarity,
        normal_only: bool,
    ) -> AppResult<Vec<String>> {
        if self.catalog_ready() {
            let filter = SkinFilter {
                collection_id: None,
                rarity: Some(rarity),
                normal_only,
            };
            if let Ok(total) = self.store.count_skins(&filter) {
                if let Ok(skins) = self.store.find_skins_paged(&filter, 0, total.max(1) as u32) {
                    return Ok(skins.into_iter().map(|s| s.market_hash_name).collect());
                }
            }
            warn!("store read failed for names-by-rarity, falling back to live API");
        }

        let mut names = Vec::new();
        let mut start = 0u32;
        loop {
            let page = self.market.search_by_rarity(rarity, start, 30, normal_only).await?;
            if page.items.is_empty() {
                break;
            }
            let got = page.items.len() as u32;
            names.extend(page.items.into_iter().map(|i| i.market_hash_name));
            start += got;
            if (start as u64) >= page.total {
                break;
            }
        }
        Ok(names)
    }

    /// Collection targets by rarity, grouped by `baseName` with exteriors
    /// sorted into their canonical wear order.
    pub async fn collection_targets(
        &self,
        tag: &str,
        rarity: Rarity,
    ) -> AppResult<Vec<GroupedTarget>> {
        if self.catalog_ready() {
            let filter = SkinFilter {
                collection_id: None,
                rarity: Some(rarity),
                normal_only: true,
            };
            if let Ok(Some((_, skins))) = self.store.find_collection_by_tag(tag, &filter) {
                return Ok(group_by_base_name(
                    skins.into_iter().map(|s| (s.base_name, s.exterior)),
                ));
            }
            warn!("store read failed for collection targets, falling back to live API");
        }

        let page = self
            .market
            .search_by_collection(tag, Some(rarity), 0, 30, true)
            .await?;
        Ok(group_by_base_name(page.items.into_iter().map(|i| {
            let (base_name, exterior, _, _) = crate::models::Skin::parse_name(&i.market_hash_name);
            (base_name, exterior)
        })))
    }

    /// Candidate inputs: the rarity one rung below `target_rarity`.
    pub async fn collection_inputs(
        &self,
        tag: &str,
        target_rarity: Rarity,
    ) -> AppResult<Vec<GroupedTarget>> {
        let Some(input_rarity) = target_rarity.input_rarity() else {
            return Ok(Vec::new());
        };
        self.collection_targets(tag, input_rarity).await
    }
}

fn group_by_base_name(items: impl Iterator<Item = (String, Exterior)>) -> Vec<GroupedTarget> {
    let mut grouped: HashMap<String, Vec<Exterior>> = HashMap::new();
    for (base_name, exterior) in items {
        let entry = grouped.entry(base_name).or_default();
        if !entry.contains(&exterior) {
            entry.push(exterior);
        }
    }

    let mut out: Vec<GroupedTarget> = grouped
        .into_iter()
        .map(|(base_name, mut exteriors)| {
            exteriors.sort_by_key(|e| Exterior::ALL.iter().position(|x| x == e).unwrap());
            GroupedTarget {
                base_name,
                exteriors,
            }
        })
        .collect();
    out.sort_by(|a, b| a.base_name.cmp(&b.base_name));
    out
}
