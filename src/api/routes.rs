use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{AppError, AppResult};
use crate::models::Rarity;
use crate::queue::JobBroker;
use crate::tradeup::{
    PriceLookup, TargetCollection, TargetOutputEntry, TargetOverride, TradeupEngine,
    TradeupOptions, TradeupInputSlot, TradeupRequest,
};

use super::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/skins/totals", get(skins_totals))
        .route("/api/skins/paged", get(skins_paged))
        .route("/api/skins/names", get(skins_names))
        .route("/api/skins/listing-totals", post(listing_totals))
        .route("/api/priceoverview/batch", post(priceoverview_batch))
        .route("/api/tradeups/collections", get(collection_summaries))
        .route("/api/tradeups/collections/steam", get(collections_steam))
        .route(
            "/api/tradeups/collections/sync",
            get(sync_status).post(sync_trigger),
        )
        .route("/api/tradeups/collections/sync/:job_id", get(sync_job_by_id))
        .route("/api/tradeups/collections/:tag/targets", get(collection_targets))
        .route("/api/tradeups/collections/:tag/inputs", get(collection_inputs))
        .route("/api/tradeups/calculate", post(calculate_tradeup))
        .with_state(state)
}

fn parse_rarities(raw: &str) -> AppResult<Vec<Rarity>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Rarity::from_key(s).ok_or_else(|| AppError::Validation(format!("unknown rarity {s}"))))
        .collect()
}

fn parse_rarity(raw: &str) -> AppResult<Rarity> {
    Rarity::from_key(raw).ok_or_else(|| AppError::Validation(format!("unknown rarity {raw}")))
}

#[derive(Debug, Deserialize)]
pub struct TotalsQuery {
    rarities: String,
    #[serde(default, rename = "normalOnly")]
    normal_only: bool,
}

async fn skins_totals(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TotalsQuery>,
) -> AppResult<impl IntoResponse> {
    let rarities = parse_rarities(&query.rarities)?;
    let totals = state.read_layer.rarity_totals(&rarities, query.normal_only).await?;
    Ok(Json(totals))
}

#[derive(Debug, Deserialize)]
pub struct PagedQuery {
    rarity: String,
    #[serde(default)]
    start: u32,
    #[serde(default = "default_count")]
    count: u32,
    #[serde(default, rename = "normalOnly")]
    normal_only: bool,
}

fn default_count() -> u32 {
    30
}

async fn skins_paged(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PagedQuery>,
) -> AppResult<impl IntoResponse> {
    let rarity = parse_rarity(&query.rarity)?;
    let page = state
        .read_layer
        .single_rarity_page(rarity, query.start, query.count, query.normal_only)
        .await?;
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
pub struct NamesQuery {
    rarity: String,
    #[serde(default, rename = "normalOnly")]
    normal_only: bool,
}

async fn skins_names(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NamesQuery>,
) -> AppResult<impl IntoResponse> {
    let rarity = parse_rarity(&query.rarity)?;
    let names = state
        .read_layer
        .all_names_by_rarity(rarity, query.normal_only)
        .await?;

    let dir = std::path::Path::new("server/data");
    std::fs::create_dir_all(dir).map_err(|e| AppError::Fatal(e.to_string()))?;
    let file = dir.join(format!("{}.json", rarity.key()));
    let payload = json!({ "rarity": rarity.key(), "total": names.len(), "names": names });
    std::fs::write(&file, serde_json::to_vec_pretty(&payload).unwrap_or_default())
        .map_err(|e| AppError::Fatal(e.to_string()))?;

    Ok(Json(json!({
        "rarity": rarity.key(),
        "total": names.len(),
        "file": file.to_string_lossy(),
        "names": names,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListingTotalsBody {
    names: Vec<String>,
}

async fn listing_totals(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ListingTotalsBody>,
) -> AppResult<impl IntoResponse> {
    if body.names.len() > 150 {
        return Err(AppError::Validation("at most 150 names per request".into()));
    }

    let mut totals = HashMap::new();
    for name in &body.names {
        let total = state.market.fetch_listing_total_count(name).await?;
        totals.insert(name.clone(), total);
    }
    Ok(Json(json!({ "totals": totals })))
}

#[derive(Debug, Deserialize)]
pub struct PriceBatchBody {
    names: Vec<String>,
}

async fn priceoverview_batch(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PriceBatchBody>,
) -> AppResult<impl IntoResponse> {
    if body.names.len() > 200 {
        return Err(AppError::Validation("at most 200 names per request".into()));
    }

    let mut prices = HashMap::new();
    for name in &body.names {
        let price = state.market.get_price_usd(name).await?;
        prices.insert(name.clone(), price);
    }
    Ok(Json(json!({ "prices": prices })))
}

async fn collection_summaries(State(state): State<Arc<AppState>>) -> AppResult<impl IntoResponse> {
    let collections = state.read_layer.collection_summaries().await?;
    Ok(Json(collections))
}

async fn collections_steam(State(state): State<Arc<AppState>>) -> AppResult<impl IntoResponse> {
    let tags = state.market.fetch_collection_tags().await?;
    let body: Vec<_> = tags
        .into_iter()
        .map(|t| json!({ "tag": t.tag, "name": t.name, "count": t.count, "collectionId": t.tag }))
        .collect();
    Ok(Json(body))
}

async fn sync_trigger(State(state): State<Arc<AppState>>) -> AppResult<impl IntoResponse> {
    if let Some(existing) = state.broker.find_in_flight().await? {
        return Ok((StatusCode::ACCEPTED, Json(json!({ "job": existing }))));
    }

    let job = state.broker.enqueue().await?;

    let worker = crate::sync::SyncWorker::new(
        state.market.clone(),
        state.store.clone(),
        state.float_catalog.clone(),
        state.broker.clone(),
        &state.config,
    );
    let job_id = job.id.clone();
    tokio::spawn(async move {
        if let Err(e) = worker.run(&job_id).await {
            tracing::warn!(job_id, error = %e, "sync job ended in error");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(json!({ "job": job }))))
}

async fn sync_status(State(state): State<Arc<AppState>>) -> AppResult<impl IntoResponse> {
    let jobs = state.broker.list_recent(20).await?;
    let active = jobs.iter().any(|j| j.is_in_flight());
    Ok(Json(json!({ "active": active, "jobs": jobs })))
}

async fn sync_job_by_id(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    match state.broker.get(&job_id).await? {
        Some(job) => Ok(Json(json!({ "job": job }))),
        None => Err(AppError::NotFound(job_id)),
    }
}

#[derive(Debug, Deserialize)]
pub struct RarityQuery {
    rarity: String,
}

async fn collection_targets(
    State(state): State<Arc<AppState>>,
    Path(tag): Path<String>,
    Query(query): Query<RarityQuery>,
) -> AppResult<impl IntoResponse> {
    let rarity = parse_rarity(&query.rarity)?;
    let targets = state.read_layer.collection_targets(&tag, rarity).await?;
    Ok(Json(targets))
}

async fn collection_inputs(
    State(state): State<Arc<AppState>>,
    Path(tag): Path<String>,
    Query(query): Query<RarityQuery>,
) -> AppResult<impl IntoResponse> {
    let rarity = parse_rarity(&query.rarity)?;
    let inputs = state.read_layer.collection_inputs(&tag, rarity).await?;
    Ok(Json(inputs))
}

struct MarketPriceLookup {
    market: Arc<crate::market::MarketAdapter>,
}

#[async_trait::async_trait]
impl PriceLookup for MarketPriceLookup {
    async fn price_for(&self, market_hash_name: &str) -> AppResult<Option<f64>> {
        self.market.get_price_usd(market_hash_name).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculateTradeupBody {
    inputs: Vec<TradeupInputSlot>,
    target_collection_ids: Vec<String>,
    #[serde(default)]
    options: Option<TradeupOptions>,
    #[serde(default)]
    target_overrides: Vec<TargetOverride>,
}

/// Resolves each `collectionId` into its Covert target list via the
/// Persistent Read Layer and the Float Catalog — the only I/O boundary
/// between the HTTP surface and the otherwise-pure engine.
async fn resolve_targets(
    state: &AppState,
    collection_ids: &[String],
) -> AppResult<Vec<TargetCollection>> {
    let mut resolved = Vec::with_capacity(collection_ids.len());
    for collection_id in collection_ids {
        let grouped = state
            .read_layer
            .collection_targets(collection_id, Rarity::Covert)
            .await?;
        let covert = grouped
            .into_iter()
            .map(|g| {
                let range = state.float_catalog.lookup(&g.base_name).unwrap_or_default();
                TargetOutputEntry {
                    base_name: g.base_name,
                    min_float: range.min_float,
                    max_float: range.max_float,
                }
            })
            .collect();
        resolved.push(TargetCollection {
            collection_id: collection_id.clone(),
            covert,
        });
    }
    Ok(resolved)
}

async fn calculate_tradeup(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CalculateTradeupBody>,
) -> AppResult<impl IntoResponse> {
    if body.target_collection_ids.is_empty() {
        return Err(AppError::Fatal("no valid target collection".into()));
    }

    let targets = resolve_targets(&state, &body.target_collection_ids).await?;
    let request = TradeupRequest {
        inputs: body.inputs,
        targets,
        options: body.options,
        target_overrides: body.target_overrides,
    };

    let engine = TradeupEngine::new(&state.float_catalog);
    let lookup = MarketPriceLookup {
        market: state.market.clone(),
    };
    let result = engine.calculate(request, &lookup).await?;
    Ok(Json(result))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub fetcher_pause_ms: u64,
    pub fetcher_cooldown_ms: Option<u64>,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        fetcher_pause_ms: state.fetcher.current_pause_ms(),
        fetcher_cooldown_ms: state
            .fetcher
            .cooldown_remaining()
            .map(|d| d.as_millis() as u64),
    })
}
