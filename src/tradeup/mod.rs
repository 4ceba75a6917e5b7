//! Trade-up EV engine: a pure computation over ten input items and a set
//! of candidate output collections. No I/O of its own — prices are
//! supplied by the caller via [`PriceLookup`].

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::float_catalog::FloatCatalog;
use crate::models::{to_market_hash_name, Exterior};

const MIN_INPUTS: usize = 1;
const MAX_INPUTS: usize = 10;
const DEFAULT_BUYER_TO_NET_RATE: f64 = 1.15;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeupInputSlot {
    pub market_hash_name: String,
    pub float: f64,
    pub collection_id: String,
    #[serde(default)]
    pub min_float: Option<f64>,
    #[serde(default)]
    pub max_float: Option<f64>,
    #[serde(default)]
    pub price_override_net: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetOutputEntry {
    pub base_name: String,
    pub min_float: f64,
    pub max_float: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetCollection {
    pub collection_id: String,
    pub covert: Vec<TargetOutputEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetOverride {
    pub collection_id: String,
    pub base_name: String,
    #[serde(default)]
    pub min_float: Option<f64>,
    #[serde(default)]
    pub max_float: Option<f64>,
    #[serde(default)]
    pub market_hash_name: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub exterior: Option<Exterior>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeupOptions {
    #[serde(default = "default_buyer_to_net_rate")]
    pub buyer_to_net_rate: f64,
}

impl Default for TradeupOptions {
    fn default() -> Self {
        Self {
            buyer_to_net_rate: DEFAULT_BUYER_TO_NET_RATE,
        }
    }
}

fn default_buyer_to_net_rate() -> f64 {
    DEFAULT_BUYER_TO_NET_RATE
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeupRequest {
    pub inputs: Vec<TradeupInputSlot>,
    pub targets: Vec<TargetCollection>,
    #[serde(default)]
    pub options: Option<TradeupOptions>,
    #[serde(default)]
    pub target_overrides: Vec<TargetOverride>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputResult {
    pub market_hash_name: String,
    pub buyer_price: Option<f64>,
    pub net_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeResult {
    pub base_name: String,
    pub min_float: f64,
    pub max_float: f64,
    pub roll_float: f64,
    pub exterior: Exterior,
    pub wear_range: (f64, f64),
    pub probability: f64,
    pub buyer_price: Option<f64>,
    pub net_price: Option<f64>,
    pub price_error: Option<String>,
    pub market_hash_name: String,
    pub within_range: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeupResult {
    pub normalized_average_float: f64,
    pub normalization_mode: &'static str,
    pub inputs: Vec<InputResult>,
    pub outcomes: Vec<OutcomeResult>,
    pub total_input_net: f64,
    pub total_outcome_net: f64,
    pub expected_value: f64,
    pub max_budget_per_slot: f64,
    pub positive_outcome_probability: f64,
    pub warnings: Vec<String>,
}

/// Abstraction over price lookup so the engine stays pure and testable
/// without a real Market Adapter / Fetcher in the loop.
#[async_trait]
pub trait PriceLookup: Send + Sync {
    async fn price_for(&self, market_hash_name: &str) -> AppResult<Option<f64>>;
}

pub struct TradeupEngine<'a> {
    float_catalog: &'a FloatCatalog,
}

impl<'a> TradeupEngine<'a> {
    pub fn new(float_catalog: &'a FloatCatalog) -> Self {
        Self { float_catalog }
    }

    pub async fn calculate(
        &self,
        request: TradeupRequest,
        prices: &dyn PriceLookup,
    ) -> AppResult<TradeupResult> {
        if request.inputs.is_empty() {
            return Err(AppError::Fatal("no input slots supplied".into()));
        }
        if request.inputs.len() > MAX_INPUTS || request.inputs.len() < MIN_INPUTS {
            return Err(AppError::Fatal(format!(
                "expected between {MIN_INPUTS} and {MAX_INPUTS} input slots, got {}",
                request.inputs.len()
            )));
        }
        if request.targets.is_empty() {
            return Err(AppError::Fatal("no valid target collection".into()));
        }

        let mut warnings = Vec::new();
        let n = request.inputs.len() as f64;

        let clamped_floats: Vec<f64> = request
            .inputs
            .iter()
            .map(|slot| slot.float.clamp(0.0, 1.0))
            .collect();
        let avg: f64 = clamped_floats.iter().sum::<f64>() / n;

        let mut normalized_sum = 0.0;
        let mut normalization_failed = false;
        for (slot, &float) in request.inputs.iter().zip(&clamped_floats) {
            let range = slot
                .min_float
                .zip(slot.max_float)
                .or_else(|| {
                    let base = crate::models::base_from_market_hash(&slot.market_hash_name);
                    self.float_catalog
                        .lookup(&base)
                        .map(|r| (r.min_float, r.max_float))
                });
            match range {
                Some((min, max)) if max > min => {
                    normalized_sum += ((float - min) / (max - min)).clamp(0.0, 1.0);
                }
                _ => {
                    normalization_failed = true;
                    break;
                }
            }
        }

        let (normalized_average_float, normalization_mode) = if normalization_failed {
            warnings.push(
                "one or more input slots lack a usable float range; falling back to simple mean"
                    .to_string(),
            );
            (avg, "simple")
        } else {
            (normalized_sum / n, "normalized")
        };

        let mut collection_counts: HashMap<String, usize> = HashMap::new();
        for slot in &request.inputs {
            *collection_counts.entry(slot.collection_id.clone()).or_insert(0) += 1;
        }

        let override_index: HashMap<(String, String), &TargetOverride> = request
            .target_overrides
            .iter()
            .map(|o| {
                (
                    (o.collection_id.to_lowercase(), o.base_name.to_lowercase()),
                    o,
                )
            })
            .collect();

        let buyer_to_net_rate = request
            .options
            .as_ref()
            .map(|o| o.buyer_to_net_rate)
            .unwrap_or(DEFAULT_BUYER_TO_NET_RATE);
        if buyer_to_net_rate <= 1.0 {
            return Err(AppError::Validation(
                "buyerToNetRate must be greater than 1".into(),
            ));
        }

        let mut outcomes = Vec::new();
        for target in &request.targets {
            let Some(&count) = collection_counts.get(&target.collection_id) else {
                continue;
            };
            let p_c = count as f64 / n;
            let covert_len = target.covert.len().max(1) as f64;

            for entry in &target.covert {
                let key = (
                    target.collection_id.to_lowercase(),
                    entry.base_name.to_lowercase(),
                );
                let override_entry = override_index.get(&key);

                let min_float = override_entry
                    .and_then(|o| o.min_float)
                    .unwrap_or(entry.min_float);
                let max_float = override_entry
                    .and_then(|o| o.max_float)
                    .unwrap_or(entry.max_float);

                let raw_roll = normalized_average_float * (max_float - min_float) + min_float;
                let within_range = raw_roll >= min_float && raw_roll <= max_float;
                if !within_range {
                    warnings.push(format!(
                        "roll float {raw_roll:.4} for {} fell outside [{min_float}, {max_float}]; clamped",
                        entry.base_name
                    ));
                }
                let roll_float = raw_roll.clamp(min_float, max_float);

                let exterior = override_entry
                    .and_then(|o| o.exterior)
                    .unwrap_or_else(|| Exterior::bucket(roll_float));

                let market_hash_name = override_entry
                    .and_then(|o| o.market_hash_name.clone())
                    .unwrap_or_else(|| to_market_hash_name(&entry.base_name, exterior));

                let probability = p_c / covert_len;

                let (buyer_price, price_error) = if let Some(p) = override_entry.and_then(|o| o.price)
                {
                    (Some(p), None)
                } else {
                    match prices.price_for(&market_hash_name).await {
                        Ok(price) => (price, None),
                        Err(AppError::RateLimited { .. }) => {
                            (None, Some("rate limited while pricing outcome".to_string()))
                        }
                        Err(e) => (None, Some(e.to_string())),
                    }
                };

                let net_price = buyer_price.map(|p| p / buyer_to_net_rate);

                outcomes.push(OutcomeResult {
                    base_name: entry.base_name.clone(),
                    min_float,
                    max_float,
                    roll_float,
                    exterior,
                    wear_range: exterior.range(),
                    probability,
                    buyer_price,
                    net_price,
                    price_error,
                    market_hash_name,
                    within_range,
                });
            }
        }

        let mut inputs = Vec::with_capacity(request.inputs.len());
        for slot in &request.inputs {
            let (buyer_price, net_price) = if let Some(net) = slot.price_override_net {
                (None, Some(net))
            } else {
                match prices.price_for(&slot.market_hash_name).await {
                    Ok(price) => (price, price.map(|p| p / buyer_to_net_rate)),
                    Err(_) => (None, None),
                }
            };
            inputs.push(InputResult {
                market_hash_name: slot.market_hash_name.clone(),
                buyer_price,
                net_price,
            });
        }

        let total_input_net: f64 = inputs.iter().filter_map(|i| i.net_price).sum();
        let total_outcome_net: f64 = outcomes
            .iter()
            .map(|o| o.probability * o.net_price.unwrap_or(0.0))
            .sum();
        let expected_value = total_outcome_net - total_input_net;
        let max_budget_per_slot = total_outcome_net / n;
        let positive_outcome_probability: f64 = outcomes
            .iter()
            .filter(|o| o.net_price.map(|p| p > total_input_net).unwrap_or(false))
            .map(|o| o.probability)
            .sum();

        let covered: HashSet<&String> =
            request.targets.iter().map(|t| &t.collection_id).collect();
        if request
            .inputs
            .iter()
            .any(|s| !covered.contains(&s.collection_id))
        {
            warnings.push(
                "one or more input slots reference a collection outside the chosen targets; \
                 probability mass does not sum to 1"
                    .to_string(),
            );
        }

        Ok(TradeupResult {
            normalized_average_float,
            normalization_mode,
            inputs,
            outcomes,
            total_input_net,
            total_outcome_net,
            expected_value,
            max_budget_per_slot,
            positive_outcome_probability,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPrices(HashMap<String, f64>);

    #[async_trait]
    impl PriceLookup for FixedPrices {
        async fn price_for(&self, market_hash_name: &str) -> AppResult<Option<f64>> {
            Ok(self.0.get(market_hash_name).copied())
        }
    }

    fn slot(float: f64, collection_id: &str) -> TradeupInputSlot {
        TradeupInputSlot {
            market_hash_name: "Input Skin (Field-Tested)".to_string(),
            float,
            collection_id: collection_id.to_string(),
            min_float: Some(0.0),
            max_float: Some(1.0),
            price_override_net: Some(1.0),
        }
    }

    #[tokio::test]
    async fn ev_happy_path() {
        let catalog = FloatCatalog::new(None);
        let engine = TradeupEngine::new(&catalog);

        let inputs = vec![slot(0.20, "X"); 10];
        let target = TargetCollection {
            collection_id: "X".to_string(),
            covert: vec![TargetOutputEntry {
                base_name: "AK".to_string(),
                min_float: 0.0,
                max_float: 0.5,
            }],
        };

        let mut prices = HashMap::new();
        prices.insert("AK (Minimal Wear)".to_string(), 15.0);
        let lookup = FixedPrices(prices);

        let request = TradeupRequest {
            inputs,
            targets: vec![target],
            options: None,
            target_overrides: vec![],
        };

        let result = engine.calculate(request, &lookup).await.unwrap();

        assert!((result.normalized_average_float - 0.20).abs() < 1e-9);
        assert_eq!(result.outcomes.len(), 1);
        let outcome = &result.outcomes[0];
        assert!((outcome.roll_float - 0.10).abs() < 1e-9);
        assert_eq!(outcome.exterior, Exterior::MinimalWear);
        assert!((outcome.probability - 1.0).abs() < 1e-9);
        assert!((result.total_input_net - 10.0).abs() < 1e-9);
        assert!((result.expected_value - 3.0434782608695645).abs() < 1e-6);
    }

    #[tokio::test]
    async fn mixed_collections_split_probability_evenly() {
        let catalog = FloatCatalog::new(None);
        let engine = TradeupEngine::new(&catalog);

        let mut inputs = vec![slot(0.20, "A"); 5];
        inputs.extend(vec![slot(0.20, "B"); 5]);

        let targets = vec![
            TargetCollection {
                collection_id: "A".to_string(),
                covert: vec![TargetOutputEntry {
                    base_name: "Alpha".to_string(),
                    min_float: 0.0,
                    max_float: 0.5,
                }],
            },
            TargetCollection {
                collection_id: "B".to_string(),
                covert: vec![TargetOutputEntry {
                    base_name: "Beta".to_string(),
                    min_float: 0.0,
                    max_float: 0.5,
                }],
            },
        ];

        let mut prices = HashMap::new();
        prices.insert("Alpha (Minimal Wear)".to_string(), 10.0);
        prices.insert("Beta (Minimal Wear)".to_string(), 10.0);
        let lookup = FixedPrices(prices);

        let request = TradeupRequest {
            inputs,
            targets,
            options: None,
            target_overrides: vec![],
        };

        let result = engine.calculate(request, &lookup).await.unwrap();
        assert_eq!(result.outcomes.len(), 2);
        for outcome in &result.outcomes {
            assert!((outcome.probability - 0.5).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn unknown_float_range_falls_back_to_simple_mean() {
        let catalog = FloatCatalog::new(None);
        let engine = TradeupEngine::new(&catalog);

        let mut inputs = vec![slot(0.20, "X"); 9];
        let mut unknown = slot(0.30, "X");
        unknown.min_float = None;
        unknown.max_float = None;
        unknown.market_hash_name = "Totally Unknown Skin (Field-Tested)".to_string();
        inputs.push(unknown);

        let target = TargetCollection {
            collection_id: "X".to_string(),
            covert: vec![TargetOutputEntry {
                base_name: "AK".to_string(),
                min_float: 0.0,
                max_float: 0.5,
            }],
        };

        let lookup = FixedPrices(HashMap::new());
        let request = TradeupRequest {
            inputs,
            targets: vec![target],
            options: None,
            target_overrides: vec![],
        };

        let result = engine.calculate(request, &lookup).await.unwrap();
        assert_eq!(result.normalization_mode, "simple");
        assert!(!result.warnings.is_empty());
    }

    #[tokio::test]
    async fn out_of_range_roll_is_clamped_and_warned() {
        let catalog = FloatCatalog::new(None);
        let engine = TradeupEngine::new(&catalog);

        let inputs = vec![slot(0.01, "X"); 10];
        let target = TargetCollection {
            collection_id: "X".to_string(),
            covert: vec![TargetOutputEntry {
                base_name: "AK".to_string(),
                min_float: 0.5,
                max_float: 0.9,
            }],
        };

        let lookup = FixedPrices(HashMap::new());
        let request = TradeupRequest {
            inputs,
            targets: vec![target],
            options: None,
            target_overrides: vec![],
        };

        let result = engine.calculate(request, &lookup).await.unwrap();
        let outcome = &result.outcomes[0];
        assert!(!outcome.within_range);
        assert_eq!(outcome.roll_float, 0.5);
        assert!(result.warnings.iter().any(|w| w.contains("clamped")));
    }

    #[tokio::test]
    async fn empty_inputs_is_fatal() {
        let catalog = FloatCatalog::new(None);
        let engine = TradeupEngine::new(&catalog);
        let lookup = FixedPrices(HashMap::new());
        let request = TradeupRequest {
            inputs: vec![],
            targets: vec![],
            options: None,
            target_overrides: vec![],
        };
        let err = engine.calculate(request, &lookup).await.unwrap_err();
        assert!(matches!(err, AppError::Fatal(_)));
    }
}
