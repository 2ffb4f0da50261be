//! Nutrient Resolution
//!
//! Resolves a normalized search term to one [`NutrientRecord`] using the USDA
//! `FoodData` Central search endpoint.
//!
//! ## Selection
//! The search asks for a full result page across several dataset categories.
//! The first food whose description contains the term (case-insensitive)
//! wins; without such a hit the first returned food is used anyway. Only an
//! empty result set fails, with [`NutrientResolutionError::NoMatch`].
//!
//! ## Caching
//! Resolved records are cached per lower-cased term in a Moka async cache.
//! Failures are never cached.

use anyhow::Context;
use async_trait::async_trait;
use moka::future::Cache as MokaCache;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{NutritionConfig, MIN_SEARCH_PAGE_SIZE};
use crate::error::NutrientResolutionError;
use crate::metrics::{self, Timer};

// Canonical nutrient names as reported by the nutrition database
pub const ENERGY: &str = "Energy";
pub const TOTAL_FAT: &str = "Total lipid (fat)";
pub const SATURATED_FAT: &str = "Fatty acids, total saturated";
pub const CHOLESTEROL: &str = "Cholesterol";
pub const SODIUM: &str = "Sodium, Na";
pub const CARBOHYDRATES: &str = "Carbohydrate, by difference";
pub const FIBER: &str = "Fiber, total dietary";
pub const SUGAR: &str = "Sugars, total including NLEA";
pub const PROTEIN: &str = "Protein";

pub const DEFAULT_SERVING_SIZE: &str = "100g";

const NOT_AVAILABLE: &str = "N/A";

/// A nutrient amount, or the "not available" sentinel.
///
/// Serialized as a JSON number, or the string `"N/A"` for the sentinel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NutrientValue {
    Amount(f64),
    NotAvailable,
}

impl NutrientValue {
    pub fn amount(&self) -> Option<f64> {
        match self {
            NutrientValue::Amount(v) => Some(*v),
            NutrientValue::NotAvailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.amount().is_some()
    }
}

impl From<Option<f64>> for NutrientValue {
    fn from(value: Option<f64>) -> Self {
        match value {
            Some(v) if v.is_finite() => NutrientValue::Amount(v),
            _ => NutrientValue::NotAvailable,
        }
    }
}

impl Serialize for NutrientValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            NutrientValue::Amount(v) => serializer.serialize_f64(*v),
            NutrientValue::NotAvailable => serializer.serialize_str(NOT_AVAILABLE),
        }
    }
}

impl<'de> Deserialize<'de> for NutrientValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(v) => NutrientValue::Amount(v),
            Raw::Text(_) => NutrientValue::NotAvailable,
        })
    }
}

/// Nutrition facts for one food, built from exactly one search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutrientRecord {
    pub name: String,
    pub serving_size: String,
    pub calories: NutrientValue,
    pub total_fat: NutrientValue,
    pub saturated_fat: NutrientValue,
    pub cholesterol: NutrientValue,
    pub sodium: NutrientValue,
    pub carbohydrates: NutrientValue,
    pub fiber: NutrientValue,
    pub sugar: NutrientValue,
    pub protein: NutrientValue,
}

/// One food in a search response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoodHit {
    pub description: String,
    #[serde(default)]
    pub food_nutrients: Vec<FoodNutrientEntry>,
    #[serde(default)]
    pub serving_size: Option<f64>,
    #[serde(default)]
    pub serving_size_unit: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoodNutrientEntry {
    #[serde(default)]
    pub nutrient_name: String,
    #[serde(default)]
    pub value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    foods: Vec<FoodHit>,
}

/// First food whose description contains `term` (case-insensitive), else the
/// first food. `None` only for an empty slice.
pub fn select_food<'a>(term: &str, foods: &'a [FoodHit]) -> Option<&'a FoodHit> {
    let needle = term.to_lowercase();
    foods
        .iter()
        .find(|food| food.description.to_lowercase().contains(&needle))
        .or_else(|| foods.first())
}

fn nutrient_value(food: &FoodHit, name: &str) -> NutrientValue {
    food.food_nutrients
        .iter()
        .find(|n| n.nutrient_name == name)
        .and_then(|n| n.value)
        .into()
}

fn serving_size(food: &FoodHit) -> String {
    match food.serving_size {
        Some(size) if size.is_finite() && size > 0.0 => {
            let unit = match food.serving_size_unit.as_deref().map(str::trim) {
                None | Some("") => "g".to_string(),
                Some(u) if u.eq_ignore_ascii_case("grm") => "g".to_string(),
                Some(u) if u.eq_ignore_ascii_case("mlt") => "ml".to_string(),
                Some(u) => u.to_lowercase(),
            };
            format!("{}{}", size, unit)
        }
        _ => DEFAULT_SERVING_SIZE.to_string(),
    }
}

pub fn extract_record(food: &FoodHit) -> NutrientRecord {
    NutrientRecord {
        name: food.description.clone(),
        serving_size: serving_size(food),
        calories: nutrient_value(food, ENERGY),
        total_fat: nutrient_value(food, TOTAL_FAT),
        saturated_fat: nutrient_value(food, SATURATED_FAT),
        cholesterol: nutrient_value(food, CHOLESTEROL),
        sodium: nutrient_value(food, SODIUM),
        carbohydrates: nutrient_value(food, CARBOHYDRATES),
        fiber: nutrient_value(food, FIBER),
        sugar: nutrient_value(food, SUGAR),
        protein: nutrient_value(food, PROTEIN),
    }
}

#[async_trait]
pub trait NutrientResolver: Send + Sync {
    async fn resolve(&self, search_term: &str) -> Result<NutrientRecord, NutrientResolutionError>;
}

/// Resolver backed by the USDA `FoodData` Central search API
pub struct UsdaResolver {
    config: NutritionConfig,
    http_client: reqwest::Client,
    cache: MokaCache<String, NutrientRecord>,
}

impl UsdaResolver {
    pub fn new(config: NutritionConfig) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create nutrition HTTP client")?;

        let cache = MokaCache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(config.cache_ttl_secs))
            .build();

        Ok(Self {
            config,
            http_client,
            cache,
        })
    }

    /// Run one search and return every food on the result page.
    pub async fn search(&self, query: &str) -> Result<Vec<FoodHit>, NutrientResolutionError> {
        let timer = Timer::new();
        metrics::NUTRIENT_LOOKUPS.inc();

        let url = format!("{}/foods/search", self.config.base_url.trim_end_matches('/'));
        let page_size = self.config.page_size.max(MIN_SEARCH_PAGE_SIZE).to_string();
        let data_types = self.config.data_types.join(",");

        let response = self
            .http_client
            .get(&url)
            .query(&[
                ("query", query),
                ("pageSize", page_size.as_str()),
                ("dataType", data_types.as_str()),
                ("api_key", self.config.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                warn!(query = %query, "Nutrition search failed: {}", e);
                NutrientResolutionError::Transport(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(query = %query, status = status.as_u16(), "Nutrition database rejected search");
            return Err(NutrientResolutionError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| NutrientResolutionError::Transport(e.to_string()))?;
        let parsed: SearchResponse = serde_json::from_slice(&body)
            .map_err(|e| NutrientResolutionError::Malformed(format!("JSON parse error: {}", e)))?;

        timer.observe_duration_seconds(&metrics::NUTRIENT_LATENCY);
        debug!(query = %query, hits = parsed.foods.len(), "Nutrition search returned");
        Ok(parsed.foods)
    }
}

#[async_trait]
impl NutrientResolver for UsdaResolver {
    async fn resolve(&self, search_term: &str) -> Result<NutrientRecord, NutrientResolutionError> {
        let term = search_term.trim();
        if term.is_empty() {
            return Err(NutrientResolutionError::NoMatch {
                term: search_term.to_string(),
            });
        }

        let cache_key = term.to_lowercase();
        if let Some(record) = self.cache.get(&cache_key) {
            metrics::NUTRIENT_CACHE_HITS.inc();
            return Ok(record);
        }

        let foods = self.search(term).await?;
        let food = select_food(term, &foods).ok_or_else(|| NutrientResolutionError::NoMatch {
            term: term.to_string(),
        })?;
        let record = extract_record(food);
        debug!(term = %term, selected = %record.name, "Resolved nutrient record");

        self.cache.insert(cache_key, record.clone()).await;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn food(description: &str) -> FoodHit {
        FoodHit {
            description: description.to_string(),
            food_nutrients: Vec::new(),
            serving_size: None,
            serving_size_unit: None,
        }
    }

    fn entry(name: &str, value: f64) -> FoodNutrientEntry {
        FoodNutrientEntry {
            nutrient_name: name.to_string(),
            value: Some(value),
        }
    }

    #[test]
    fn test_select_prefers_substring_match() {
        let foods = vec![food("Taco salad"), food("Burrito, bean, fast food")];
        let chosen = select_food("burrito", &foods).unwrap();
        assert_eq!(chosen.description, "Burrito, bean, fast food");

        let foods = vec![food("Burrito, bean, fast food"), food("Taco salad")];
        assert_eq!(select_food("burrito", &foods).unwrap().description, "Burrito, bean, fast food");
    }

    #[test]
    fn test_select_falls_back_to_first_result() {
        let foods = vec![food("Taco salad"), food("Enchilada")];
        assert_eq!(select_food("burrito", &foods).unwrap().description, "Taco salad");
        assert!(select_food("burrito", &[]).is_none());
    }

    #[test]
    fn test_extract_maps_canonical_names() {
        let mut hit = food("Pizza, cheese");
        hit.food_nutrients = vec![
            entry(ENERGY, 266.0),
            entry(TOTAL_FAT, 10.0),
            entry(SUGAR, 3.6),
            entry("Fiber, total dietary (AOAC)", 2.0),
            entry(PROTEIN, 0.0),
        ];

        let record = extract_record(&hit);
        assert_eq!(record.name, "Pizza, cheese");
        assert_eq!(record.serving_size, DEFAULT_SERVING_SIZE);
        assert_eq!(record.calories, NutrientValue::Amount(266.0));
        assert_eq!(record.total_fat, NutrientValue::Amount(10.0));
        assert_eq!(record.sugar, NutrientValue::Amount(3.6));
        assert_eq!(record.protein, NutrientValue::Amount(0.0));
        // near-miss names do not count
        assert_eq!(record.fiber, NutrientValue::NotAvailable);
        assert_eq!(record.sodium, NutrientValue::NotAvailable);
    }

    #[test]
    fn test_serving_size_formatting() {
        let mut hit = food("Soda");
        hit.serving_size = Some(355.0);
        hit.serving_size_unit = Some("MLT".to_string());
        assert_eq!(serving_size(&hit), "355ml");

        hit.serving_size = Some(28.5);
        hit.serving_size_unit = None;
        assert_eq!(serving_size(&hit), "28.5g");
    }

    #[test]
    fn test_nutrient_value_json_shape() {
        let json = serde_json::to_string(&vec![NutrientValue::Amount(4.5), NutrientValue::NotAvailable]).unwrap();
        assert_eq!(json, r#"[4.5,"N/A"]"#);

        let back: Vec<NutrientValue> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![NutrientValue::Amount(4.5), NutrientValue::NotAvailable]);
    }
}
