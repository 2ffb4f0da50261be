use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::classifier::{AdmissionRule, PayloadEncoding};

/// Smallest result page requested from the nutrition database. Short queries
/// often rank a poor match first, so a single hit is never enough.
pub const MIN_SEARCH_PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub classifier: ClassifierConfig,
    pub nutrition: NutritionConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub endpoint: String,
    pub api_token: String, // empty = no Authorization header
    pub payload: PayloadEncoding,
    pub timeout_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api-inference.huggingface.co/models/nateraw/food".to_string(),
            api_token: String::new(),
            payload: PayloadEncoding::Raw,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NutritionConfig {
    pub base_url: String,
    pub api_key: String,
    pub data_types: Vec<String>,
    pub page_size: u32,
    pub cache_ttl_secs: u64,
    pub timeout_secs: u64,
}

impl Default for NutritionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.nal.usda.gov/fdc/v1".to_string(),
            api_key: "DEMO_KEY".to_string(),
            data_types: vec![
                "Survey (FNDDS)".to_string(),
                "Foundation".to_string(),
                "SR Legacy".to_string(),
            ],
            page_size: 25,
            cache_ttl_secs: 86400, // 24 hours
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub public_base_url: String, // addresses handed out by the image store
}

impl StorageConfig {
    pub fn records_path(&self) -> PathBuf {
        self.data_dir.join("records")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            public_base_url: "http://localhost:8080/images".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub admission_rule: AdmissionRule,
    pub external_call_timeout_secs: u64,
    pub max_image_bytes: usize,
    pub max_concurrent_analyses: usize,
}

impl PipelineConfig {
    pub fn external_call_timeout(&self) -> Duration {
        Duration::from_secs(self.external_call_timeout_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            admission_rule: AdmissionRule::TopK(3),
            external_call_timeout_secs: 30,
            max_image_bytes: 10 * 1024 * 1024, // 10MB
            max_concurrent_analyses: 64,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        let api_host = env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let api_port = env_or("API_PORT", 8080);

        // Classifier
        let classifier_defaults = ClassifierConfig::default();
        let payload = match env::var("CLASSIFIER_PAYLOAD") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid CLASSIFIER_PAYLOAD: {}", e))?,
            Err(_) => classifier_defaults.payload,
        };
        let external_call_timeout_secs = env_or("EXTERNAL_CALL_TIMEOUT_SECS", 30);
        let classifier = ClassifierConfig {
            endpoint: env::var("CLASSIFIER_ENDPOINT").unwrap_or(classifier_defaults.endpoint),
            api_token: env::var("CLASSIFIER_API_TOKEN").unwrap_or_default(),
            payload,
            timeout_secs: external_call_timeout_secs,
        };

        // Nutrition database
        let nutrition_defaults = NutritionConfig::default();
        let data_types = env::var("USDA_DATA_TYPES")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
            })
            .ok()
            .filter(|types| !types.is_empty())
            .unwrap_or(nutrition_defaults.data_types);
        let nutrition = NutritionConfig {
            base_url: env::var("USDA_BASE_URL").unwrap_or(nutrition_defaults.base_url),
            api_key: env::var("USDA_API_KEY").unwrap_or(nutrition_defaults.api_key),
            data_types,
            page_size: env_or("USDA_PAGE_SIZE", nutrition_defaults.page_size).max(MIN_SEARCH_PAGE_SIZE),
            cache_ttl_secs: env_or("USDA_CACHE_TTL_SECS", nutrition_defaults.cache_ttl_secs),
            timeout_secs: external_call_timeout_secs,
        };

        // Storage
        let storage_defaults = StorageConfig::default();
        let storage = StorageConfig {
            data_dir: env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(storage_defaults.data_dir),
            public_base_url: env::var("PUBLIC_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(storage_defaults.public_base_url),
        };

        // Pipeline
        let pipeline_defaults = PipelineConfig::default();
        let admission_rule = match env::var("ADMISSION_RULE") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid ADMISSION_RULE: {}", e))?,
            Err(_) => pipeline_defaults.admission_rule,
        };
        let pipeline = PipelineConfig {
            admission_rule,
            external_call_timeout_secs,
            max_image_bytes: env_or("MAX_IMAGE_BYTES", pipeline_defaults.max_image_bytes),
            max_concurrent_analyses: env_or(
                "MAX_CONCURRENT_ANALYSES",
                pipeline_defaults.max_concurrent_analyses,
            )
            .max(1),
        };

        Ok(Self {
            api_host,
            api_port,
            classifier,
            nutrition,
            storage,
            pipeline,
        })
    }
}
