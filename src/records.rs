//! Analysis Record Store
//!
//! Persists one [`AnalysisRecord`] per (user, image address) in a Sled tree.
//!
//! ## Upsert
//! `upsert` reads the current row, merges the patch field by field and writes
//! it back with compare-and-swap, retrying when another writer got there
//! first. Two analyses racing on the same key therefore never lose a whole
//! row; per field the last successful write wins. Giving up after
//! [`MAX_CAS_ATTEMPTS`] surfaces [`StoreError::Conflict`].
//!
//! ## Keys
//! `<u32 BE length of user_id><user_id><image_address>`, so one user's rows
//! share a prefix that no other user id can produce. User ids longer than
//! [`MAX_USER_ID_BYTES`] are rejected with [`StoreError::InvalidKey`].

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::StoreError;
use crate::health::HealthLabel;
use crate::metrics;
use crate::nutrition::NutrientRecord;

pub const MAX_CAS_ATTEMPTS: usize = 16;
pub const MAX_USER_ID_BYTES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub user_id: String,
    pub image_address: String,
    /// UTC day the record was first written
    pub created_date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub item_name: Option<String>,
    pub health_label: Option<HealthLabel>,
    pub nutrient_detail: Option<NutrientRecord>,
}

impl AnalysisRecord {
    fn new(user_id: &str, image_address: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            image_address: image_address.to_string(),
            created_date: now.date_naive(),
            created_at: now,
            updated_at: now,
            item_name: None,
            health_label: None,
            nutrient_detail: None,
        }
    }

    /// Written after classification, still waiting for nutrient detail.
    pub fn is_provisional(&self) -> bool {
        self.nutrient_detail.is_none()
    }

    fn apply(&mut self, patch: &PartialAnalysisRecord, now: DateTime<Utc>) {
        if let Some(item_name) = &patch.item_name {
            self.item_name = Some(item_name.clone());
        }
        if let Some(label) = patch.health_label {
            self.health_label = Some(label);
        }
        if let Some(detail) = &patch.nutrient_detail {
            self.nutrient_detail = Some(detail.clone());
        }
        self.updated_at = now;
    }
}

/// Fields to overwrite; `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialAnalysisRecord {
    pub item_name: Option<String>,
    pub health_label: Option<HealthLabel>,
    pub nutrient_detail: Option<NutrientRecord>,
}

impl PartialAnalysisRecord {
    pub fn provisional(health_label: HealthLabel) -> Self {
        Self {
            health_label: Some(health_label),
            ..Default::default()
        }
    }

    pub fn completed(item_name: String, nutrient_detail: NutrientRecord, health_label: HealthLabel) -> Self {
        Self {
            item_name: Some(item_name),
            health_label: Some(health_label),
            nutrient_detail: Some(nutrient_detail),
        }
    }
}

#[async_trait]
pub trait AnalysisRecordStore: Send + Sync {
    /// Insert or merge the record for (user, image). Returns the stored row.
    async fn upsert(
        &self,
        user_id: &str,
        image_address: &str,
        patch: PartialAnalysisRecord,
    ) -> Result<AnalysisRecord, StoreError>;

    async fn get(&self, user_id: &str, image_address: &str) -> Result<Option<AnalysisRecord>, StoreError>;

    /// The user's records created on `date`, newest first.
    async fn history(&self, user_id: &str, date: NaiveDate) -> Result<Vec<AnalysisRecord>, StoreError>;
}

fn user_prefix(user_id: &str) -> Result<Vec<u8>, StoreError> {
    let len = u32::try_from(user_id.len())
        .ok()
        .filter(|_| user_id.len() <= MAX_USER_ID_BYTES)
        .ok_or_else(|| {
            StoreError::InvalidKey(format!(
                "user id is {} bytes, limit: {} bytes",
                user_id.len(),
                MAX_USER_ID_BYTES
            ))
        })?;

    let mut prefix = Vec::with_capacity(4 + user_id.len());
    prefix.extend_from_slice(&len.to_be_bytes());
    prefix.extend_from_slice(user_id.as_bytes());
    Ok(prefix)
}

fn record_key(user_id: &str, image_address: &str) -> Result<Vec<u8>, StoreError> {
    let mut key = user_prefix(user_id)?;
    key.extend_from_slice(image_address.as_bytes());
    Ok(key)
}

#[derive(Clone)]
pub struct SledRecordStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledRecordStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let sled_config = sled::Config::new()
            .path(path.as_ref())
            .flush_every_ms(Some(500))
            .use_compression(true);
        Self::from_config(sled_config)
    }

    /// In-memory database removed on drop
    pub fn temporary() -> Result<Self, StoreError> {
        Self::from_config(sled::Config::new().temporary(true))
    }

    fn from_config(config: sled::Config) -> Result<Self, StoreError> {
        let db = config.open()?;
        let tree = db.open_tree("analysis_records")?;
        tracing::info!(records = tree.len(), "Analysis record store opened");
        Ok(Self { db, tree })
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn upsert_blocking(
        tree: &sled::Tree,
        user_id: &str,
        image_address: &str,
        patch: &PartialAnalysisRecord,
    ) -> Result<AnalysisRecord, StoreError> {
        let key = record_key(user_id, image_address)?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = Utc::now();
            let current = tree.get(&key)?;
            let mut record = match &current {
                Some(bytes) => serde_json::from_slice::<AnalysisRecord>(bytes)?,
                None => AnalysisRecord::new(user_id, image_address, now),
            };
            record.apply(patch, now);
            let encoded = serde_json::to_vec(&record)?;

            match tree.compare_and_swap(&key, current.as_ref(), Some(encoded))? {
                Ok(()) => return Ok(record),
                Err(_) => {
                    metrics::RECORD_UPSERT_CONFLICTS.inc();
                    tracing::debug!(user_id = %user_id, image = %image_address, "Upsert raced, retrying");
                }
            }
        }

        Err(StoreError::Conflict {
            user_id: user_id.to_string(),
            image_address: image_address.to_string(),
        })
    }
}

#[async_trait]
impl AnalysisRecordStore for SledRecordStore {
    async fn upsert(
        &self,
        user_id: &str,
        image_address: &str,
        patch: PartialAnalysisRecord,
    ) -> Result<AnalysisRecord, StoreError> {
        // Offload Sled I/O to the blocking pool
        let tree = self.tree.clone();
        let user_owned = user_id.to_string();
        let image_owned = image_address.to_string();

        let record = tokio::task::spawn_blocking(move || {
            Self::upsert_blocking(&tree, &user_owned, &image_owned, &patch)
        })
        .await
        .map_err(|e| StoreError::Transport(format!("Thread join error: {}", e)))??;

        metrics::RECORD_UPSERTS.inc();
        tracing::debug!(
            user_id = %user_id,
            image = %image_address,
            provisional = record.is_provisional(),
            "Upserted analysis record"
        );
        Ok(record)
    }

    async fn get(&self, user_id: &str, image_address: &str) -> Result<Option<AnalysisRecord>, StoreError> {
        let tree = self.tree.clone();
        let key = record_key(user_id, image_address)?;

        tokio::task::spawn_blocking(move || -> Result<Option<AnalysisRecord>, StoreError> {
            match tree.get(&key)? {
                Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| StoreError::Transport(format!("Thread join error: {}", e)))?
    }

    async fn history(&self, user_id: &str, date: NaiveDate) -> Result<Vec<AnalysisRecord>, StoreError> {
        let tree = self.tree.clone();
        let prefix = user_prefix(user_id)?;

        let mut records = tokio::task::spawn_blocking(move || {
            let mut res = Vec::new();
            for item in tree.scan_prefix(&prefix) {
                let (_key, bytes) = item?;
                let record: AnalysisRecord = serde_json::from_slice(&bytes)?;
                if record.created_date == date {
                    res.push(record);
                }
            }
            Ok::<_, StoreError>(res)
        })
        .await
        .map_err(|e| StoreError::Transport(format!("Thread join error: {}", e)))??;

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}
