use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::StoreError;
use crate::metrics;

/// Metadata for an image written to the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredImage {
    pub address: String, // stable public URL
    pub user_id: String,
    pub filename: String,
    pub size: u64,
    pub checksum: String, // MD5 checksum for integrity
    pub created_at: i64,
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Persist `bytes` under the user's namespace and return a stable address.
    async fn store(&self, user_id: &str, filename: &str, bytes: &[u8]) -> Result<StoredImage, StoreError>;
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_` and neutralize `..`.
pub fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.replace("..", "__");

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Image store writing to a local directory that is served at `public_base_url`.
///
/// Layout: `<root>/<user_id>/<uuid>-<filename>`. Every call writes a new file,
/// so an address never changes content.
#[derive(Debug, Clone)]
pub struct FsImageStore {
    root: PathBuf,
    public_base_url: String,
}

impl FsImageStore {
    pub async fn new(root: impl AsRef<Path>, public_base_url: &str) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        tracing::info!("Image store initialized at {:?}", root);

        Ok(Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ImageStore for FsImageStore {
    async fn store(&self, user_id: &str, filename: &str, bytes: &[u8]) -> Result<StoredImage, StoreError> {
        let user_dir = sanitize_segment(user_id);
        let object_name = format!("{}-{}", uuid::Uuid::new_v4(), sanitize_segment(filename));

        let dir = self.root.join(&user_dir);
        fs::create_dir_all(&dir).await?;

        // Write then rename so a reader never sees a partial file
        let final_path = dir.join(&object_name);
        let tmp_path = dir.join(format!(".{}.tmp", object_name));
        fs::write(&tmp_path, bytes).await?;
        fs::rename(&tmp_path, &final_path).await?;

        let checksum = format!("{:x}", md5::compute(bytes));
        let address = format!("{}/{}/{}", self.public_base_url, user_dir, object_name);
        metrics::IMAGES_STORED.inc();
        tracing::debug!(user_id = %user_id, address = %address, checksum = %checksum, "Stored image");

        Ok(StoredImage {
            address,
            user_id: user_id.to_string(),
            filename: object_name,
            size: bytes.len() as u64,
            checksum,
            created_at: chrono::Utc::now().timestamp_millis(),
        })
    }
}
