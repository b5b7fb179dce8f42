//! Captured image gallery.
//!
//! Raw captures land under the raw prefix; the `images` collection mirrors
//! the processed blobs under the source prefix and is what gallery views
//! read. [`Gallery::synchronize`] reconciles the two.

use crate::blob_store::{sanitize_file_name, BlobStore};
use crate::capture::EncodedImage;
use crate::config::{BlobConfig, GalleryConfig};
use crate::document_store::{encode, BatchOp, DocPath, DocumentStore};
use crate::error::{BoothError, Result};
use crate::state_machine::CaptureSink;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

pub const IMAGES_COLLECTION: &str = "images";
pub const METADATA_COLLECTION: &str = "metadata";
pub const LAST_SYNC_ID: &str = "lastSync";

/// Blob metadata key holding the long-lived download token.
pub const DOWNLOAD_TOKEN_KEY: &str = "download-token";

/// Gallery entry for one processed image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedImageRecord {
    pub path: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSync {
    pub synced_at: DateTime<Utc>,
    pub added: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub added: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteResult {
    pub path: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    pub results: Vec<DeleteResult>,
    pub success_count: usize,
    pub failed_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GalleryImage {
    pub id: String,
    pub path: String,
    pub url: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GalleryPage {
    pub images: Vec<GalleryImage>,
    pub has_more: bool,
}

/// Document id for a blob path.
pub fn record_id(path: &str) -> String {
    path.replace('/', "_")
}

/// Object name for an uploaded raw image, e.g.
/// `2024-06-01_14-03-22-517-capture.png`.
pub fn upload_name(now: DateTime<Local>, file_name: &str) -> String {
    format!(
        "{}-{}",
        now.format("%Y-%m-%d_%H-%M-%S-%3f"),
        sanitize_file_name(file_name)
    )
}

pub struct Gallery {
    docs: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    raw_prefix: String,
    source_prefix: String,
    url_expiry: Duration,
    default_limit: usize,
    max_delete_batch: usize,
}

impl Gallery {
    pub fn new(
        docs: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        blob_config: &BlobConfig,
        gallery_config: &GalleryConfig,
    ) -> Self {
        Self {
            docs,
            blobs,
            raw_prefix: blob_config.raw_prefix.clone(),
            source_prefix: gallery_config.source_prefix.clone(),
            url_expiry: Duration::from_secs(blob_config.download_url_expiry_secs),
            default_limit: gallery_config.default_limit,
            max_delete_batch: gallery_config.max_delete_batch,
        }
    }

    /// Store a raw image and return its blob path.
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    pub async fn upload_raw(&self, file_name: &str, data: Bytes, content_type: &str) -> Result<String> {
        if data.is_empty() {
            return Err(BoothError::Validation("uploaded file is empty".to_string()));
        }

        let path = format!("{}{}", self.raw_prefix, upload_name(Local::now(), file_name));
        self.blobs.put(&path, data, content_type).await?;

        info!(path = %path, "Raw image uploaded");
        metrics::counter!("booth.uploads").increment(1);
        Ok(path)
    }

    /// Reconcile the `images` collection with the processed blobs.
    ///
    /// Missing records are created with a download token and URL, records
    /// whose blob is gone are removed, all in one batch.
    #[instrument(skip(self))]
    pub async fn synchronize(&self) -> Result<SyncReport> {
        let blobs: Vec<_> = self
            .blobs
            .list(&self.source_prefix)
            .await?
            .into_iter()
            .filter(|b| !b.path.ends_with('/'))
            .collect();
        let existing: HashSet<String> = self
            .docs
            .list(IMAGES_COLLECTION)
            .await?
            .into_iter()
            .map(|d| d.path.id().to_string())
            .collect();

        let mut live = HashSet::with_capacity(blobs.len());
        let mut ops = Vec::new();
        let mut added = 0;

        for blob in &blobs {
            let id = record_id(&blob.path);
            live.insert(id.clone());
            if existing.contains(&id) {
                continue;
            }

            let token = self.ensure_download_token(&blob.path).await?;
            let url = self.blobs.download_url(&blob.path, self.url_expiry).await?;
            let path = DocPath::new(IMAGES_COLLECTION, id);
            let record = CapturedImageRecord {
                path: blob.path.clone(),
                updated_at: blob.updated_at,
                url: Some(url),
                token: Some(token),
            };
            ops.push(BatchOp::Set {
                fields: encode(&path, &record)?,
                path,
            });
            added += 1;
        }

        let orphans: Vec<_> = existing.difference(&live).cloned().collect();
        let deleted = orphans.len();
        ops.extend(orphans.into_iter().map(|id| BatchOp::Delete {
            path: DocPath::new(IMAGES_COLLECTION, id),
        }));

        if !ops.is_empty() {
            self.docs.commit_batch(ops).await?;
        }

        let last_sync_path = DocPath::new(METADATA_COLLECTION, LAST_SYNC_ID);
        let last_sync = LastSync {
            synced_at: Utc::now(),
            added,
            deleted,
        };
        self.docs
            .set(&last_sync_path, encode(&last_sync_path, &last_sync)?)
            .await?;

        info!(added = added, deleted = deleted, blobs = blobs.len(), "Gallery synchronized");
        metrics::counter!("booth.sync.added").increment(added as u64);
        metrics::counter!("booth.sync.deleted").increment(deleted as u64);

        Ok(SyncReport { added, deleted })
    }

    async fn ensure_download_token(&self, path: &str) -> Result<String> {
        let meta = self.blobs.metadata(path).await?;
        if let Some(token) = meta.custom.get(DOWNLOAD_TOKEN_KEY) {
            return Ok(token.clone());
        }

        let token = uuid::Uuid::new_v4().to_string();
        let mut custom: HashMap<String, String> = meta.custom;
        custom.insert(DOWNLOAD_TOKEN_KEY.to_string(), token.clone());
        self.blobs.set_metadata(path, custom).await?;
        Ok(token)
    }

    /// Delete blobs and their gallery records. Each path is handled on its
    /// own; one failure does not stop the rest.
    #[instrument(skip(self, paths), fields(count = paths.len()))]
    pub async fn delete_batch(&self, paths: Vec<String>) -> Result<DeleteReport> {
        if paths.is_empty() {
            return Err(BoothError::Validation("paths must be a non-empty array".to_string()));
        }
        if paths.len() > self.max_delete_batch {
            return Err(BoothError::Validation(format!(
                "at most {} paths per request",
                self.max_delete_batch
            )));
        }

        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            match self.delete_one(&path).await {
                Ok(()) => results.push(DeleteResult {
                    path,
                    success: true,
                    error: None,
                }),
                Err(e) => {
                    warn!(path = %path, error = %e, "Failed to delete image");
                    results.push(DeleteResult {
                        path,
                        success: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let success_count = results.iter().filter(|r| r.success).count();
        let failed_count = results.len() - success_count;
        info!(success_count, failed_count, "Batch delete finished");
        metrics::counter!("booth.deletes").increment(success_count as u64);

        Ok(DeleteReport {
            results,
            success_count,
            failed_count,
        })
    }

    async fn delete_one(&self, path: &str) -> Result<()> {
        self.blobs.delete(path).await?;
        self.docs
            .delete(&DocPath::new(IMAGES_COLLECTION, record_id(path)))
            .await?;
        Ok(())
    }

    /// Newest first. Records without a URL are not shown.
    pub async fn list(&self, limit: Option<usize>, offset: usize) -> Result<GalleryPage> {
        let limit = limit.filter(|l| *l > 0).unwrap_or(self.default_limit);

        let mut images = Vec::new();
        for doc in self.docs.list(IMAGES_COLLECTION).await? {
            let record: CapturedImageRecord = match doc.decode() {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "Skipping malformed image record");
                    continue;
                }
            };
            if let Some(url) = record.url {
                images.push(GalleryImage {
                    id: doc.path.id().to_string(),
                    path: record.path,
                    url,
                    updated_at: record.updated_at,
                });
            }
        }
        images.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let has_more = images.len() > offset.saturating_add(limit);
        let images = images.into_iter().skip(offset).take(limit).collect();
        Ok(GalleryPage { images, has_more })
    }

    pub async fn last_sync(&self) -> Result<Option<LastSync>> {
        let doc = self
            .docs
            .get(&DocPath::new(METADATA_COLLECTION, LAST_SYNC_ID))
            .await?;
        Ok(doc.map(|d| d.decode()).transpose()?)
    }
}

#[async_trait]
impl CaptureSink for Gallery {
    async fn deliver(&self, image: EncodedImage) -> Result<String> {
        let file_name = format!("capture.{}", image.extension);
        self.upload_raw(&file_name, image.data, image.content_type).await
    }
}
