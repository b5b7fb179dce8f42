use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by blob store backends.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Blob store request failed: {0}")]
    Request(String),
}

/// Listing entry for a stored blob.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobObject {
    pub path: String,
    pub size_bytes: u64,
    pub updated_at: DateTime<Utc>,
}

/// Head metadata of a stored blob.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BlobMetadata {
    pub content_type: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    /// User-defined metadata (download tokens and the like).
    pub custom: HashMap<String, String>,
}

/// Object storage for image blobs, addressed by path.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, data: Bytes, content_type: &str) -> Result<(), BlobError>;

    async fn delete(&self, path: &str) -> Result<(), BlobError>;

    /// Objects whose path starts with `prefix`, ordered by path.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>, BlobError>;

    async fn metadata(&self, path: &str) -> Result<BlobMetadata, BlobError>;

    /// Replace the user-defined metadata of an object.
    async fn set_metadata(&self, path: &str, custom: HashMap<String, String>) -> Result<(), BlobError>;

    /// Time-limited URL for reading the object.
    async fn download_url(&self, path: &str, expires_in: Duration) -> Result<String, BlobError>;
}

/// Get content type for an image format or file extension
pub fn content_type_for(format: &str) -> &'static str {
    match format.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

/// Sanitize a client-supplied file name so it cannot escape its prefix
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

struct StoredBlob {
    data: Bytes,
    content_type: String,
    updated_at: DateTime<Utc>,
    custom: HashMap<String, String>,
}

/// Process-local blob store used for local runs and tests.
pub struct InMemoryBlobStore {
    objects: RwLock<BTreeMap<String, StoredBlob>>,
    base_url: String,
}

impl InMemoryBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            base_url: base_url.into(),
        }
    }

    /// Raw object bytes, if present.
    pub fn read(&self, path: &str) -> Option<Bytes> {
        self.objects.read().get(path).map(|b| b.data.clone())
    }
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new("memory://blobs")
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, path: &str, data: Bytes, content_type: &str) -> Result<(), BlobError> {
        self.objects.write().insert(
            path.to_string(),
            StoredBlob {
                data,
                content_type: content_type.to_string(),
                updated_at: Utc::now(),
                custom: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), BlobError> {
        self.objects
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| BlobError::NotFound(path.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>, BlobError> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, blob)| BlobObject {
                path: path.clone(),
                size_bytes: blob.data.len() as u64,
                updated_at: blob.updated_at,
            })
            .collect())
    }

    async fn metadata(&self, path: &str) -> Result<BlobMetadata, BlobError> {
        self.objects
            .read()
            .get(path)
            .map(|blob| BlobMetadata {
                content_type: Some(blob.content_type.clone()),
                updated_at: Some(blob.updated_at),
                custom: blob.custom.clone(),
            })
            .ok_or_else(|| BlobError::NotFound(path.to_string()))
    }

    async fn set_metadata(&self, path: &str, custom: HashMap<String, String>) -> Result<(), BlobError> {
        let mut objects = self.objects.write();
        let blob = objects
            .get_mut(path)
            .ok_or_else(|| BlobError::NotFound(path.to_string()))?;
        blob.custom = custom;
        Ok(())
    }

    async fn download_url(&self, path: &str, expires_in: Duration) -> Result<String, BlobError> {
        if !self.objects.read().contains_key(path) {
            return Err(BlobError::NotFound(path.to_string()));
        }
        Ok(format!(
            "{}/{}?expires_in={}",
            self.base_url.trim_end_matches('/'),
            path,
            expires_in.as_secs()
        ))
    }
}
