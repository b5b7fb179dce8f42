use crate::blob_store::{BlobError, BlobMetadata, BlobObject, BlobStore};
use crate::config::BlobConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::MetadataDirective;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// S3-backed blob store for captured and gallery images
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub async fn new(config: &BlobConfig) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }
}

fn request_error<E: std::fmt::Display>(e: E) -> BlobError {
    BlobError::Request(e.to_string())
}

fn to_utc(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(dt.secs(), dt.subsec_nanos()).single()
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self, data), fields(size_bytes = data.len()))]
    async fn put(&self, path: &str, data: Bytes, content_type: &str) -> Result<(), BlobError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(request_error)?;

        debug!(path = %path, "Blob uploaded");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, path: &str) -> Result<(), BlobError> {
        // S3 deletes are idempotent, so check first to report missing objects.
        self.metadata(path).await?;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(request_error)?;

        debug!(path = %path, "Blob deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>, BlobError> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(request_error)?;

            for obj in response.contents() {
                let Some(key) = obj.key() else { continue };
                objects.push(BlobObject {
                    path: key.to_string(),
                    size_bytes: obj.size().unwrap_or(0).max(0) as u64,
                    updated_at: obj.last_modified().and_then(to_utc).unwrap_or_else(Utc::now),
                });
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        objects.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(objects)
    }

    async fn metadata(&self, path: &str) -> Result<BlobMetadata, BlobError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
        {
            Ok(head) => Ok(BlobMetadata {
                content_type: head.content_type().map(String::from),
                updated_at: head.last_modified().and_then(to_utc),
                custom: head.metadata().cloned().unwrap_or_default(),
            }),
            Err(e) => {
                if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) {
                    Err(BlobError::NotFound(path.to_string()))
                } else {
                    Err(request_error(e))
                }
            }
        }
    }

    #[instrument(skip(self, custom))]
    async fn set_metadata(&self, path: &str, custom: HashMap<String, String>) -> Result<(), BlobError> {
        // S3 metadata is immutable; copy the object onto itself with new metadata.
        let current = self.metadata(path).await?;

        let mut request = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .key(path)
            .copy_source(format!("{}/{}", self.bucket, path))
            .metadata_directive(MetadataDirective::Replace)
            .set_metadata(Some(custom));
        if let Some(content_type) = current.content_type {
            request = request.content_type(content_type);
        }

        request.send().await.map_err(request_error)?;
        Ok(())
    }

    async fn download_url(&self, path: &str, expires_in: Duration) -> Result<String, BlobError> {
        let presigning_config = PresigningConfig::expires_in(expires_in).map_err(request_error)?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .presigned(presigning_config)
            .await
            .map_err(request_error)?;

        Ok(presigned.uri().to_string())
    }
}
