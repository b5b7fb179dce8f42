use crate::blob_store::BlobError;
use crate::document_store::StoreError;
use thiserror::Error;

/// Errors surfaced by booth operations.
///
/// Lock and transaction errors are normally absorbed by the capture state
/// machine and turned into states; the rest reach the HTTP surface.
#[derive(Debug, Error)]
pub enum BoothError {
    #[error("Resource {resource} is held by {owner}")]
    Contention { resource: String, owner: String },

    #[error("Transaction on {path} conflicted after {attempts} attempts")]
    TransactionConflict { path: String, attempts: u32 },

    #[error("Camera device error: {0}")]
    Device(String),

    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl BoothError {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            BoothError::Contention { .. } => "LOCK_CONTENTION",
            BoothError::TransactionConflict { .. } => "TRANSACTION_CONFLICT",
            BoothError::Device(_) => "DEVICE_ERROR",
            BoothError::Infrastructure(_) => "INFRASTRUCTURE_ERROR",
            BoothError::Validation(_) => "VALIDATION_ERROR",
            BoothError::NotFound(_) => "NOT_FOUND",
        }
    }
}

impl From<StoreError> for BoothError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(path) => BoothError::NotFound(path),
            other => BoothError::Infrastructure(other.to_string()),
        }
    }
}

impl From<BlobError> for BoothError {
    fn from(e: BlobError) -> Self {
        match e {
            BlobError::NotFound(path) => BoothError::NotFound(path),
            other => BoothError::Infrastructure(other.to_string()),
        }
    }
}

pub type Result<T, E = BoothError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_become_infrastructure() {
        let err: BoothError = StoreError::Unavailable("connection refused".to_string()).into();
        assert!(matches!(err, BoothError::Infrastructure(_)));
        assert_eq!(err.code(), "INFRASTRUCTURE_ERROR");
    }

    #[test]
    fn test_missing_blob_is_not_found() {
        let err: BoothError = BlobError::NotFound("user_images/a.png".to_string()).into();
        assert!(matches!(err, BoothError::NotFound(ref p) if p == "user_images/a.png"));
    }
}
