//! Operator-curated capture themes.

use crate::document_store::{encode, DocPath, DocumentStore};
use crate::error::{BoothError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

pub const THEME_COLLECTION: &str = "theme";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeRecord {
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A stored theme with its id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Theme {
    pub id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

pub struct ThemeService {
    docs: Arc<dyn DocumentStore>,
    max_length: usize,
}

impl ThemeService {
    pub fn new(docs: Arc<dyn DocumentStore>, max_length: usize) -> Self {
        Self { docs, max_length }
    }

    /// Trim and check a theme text.
    pub fn validate(&self, content: &str) -> Result<String> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(BoothError::Validation("theme must not be empty".to_string()));
        }
        let length = trimmed.chars().count();
        if length > self.max_length {
            return Err(BoothError::Validation(format!(
                "theme is {length} characters, at most {} allowed",
                self.max_length
            )));
        }
        Ok(trimmed.to_string())
    }

    pub async fn add(&self, content: &str) -> Result<Theme> {
        let content = self.validate(content)?;
        let id = uuid::Uuid::new_v4().to_string();
        let path = DocPath::new(THEME_COLLECTION, id.clone());
        let record = ThemeRecord {
            content,
            created_at: Utc::now(),
        };
        self.docs.set(&path, encode(&path, &record)?).await?;

        info!(theme_id = %id, "Theme added");
        Ok(Theme {
            id,
            content: record.content,
            created_at: record.created_at,
        })
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let path = DocPath::new(THEME_COLLECTION, id);
        if self.docs.get(&path).await?.is_none() {
            return Err(BoothError::NotFound(path.to_string()));
        }
        self.docs.delete(&path).await?;
        info!(theme_id = %id, "Theme deleted");
        Ok(())
    }

    /// Newest first.
    pub async fn list(&self) -> Result<Vec<Theme>> {
        let mut themes: Vec<Theme> = self
            .docs
            .list(THEME_COLLECTION)
            .await?
            .into_iter()
            .filter_map(|doc| match doc.decode::<ThemeRecord>() {
                Ok(record) => Some(Theme {
                    id: doc.path.id().to_string(),
                    content: record.content,
                    created_at: record.created_at,
                }),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed theme");
                    None
                }
            })
            .collect();
        themes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(themes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::InMemoryDocumentStore;

    fn service() -> ThemeService {
        ThemeService::new(Arc::new(InMemoryDocumentStore::new()), 25)
    }

    #[test]
    fn test_validation() {
        let themes = service();
        assert_eq!(themes.validate("  Pirates  ").unwrap(), "Pirates");
        assert!(matches!(themes.validate("   "), Err(BoothError::Validation(_))));
        assert!(themes.validate(&"a".repeat(25)).is_ok());
        assert!(matches!(themes.validate(&"a".repeat(26)), Err(BoothError::Validation(_))));
        // Counted in characters, not bytes.
        assert!(themes.validate(&"é".repeat(25)).is_ok());
    }

    #[tokio::test]
    async fn test_add_list_delete() {
        let themes = service();
        let first = themes.add("Pirates").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = themes.add(" Space ").await.unwrap();

        let listed: Vec<String> = themes.list().await.unwrap().into_iter().map(|t| t.content).collect();
        assert_eq!(listed, vec!["Space", "Pirates"]);

        themes.delete(&first.id).await.unwrap();
        let listed = themes.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, second.id);

        assert!(matches!(themes.delete(&first.id).await, Err(BoothError::NotFound(_))));
    }
}
