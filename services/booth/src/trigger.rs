//! Remote capture trigger.
//!
//! The operator drives every tablet through one shared document. Tablets
//! receive it as a last-value channel; only the lock owner writes the
//! completion reset.

use crate::document_store::{encode, DocPath, Document, DocumentStore, Fields, StoreError};
use crate::error::Result;
use crate::resource_lock::CAMERA_COLLECTION;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

pub const TRIGGER_ID: &str = "trigger";

/// Operator command for the tablets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRecord {
    #[serde(default)]
    pub show_camera: bool,
    #[serde(default)]
    pub take_photo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
}

impl TriggerRecord {
    pub fn idle() -> Self {
        Self::default()
    }

    /// Enforce that taking a photo implies the camera is shown.
    pub fn normalized(mut self) -> Self {
        if self.take_photo {
            self.show_camera = true;
        }
        self
    }
}

/// Handle on the shared trigger document.
#[derive(Clone)]
pub struct TriggerChannel {
    store: Arc<dyn DocumentStore>,
    path: DocPath,
}

impl TriggerChannel {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            path: DocPath::new(CAMERA_COLLECTION, TRIGGER_ID),
        }
    }

    pub fn path(&self) -> &DocPath {
        &self.path
    }

    /// Current trigger state; an absent document reads as idle.
    pub async fn current(&self) -> Result<TriggerRecord> {
        let doc = self.store.get(&self.path).await?;
        Ok(doc
            .map(|d| d.decode::<TriggerRecord>())
            .transpose()?
            .unwrap_or_default())
    }

    /// Operator write: replace the trigger with a normalized command.
    #[instrument(skip(self))]
    pub async fn publish(&self, record: TriggerRecord) -> Result<TriggerRecord> {
        let record = record.normalized();
        let fields = encode(&self.path, &record)?;
        self.store.set(&self.path, fields).await?;
        info!(
            show_camera = record.show_camera,
            take_photo = record.take_photo,
            theme = ?record.theme,
            "Trigger published"
        );
        Ok(record)
    }

    /// Clear `takePhoto` only.
    pub async fn reset_take_photo(&self) -> Result<()> {
        self.merge(fields_of(&[("takePhoto", false)])).await?;
        Ok(())
    }

    /// Completion reset written by the owning device after a capture.
    ///
    /// Returns the version the reset committed at; any trigger push with a
    /// higher version was written after it.
    pub async fn complete(&self) -> Result<u64> {
        let doc = self
            .merge(fields_of(&[("showCamera", false), ("takePhoto", false)]))
            .await?;
        Ok(doc.version)
    }

    async fn merge(&self, fields: Fields) -> Result<Document> {
        match self.store.update(&self.path, fields.clone()).await {
            Ok(doc) => Ok(doc),
            // Nothing to clear yet; create the document in its idle form.
            Err(StoreError::NotFound(_)) => {
                let mut idle = encode(&self.path, &TriggerRecord::idle())?;
                idle.extend(fields);
                Ok(self.store.set(&self.path, idle).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn subscribe(&self) -> Result<TriggerSubscription> {
        let rx = self.store.watch(&self.path).await?;
        Ok(TriggerSubscription { rx })
    }
}

fn fields_of(pairs: &[(&str, bool)]) -> Fields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::Bool(*v)))
        .collect()
}

/// One observed state of the trigger document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TriggerUpdate {
    pub record: TriggerRecord,
    /// Document version, `None` while no document exists.
    pub version: Option<u64>,
}

/// Live view of the trigger document.
pub struct TriggerSubscription {
    rx: watch::Receiver<Option<Document>>,
}

impl TriggerSubscription {
    /// Latest trigger, marking it seen. Absent or malformed reads as idle.
    pub fn current(&mut self) -> TriggerUpdate {
        let doc = self.rx.borrow_and_update().clone();
        let Some(doc) = doc else {
            return TriggerUpdate::default();
        };
        let record = doc.decode::<TriggerRecord>().unwrap_or_else(|e| {
            warn!(error = %e, "Ignoring malformed trigger record");
            TriggerRecord::idle()
        });
        TriggerUpdate {
            record,
            version: Some(doc.version),
        }
    }

    /// Wait for the next change. Returns `None` once the store is gone.
    pub async fn changed(&mut self) -> Option<TriggerUpdate> {
        self.rx.changed().await.ok()?;
        Some(self.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document_store::InMemoryDocumentStore;

    #[test]
    fn test_take_photo_implies_show_camera() {
        let record = TriggerRecord {
            show_camera: false,
            take_photo: true,
            theme: None,
        }
        .normalized();
        assert!(record.show_camera);
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let record = TriggerRecord {
            show_camera: true,
            take_photo: false,
            theme: Some("summer".to_string()),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json, serde_json::json!({"showCamera": true, "takePhoto": false, "theme": "summer"}));
    }

    #[tokio::test]
    async fn test_complete_keeps_theme() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let trigger = TriggerChannel::new(store);

        trigger
            .publish(TriggerRecord {
                show_camera: true,
                take_photo: true,
                theme: Some("smile".to_string()),
            })
            .await
            .unwrap();
        trigger.complete().await.unwrap();

        let current = trigger.current().await.unwrap();
        assert!(!current.show_camera);
        assert!(!current.take_photo);
        assert_eq!(current.theme.as_deref(), Some("smile"));
    }

    #[tokio::test]
    async fn test_reset_creates_missing_document() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let trigger = TriggerChannel::new(store);

        trigger.reset_take_photo().await.unwrap();
        assert_eq!(trigger.current().await.unwrap(), TriggerRecord::idle());
    }

    #[tokio::test]
    async fn test_reset_leaves_show_camera() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let trigger = TriggerChannel::new(store);

        trigger
            .publish(TriggerRecord {
                show_camera: true,
                take_photo: true,
                theme: None,
            })
            .await
            .unwrap();
        trigger.reset_take_photo().await.unwrap();

        let current = trigger.current().await.unwrap();
        assert!(current.show_camera);
        assert!(!current.take_photo);
    }

    #[tokio::test]
    async fn test_subscription_sees_publish() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let trigger = TriggerChannel::new(store);
        let mut sub = trigger.subscribe().await.unwrap();
        assert_eq!(sub.current(), TriggerUpdate::default());

        trigger
            .publish(TriggerRecord {
                show_camera: true,
                take_photo: false,
                theme: None,
            })
            .await
            .unwrap();

        let seen = sub.changed().await.unwrap();
        assert!(seen.record.show_camera);
        assert!(seen.version.is_some());
    }

    #[tokio::test]
    async fn test_complete_reports_committed_version() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let trigger = TriggerChannel::new(store);
        let mut sub = trigger.subscribe().await.unwrap();

        // Created from nothing on the first reset.
        let first = trigger.complete().await.unwrap();
        assert_eq!(sub.changed().await.unwrap().version, Some(first));

        trigger
            .publish(TriggerRecord {
                show_camera: true,
                take_photo: true,
                theme: None,
            })
            .await
            .unwrap();
        let reset = trigger.complete().await.unwrap();
        assert!(reset > first);

        let seen = sub.changed().await.unwrap();
        assert_eq!(seen.version, Some(reset));
        assert!(!seen.record.take_photo);
    }
}
