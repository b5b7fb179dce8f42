//! Document store abstraction.
//!
//! Documents are schemaless JSON objects addressed by `collection/id`. The
//! only atomic primitive is [`DocumentStore::compare_and_swap`] against the
//! per-document version; read-decide-write sequences go through
//! [`run_transaction`], never through a bare `get` followed by `set`.
//!
//! Subscriptions are `tokio::sync::watch` channels: a single-slot mailbox
//! holding the latest state of one document. A subscriber may skip
//! intermediate states but never observes an older state after a newer one.

use crate::error::BoothError;
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

/// Field map of a stored document.
pub type Fields = Map<String, Value>;

/// Errors raised by document store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Document store unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed document {path}: {message}")]
    Malformed { path: String, message: String },
}

/// Address of a document: `collection/id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath {
    collection: String,
    id: String,
}

impl DocPath {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Parse `collection/id`. The id may not contain further slashes.
    pub fn parse(s: &str) -> Option<Self> {
        let (collection, id) = s.split_once('/')?;
        if collection.is_empty() || id.is_empty() || id.contains('/') {
            return None;
        }
        Some(Self::new(collection, id))
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A stored document with its optimistic-concurrency version.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub path: DocPath,
    pub fields: Fields,
    /// Incremented on every write; starts at 1 on creation.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Decode the document body into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|e| {
            StoreError::Malformed {
                path: self.path.to_string(),
                message: e.to_string(),
            }
        })
    }
}

/// Encode a typed record into a document body.
pub fn encode<T: Serialize>(path: &DocPath, value: &T) -> Result<Fields, StoreError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(StoreError::Malformed {
            path: path.to_string(),
            message: format!("expected an object, got {other}"),
        }),
        Err(e) => Err(StoreError::Malformed {
            path: path.to_string(),
            message: e.to_string(),
        }),
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone)]
pub enum CasOutcome {
    Committed(Document),
    /// The document changed since the caller read it.
    Conflict,
}

/// One write in a batch commit.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Set { path: DocPath, fields: Fields },
    Delete { path: DocPath },
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError>;

    /// Create or overwrite a document.
    async fn set(&self, path: &DocPath, fields: Fields) -> Result<Document, StoreError>;

    /// Merge fields into an existing document. Fails with `NotFound` if absent.
    async fn update(&self, path: &DocPath, fields: Fields) -> Result<Document, StoreError>;

    async fn delete(&self, path: &DocPath) -> Result<(), StoreError>;

    /// All documents of a collection, ordered by id.
    async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError>;

    /// Write `fields` only if the stored version still equals
    /// `expected_version` (`None` meaning the document must not exist).
    async fn compare_and_swap(
        &self,
        path: &DocPath,
        expected_version: Option<u64>,
        fields: Fields,
    ) -> Result<CasOutcome, StoreError>;

    /// Apply several writes atomically.
    async fn commit_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// Subscribe to a document. The receiver starts at the current state.
    async fn watch(&self, path: &DocPath) -> Result<watch::Receiver<Option<Document>>, StoreError>;
}

/// Bounded retry settings for transactions.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

/// Run a read-decide-write transaction on one document.
///
/// `decide` sees the current document and returns the fields to write (or
/// `None` to commit nothing) plus the value to hand back. A version conflict
/// re-reads and re-decides with exponential backoff, up to
/// `policy.max_attempts` times.
#[instrument(skip(store, policy, decide), fields(path = %path))]
pub async fn run_transaction<T, F>(
    store: &dyn DocumentStore,
    path: &DocPath,
    policy: &RetryPolicy,
    mut decide: F,
) -> Result<T, BoothError>
where
    T: Send,
    F: FnMut(Option<&Document>) -> Result<(Option<Fields>, T), BoothError> + Send,
{
    let mut backoff = ExponentialBackoff {
        initial_interval: policy.initial_backoff,
        max_interval: policy.max_backoff,
        max_elapsed_time: None,
        ..Default::default()
    };
    let mut attempts = 0u32;

    loop {
        attempts += 1;

        let current = store.get(path).await?;
        let (write, value) = decide(current.as_ref())?;
        let Some(fields) = write else {
            return Ok(value);
        };

        let expected = current.as_ref().map(|d| d.version);
        match store.compare_and_swap(path, expected, fields).await? {
            CasOutcome::Committed(doc) => {
                debug!(version = doc.version, attempts = attempts, "Transaction committed");
                return Ok(value);
            }
            CasOutcome::Conflict => {
                if attempts >= policy.max_attempts.max(1) {
                    warn!(attempts = attempts, "Transaction retries exhausted");
                    return Err(BoothError::TransactionConflict {
                        path: path.to_string(),
                        attempts,
                    });
                }

                let delay = backoff.next_backoff().unwrap_or(policy.max_backoff);
                debug!(
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Transaction conflicted, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

struct Slot {
    doc: Option<Document>,
    version: u64,
    tx: watch::Sender<Option<Document>>,
}

impl Slot {
    fn empty() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            doc: None,
            version: 0,
            tx,
        }
    }

    fn write(&mut self, path: &DocPath, fields: Fields) -> Document {
        self.version += 1;
        let doc = Document {
            path: path.clone(),
            fields,
            version: self.version,
            updated_at: Utc::now(),
        };
        self.doc = Some(doc.clone());
        self.tx.send_replace(Some(doc.clone()));
        doc
    }

    fn clear(&mut self) {
        if self.doc.take().is_some() {
            self.tx.send_replace(None);
        }
    }
}

/// Process-local document store used for local runs and tests.
///
/// Versions keep counting across delete and re-create so a stale CAS never
/// matches a re-created document.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    slots: Mutex<HashMap<DocPath, Slot>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
        Ok(self.slots.lock().get(path).and_then(|s| s.doc.clone()))
    }

    async fn set(&self, path: &DocPath, fields: Fields) -> Result<Document, StoreError> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(path.clone()).or_insert_with(Slot::empty);
        Ok(slot.write(path, fields))
    }

    async fn update(&self, path: &DocPath, fields: Fields) -> Result<Document, StoreError> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(path)
            .filter(|s| s.doc.is_some())
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;

        let mut merged = slot.doc.as_ref().map(|d| d.fields.clone()).unwrap_or_default();
        merged.extend(fields);
        Ok(slot.write(path, merged))
    }

    async fn delete(&self, path: &DocPath) -> Result<(), StoreError> {
        if let Some(slot) = self.slots.lock().get_mut(path) {
            slot.clear();
        }
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let slots = self.slots.lock();
        let mut docs: Vec<Document> = slots
            .values()
            .filter_map(|s| s.doc.clone())
            .filter(|d| d.path.collection() == collection)
            .collect();
        docs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(docs)
    }

    async fn compare_and_swap(
        &self,
        path: &DocPath,
        expected_version: Option<u64>,
        fields: Fields,
    ) -> Result<CasOutcome, StoreError> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(path.clone()).or_insert_with(Slot::empty);

        let current = slot.doc.as_ref().map(|d| d.version);
        if current != expected_version {
            return Ok(CasOutcome::Conflict);
        }

        Ok(CasOutcome::Committed(slot.write(path, fields)))
    }

    async fn commit_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut slots = self.slots.lock();
        for op in ops {
            match op {
                BatchOp::Set { path, fields } => {
                    let slot = slots.entry(path.clone()).or_insert_with(Slot::empty);
                    slot.write(&path, fields);
                }
                BatchOp::Delete { path } => {
                    if let Some(slot) = slots.get_mut(&path) {
                        slot.clear();
                    }
                }
            }
        }
        Ok(())
    }

    async fn watch(&self, path: &DocPath) -> Result<watch::Receiver<Option<Document>>, StoreError> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(path.clone()).or_insert_with(Slot::empty);
        Ok(slot.tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_doc_path_parse() {
        let path = DocPath::parse("camera/trigger").unwrap();
        assert_eq!(path.collection(), "camera");
        assert_eq!(path.id(), "trigger");
        assert_eq!(path.to_string(), "camera/trigger");

        assert!(DocPath::parse("camera").is_none());
        assert!(DocPath::parse("camera/a/b").is_none());
        assert!(DocPath::parse("/x").is_none());
    }

    #[tokio::test]
    async fn test_cas_rejects_stale_version() {
        let store = InMemoryDocumentStore::new();
        let path = DocPath::new("camera", "resource");

        let first = store
            .compare_and_swap(&path, None, fields(json!({"n": 1})))
            .await
            .unwrap();
        assert!(matches!(first, CasOutcome::Committed(ref d) if d.version == 1));

        // Creating again must fail: the document now exists.
        let again = store
            .compare_and_swap(&path, None, fields(json!({"n": 2})))
            .await
            .unwrap();
        assert!(matches!(again, CasOutcome::Conflict));

        let next = store
            .compare_and_swap(&path, Some(1), fields(json!({"n": 3})))
            .await
            .unwrap();
        assert!(matches!(next, CasOutcome::Committed(ref d) if d.version == 2));

        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.fields["n"], json!(3));
    }

    #[tokio::test]
    async fn test_update_merges_and_requires_existing() {
        let store = InMemoryDocumentStore::new();
        let path = DocPath::new("camera", "trigger");

        let missing = store.update(&path, fields(json!({"takePhoto": false}))).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));

        store
            .set(&path, fields(json!({"showCamera": true, "takePhoto": true, "theme": "cats"})))
            .await
            .unwrap();
        let doc = store
            .update(&path, fields(json!({"takePhoto": false})))
            .await
            .unwrap();

        assert_eq!(doc.fields["showCamera"], json!(true));
        assert_eq!(doc.fields["takePhoto"], json!(false));
        assert_eq!(doc.fields["theme"], json!("cats"));
    }

    #[tokio::test]
    async fn test_watch_delivers_latest_state() {
        let store = InMemoryDocumentStore::new();
        let path = DocPath::new("camera", "trigger");
        let mut rx = store.watch(&path).await.unwrap();
        assert!(rx.borrow_and_update().is_none());

        store.set(&path, fields(json!({"v": 1}))).await.unwrap();
        store.set(&path, fields(json!({"v": 2}))).await.unwrap();

        rx.changed().await.unwrap();
        let latest = rx.borrow_and_update().clone().unwrap();
        assert_eq!(latest.fields["v"], json!(2));

        store.delete(&path).await.unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
    }

    #[tokio::test]
    async fn test_versions_survive_delete() {
        let store = InMemoryDocumentStore::new();
        let path = DocPath::new("images", "a");

        store.set(&path, fields(json!({"x": 1}))).await.unwrap();
        store.delete(&path).await.unwrap();
        let doc = store.set(&path, fields(json!({"x": 2}))).await.unwrap();
        assert_eq!(doc.version, 2);
    }

    #[tokio::test]
    async fn test_batch_and_list() {
        let store = InMemoryDocumentStore::new();
        store
            .set(&DocPath::new("images", "old"), fields(json!({})))
            .await
            .unwrap();

        store
            .commit_batch(vec![
                BatchOp::Set {
                    path: DocPath::new("images", "b"),
                    fields: fields(json!({"path": "b"})),
                },
                BatchOp::Set {
                    path: DocPath::new("images", "a"),
                    fields: fields(json!({"path": "a"})),
                },
                BatchOp::Delete {
                    path: DocPath::new("images", "old"),
                },
                BatchOp::Set {
                    path: DocPath::new("theme", "t1"),
                    fields: fields(json!({})),
                },
            ])
            .await
            .unwrap();

        let ids: Vec<String> = store
            .list("images")
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.path.id().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_transaction_retries_then_gives_up() {
        let store = InMemoryDocumentStore::new();
        let path = DocPath::new("camera", "resource");
        store.set(&path, fields(json!({"n": 0}))).await.unwrap();

        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };

        // Every decision races with a concurrent writer, so every CAS fails.
        let mut calls = 0u32;
        let result: Result<(), BoothError> = run_transaction(&store, &path, &policy, |_doc| {
            calls += 1;
            let store = &store;
            let path = path.clone();
            futures::executor::block_on(store.set(&path, fields(json!({"n": calls}))))
                .map_err(BoothError::from)?;
            Ok((Some(fields(json!({"n": -1}))), ()))
        })
        .await;

        assert!(matches!(
            result,
            Err(BoothError::TransactionConflict { attempts: 3, .. })
        ));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_transaction_without_write_commits_nothing() {
        let store = InMemoryDocumentStore::new();
        let path = DocPath::new("camera", "resource");

        let seen = run_transaction(&store, &path, &RetryPolicy::default(), |doc| {
            Ok((None, doc.is_some()))
        })
        .await
        .unwrap();

        assert!(!seen);
        assert!(store.get(&path).await.unwrap().is_none());
    }
}
