use crate::config::DatabaseConfig;
use crate::document_store::{BatchOp, CasOutcome, DocPath, Document, DocumentStore, Fields, StoreError};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

const CHANGE_CHANNEL: &str = "document_changes";

const SELECT_ONE: &str = r#"
    SELECT collection, id, fields, version, updated_at
    FROM documents
    WHERE collection = $1 AND id = $2
"#;

const UPSERT: &str = r#"
    INSERT INTO documents (collection, id, fields, version, updated_at)
    VALUES ($1, $2, $3, nextval('document_versions'), NOW())
    ON CONFLICT (collection, id) DO UPDATE
        SET fields = EXCLUDED.fields,
            version = nextval('document_versions'),
            updated_at = NOW()
    RETURNING collection, id, fields, version, updated_at
"#;

const MERGE: &str = r#"
    UPDATE documents
    SET fields = fields || $3,
        version = nextval('document_versions'),
        updated_at = NOW()
    WHERE collection = $1 AND id = $2
    RETURNING collection, id, fields, version, updated_at
"#;

const INSERT_IF_ABSENT: &str = r#"
    INSERT INTO documents (collection, id, fields, version, updated_at)
    VALUES ($1, $2, $3, nextval('document_versions'), NOW())
    ON CONFLICT (collection, id) DO NOTHING
    RETURNING collection, id, fields, version, updated_at
"#;

const REPLACE_IF_VERSION: &str = r#"
    UPDATE documents
    SET fields = $3,
        version = nextval('document_versions'),
        updated_at = NOW()
    WHERE collection = $1 AND id = $2 AND version = $4
    RETURNING collection, id, fields, version, updated_at
"#;

const DELETE_ONE: &str = "DELETE FROM documents WHERE collection = $1 AND id = $2";

#[derive(Debug, FromRow)]
struct DocumentRow {
    collection: String,
    id: String,
    fields: Value,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl DocumentRow {
    fn into_document(self) -> Result<Document, StoreError> {
        let path = DocPath::new(self.collection, self.id);
        match self.fields {
            Value::Object(fields) => Ok(Document {
                path,
                fields,
                version: self.version.max(0) as u64,
                updated_at: self.updated_at,
            }),
            other => Err(StoreError::Malformed {
                path: path.to_string(),
                message: format!("expected an object, got {other}"),
            }),
        }
    }
}

/// Whether a freshly read `fetched` should replace what a watch channel
/// holds. Reads can finish out of order, so an older version never
/// overwrites a newer one.
fn supersedes(current: Option<&Document>, fetched: Option<&Document>) -> bool {
    match (current, fetched) {
        (Some(current), Some(fetched)) => fetched.version > current.version,
        (None, Some(_)) | (Some(_), None) => true,
        (None, None) => false,
    }
}

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Document store backed by a PostgreSQL `documents` table.
///
/// Conditional writes compare the `version` column; the `document_changes`
/// notification channel feeds watch subscriptions.
pub struct PgDocumentStore {
    pool: PgPool,
    watchers: Mutex<HashMap<DocPath, watch::Sender<Option<Document>>>>,
}

impl PgDocumentStore {
    /// Create a new store with a connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL document store");

        Ok(Self {
            pool,
            watchers: Mutex::new(HashMap::new()),
        })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Start forwarding `document_changes` notifications to watchers.
    ///
    /// When the listener connection drops, notifications may have been
    /// missed, so every watched document is re-read after reconnecting.
    pub async fn start_change_feed(self: &Arc<Self>) -> anyhow::Result<JoinHandle<()>> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .context("Failed to open change feed connection")?;
        listener
            .listen(CHANGE_CHANNEL)
            .await
            .context("Failed to LISTEN on change channel")?;

        info!(channel = CHANGE_CHANNEL, "Document change feed started");

        let store = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                match listener.try_recv().await {
                    Ok(Some(notification)) => match DocPath::parse(notification.payload()) {
                        Some(path) => store.refresh(&path).await,
                        None => warn!(payload = notification.payload(), "Ignoring malformed change notification"),
                    },
                    Ok(None) => {
                        warn!("Change feed connection lost, resynchronising watchers");
                        store.refresh_all().await;
                    }
                    Err(e) => {
                        error!(error = %e, "Change feed receive failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }))
    }

    async fn refresh(&self, path: &DocPath) {
        if !self.watchers.lock().contains_key(path) {
            return;
        }

        match self.get(path).await {
            Ok(doc) => {
                if let Some(tx) = self.watchers.lock().get(path) {
                    tx.send_if_modified(|current| {
                        if !supersedes(current.as_ref(), doc.as_ref()) {
                            return false;
                        }
                        *current = doc;
                        true
                    });
                }
                debug!(path = %path, "Watcher refreshed");
            }
            Err(e) => warn!(path = %path, error = %e, "Failed to refresh watched document"),
        }
    }

    async fn refresh_all(&self) {
        let paths: Vec<DocPath> = self.watchers.lock().keys().cloned().collect();
        for path in paths {
            self.refresh(&path).await;
        }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query_as::<_, DocumentRow>(SELECT_ONE)
            .bind(path.id())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        row.map(DocumentRow::into_document).transpose()
    }

    #[instrument(skip(self, fields), fields(path = %path))]
    async fn set(&self, path: &DocPath, fields: Fields) -> Result<Document, StoreError> {
        let row = sqlx::query_as::<_, DocumentRow>(UPSERT)
            .bind(path.collection())
            .bind(path.id())
            .bind(Value::Object(fields))
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;

        row.into_document()
    }

    #[instrument(skip(self, fields), fields(path = %path))]
    async fn update(&self, path: &DocPath, fields: Fields) -> Result<Document, StoreError> {
        let row = sqlx::query_as::<_, DocumentRow>(MERGE)
            .bind(path.collection())
            .bind(path.id())
            .bind(Value::Object(fields))
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        row.ok_or_else(|| StoreError::NotFound(path.to_string()))?
            .into_document()
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn delete(&self, path: &DocPath) -> Result<(), StoreError> {
        sqlx::query(DELETE_ONE)
            .bind(path.collection())
            .bind(path.id())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        let rows = sqlx::query_as::<_, DocumentRow>(
            r#"
            SELECT collection, id, fields, version, updated_at
            FROM documents
            WHERE collection = $1
            ORDER BY id ASC
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.into_iter().map(DocumentRow::into_document).collect()
    }

    #[instrument(skip(self, fields), fields(path = %path))]
    async fn compare_and_swap(
        &self,
        path: &DocPath,
        expected_version: Option<u64>,
        fields: Fields,
    ) -> Result<CasOutcome, StoreError> {
        let row = match expected_version {
            None => {
                sqlx::query_as::<_, DocumentRow>(INSERT_IF_ABSENT)
                    .bind(path.collection())
                    .bind(path.id())
                    .bind(Value::Object(fields))
                    .fetch_optional(&self.pool)
                    .await
            }
            Some(version) => {
                sqlx::query_as::<_, DocumentRow>(REPLACE_IF_VERSION)
                    .bind(path.collection())
                    .bind(path.id())
                    .bind(Value::Object(fields))
                    .bind(version as i64)
                    .fetch_optional(&self.pool)
                    .await
            }
        }
        .map_err(unavailable)?;

        match row {
            Some(row) => Ok(CasOutcome::Committed(row.into_document()?)),
            None => Ok(CasOutcome::Conflict),
        }
    }

    #[instrument(skip(self, ops), fields(op_count = ops.len()))]
    async fn commit_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        for op in ops {
            match op {
                BatchOp::Set { path, fields } => {
                    sqlx::query(UPSERT)
                    .bind(path.collection())
                    .bind(path.id())
                    .bind(Value::Object(fields))
                    .execute(&mut *tx)
                    .await
                    .map_err(unavailable)?;
                }
                BatchOp::Delete { path } => {
                    sqlx::query(DELETE_ONE)
                        .bind(path.collection())
                        .bind(path.id())
                        .execute(&mut *tx)
                        .await
                        .map_err(unavailable)?;
                }
            }
        }

        tx.commit().await.map_err(unavailable)?;
        Ok(())
    }

    async fn watch(&self, path: &DocPath) -> Result<watch::Receiver<Option<Document>>, StoreError> {
        {
            let mut watchers = self.watchers.lock();
            if let Some(tx) = watchers.get(path) {
                return Ok(tx.subscribe());
            }
            // Registered before the initial read so the change feed can
            // already deliver writes that land while it runs.
            watchers.insert(path.clone(), watch::channel(None).0);
        }

        let initial = match self.get(path).await {
            Ok(doc) => doc,
            Err(e) => {
                self.watchers.lock().remove(path);
                return Err(e);
            }
        };

        let watchers = self.watchers.lock();
        let tx = watchers
            .get(path)
            .ok_or_else(|| StoreError::Unavailable(format!("watch on {path} was dropped")))?;
        // The feed may have published a newer version meanwhile.
        tx.send_if_modified(|current| {
            if current.is_some() || initial.is_none() {
                return false;
            }
            *current = initial;
            true
        });
        Ok(tx.subscribe())
    }
}
