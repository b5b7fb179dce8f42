//! Single-owner lock over a shared document.
//!
//! Ensures that only one tablet at a time is in capturing mode. Every
//! mutation of the lock record goes through [`run_transaction`], so two
//! devices can never both observe "unlocked" and both write "locked by me".

use crate::config::LockConfig;
use crate::document_store::{encode, run_transaction, DocPath, Document, DocumentStore, RetryPolicy};
use crate::error::{BoothError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Collection holding the lock and trigger documents.
pub const CAMERA_COLLECTION: &str = "camera";

/// Stored lock state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub locked_at: Option<DateTime<Utc>>,
}

impl LockRecord {
    fn locked_by(owner_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            is_locked: true,
            owner_id: owner_id.to_string(),
            locked_at: Some(now),
        }
    }

    fn unlocked() -> Self {
        Self::default()
    }

    /// Whether `device_id` currently holds the lock.
    pub fn is_held_by(&self, device_id: &str) -> bool {
        self.is_locked && self.owner_id == device_id
    }

    /// A held lock older than `stale_after` may be reclaimed. Without a
    /// timeout nothing is ever stale.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: Option<Duration>) -> bool {
        let (Some(limit), Some(locked_at)) = (stale_after, self.locked_at) else {
            return false;
        };
        let Ok(limit) = chrono::Duration::from_std(limit) else {
            return false;
        };
        self.is_locked && now - locked_at >= limit
    }
}

/// Outcome of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockResult {
    pub granted: bool,
    /// Owner after the attempt, when the lock is held.
    pub owner_id: Option<String>,
}

impl LockResult {
    fn granted(owner_id: &str) -> Self {
        Self {
            granted: true,
            owner_id: Some(owner_id.to_string()),
        }
    }

    fn denied(owner_id: &str) -> Self {
        Self {
            granted: false,
            owner_id: Some(owner_id.to_string()),
        }
    }

    /// Convert a denial into a contention error.
    pub fn into_result(self, resource: &str) -> Result<()> {
        if self.granted {
            Ok(())
        } else {
            Err(BoothError::Contention {
                resource: resource.to_string(),
                owner: self.owner_id.unwrap_or_default(),
            })
        }
    }
}

fn decode_record(doc: Option<&Document>) -> Result<Option<LockRecord>> {
    Ok(doc.map(|d| d.decode::<LockRecord>()).transpose()?)
}

/// Distributed lock for one shared resource.
pub struct ResourceLock {
    store: Arc<dyn DocumentStore>,
    path: DocPath,
    retry: RetryPolicy,
    stale_after: Option<Duration>,
}

impl ResourceLock {
    pub fn new(store: Arc<dyn DocumentStore>, resource_id: &str, retry: RetryPolicy) -> Self {
        Self {
            store,
            path: DocPath::new(CAMERA_COLLECTION, resource_id),
            retry,
            stale_after: None,
        }
    }

    pub fn from_config(store: Arc<dyn DocumentStore>, config: &LockConfig) -> Self {
        let retry = RetryPolicy {
            max_attempts: config.max_attempts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        };
        Self::new(store, &config.resource_id, retry).with_stale_after(config.stale_after())
    }

    /// Allow reclaiming a lock held longer than `stale_after`.
    pub fn with_stale_after(mut self, stale_after: Option<Duration>) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn path(&self) -> &DocPath {
        &self.path
    }

    pub fn stale_after(&self) -> Option<Duration> {
        self.stale_after
    }

    /// Current lock record, if one was ever written.
    pub async fn current(&self) -> Result<Option<LockRecord>> {
        let doc = self.store.get(&self.path).await?;
        decode_record(doc.as_ref())
    }

    /// Try to become the owner.
    ///
    /// Succeeds when the lock is free, already held by `device_id`, or held
    /// past the staleness timeout. Fails without mutation otherwise.
    #[instrument(skip(self), fields(resource = %self.path))]
    pub async fn try_acquire(&self, device_id: &str) -> Result<LockResult> {
        let stale_after = self.stale_after;

        let result = run_transaction(self.store.as_ref(), &self.path, &self.retry, |doc| {
            let now = Utc::now();
            match decode_record(doc)? {
                Some(record) if record.is_held_by(device_id) => {
                    Ok((None, LockResult::granted(device_id)))
                }
                Some(record) if record.is_locked && !record.is_stale(now, stale_after) => {
                    Ok((None, LockResult::denied(&record.owner_id)))
                }
                previous => {
                    if let Some(stale) = previous.filter(|r| r.is_locked) {
                        warn!(
                            previous_owner = %stale.owner_id,
                            locked_at = ?stale.locked_at,
                            "Reclaiming stale lock"
                        );
                    }
                    let fields = encode(&self.path, &LockRecord::locked_by(device_id, now))?;
                    Ok((Some(fields), LockResult::granted(device_id)))
                }
            }
        })
        .await?;

        if result.granted {
            info!(device_id = %device_id, "Lock acquired");
            metrics::counter!("booth.lock.granted").increment(1);
        } else {
            debug!(
                device_id = %device_id,
                owner = ?result.owner_id,
                "Lock held by another device"
            );
            metrics::counter!("booth.lock.denied").increment(1);
        }

        Ok(result)
    }

    /// Give up ownership. A no-op unless `device_id` is the current owner,
    /// so a late release never clobbers a newer owner.
    #[instrument(skip(self), fields(resource = %self.path))]
    pub async fn release(&self, device_id: &str) -> Result<()> {
        let released = run_transaction(self.store.as_ref(), &self.path, &self.retry, |doc| {
            match decode_record(doc)? {
                Some(record) if record.is_held_by(device_id) => {
                    let fields = encode(&self.path, &LockRecord::unlocked())?;
                    Ok((Some(fields), true))
                }
                _ => Ok((None, false)),
            }
        })
        .await?;

        if released {
            info!(device_id = %device_id, "Lock released");
        } else {
            debug!(device_id = %device_id, "Release ignored, not the owner");
        }
        Ok(())
    }

    /// Refresh `lockedAt` so a live owner never looks stale. Returns `false`
    /// without writing when `device_id` no longer holds the lock.
    #[instrument(skip(self), fields(resource = %self.path))]
    pub async fn renew(&self, device_id: &str) -> Result<bool> {
        let renewed = run_transaction(self.store.as_ref(), &self.path, &self.retry, |doc| {
            match decode_record(doc)? {
                Some(record) if record.is_held_by(device_id) => {
                    let fields = encode(&self.path, &LockRecord::locked_by(device_id, Utc::now()))?;
                    Ok((Some(fields), true))
                }
                _ => Ok((None, false)),
            }
        })
        .await?;

        if renewed {
            debug!(device_id = %device_id, "Lock renewed");
        } else {
            warn!(device_id = %device_id, "Lock renewal refused, not the owner");
        }
        Ok(renewed)
    }

    /// Subscribe to every change of the lock record.
    pub async fn subscribe(&self) -> Result<LockSubscription> {
        let rx = self.store.watch(&self.path).await?;
        Ok(LockSubscription { rx })
    }
}

/// Live view of the lock record.
pub struct LockSubscription {
    rx: watch::Receiver<Option<Document>>,
}

impl LockSubscription {
    /// Latest record, marking it seen. A malformed record reads as absent.
    pub fn current(&mut self) -> Option<LockRecord> {
        let doc = self.rx.borrow_and_update().clone();
        match decode_record(doc.as_ref()) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed lock record");
                None
            }
        }
    }

    /// Wait for the next change. Returns `None` once the store is gone.
    pub async fn changed(&mut self) -> Option<Option<LockRecord>> {
        self.rx.changed().await.ok()?;
        Some(self.current())
    }
}
