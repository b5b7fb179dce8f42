//! Process setup shared by the server and device binaries.

use crate::blob_store::{BlobStore, InMemoryBlobStore};
use crate::config::{BlobBackend, Config, DocumentBackend};
use crate::document_store::{DocumentStore, InMemoryDocumentStore};
use crate::pg_document_store::PgDocumentStore;
use crate::s3_blob_store::S3BlobStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Backends selected by configuration.
pub struct Stores {
    pub docs: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    /// Postgres notification listener, when that backend is used.
    pub change_feed: Option<JoinHandle<()>>,
}

impl Stores {
    pub async fn connect(config: &Config) -> Result<Self> {
        let (docs, change_feed) = match config.database.backend {
            DocumentBackend::Postgres => {
                let store = Arc::new(
                    PgDocumentStore::new(&config.database)
                        .await
                        .context("Failed to initialize document store")?,
                );
                if config.database.run_migrations {
                    store
                        .run_migrations()
                        .await
                        .context("Failed to run database migrations")?;
                }
                let feed = store
                    .start_change_feed()
                    .await
                    .context("Failed to start document change feed")?;
                (store as Arc<dyn DocumentStore>, Some(feed))
            }
            DocumentBackend::Memory => {
                warn!("Using in-memory document store; state is not shared between processes");
                (Arc::new(InMemoryDocumentStore::new()) as Arc<dyn DocumentStore>, None)
            }
        };

        let blobs: Arc<dyn BlobStore> = match config.blob.backend {
            BlobBackend::S3 => Arc::new(
                S3BlobStore::new(&config.blob)
                    .await
                    .context("Failed to initialize blob store")?,
            ),
            BlobBackend::Memory => {
                warn!("Using in-memory blob store");
                Arc::new(InMemoryBlobStore::default())
            }
        };

        Ok(Self {
            docs,
            blobs,
            change_feed,
        })
    }

    pub fn shutdown(self) {
        if let Some(feed) = self.change_feed {
            feed.abort();
        }
    }
}

/// Initialize tracing/logging
pub fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
pub fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");
    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
