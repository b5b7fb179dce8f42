use anyhow::{Context, Result};
use booth_service::api::{start_api_server, AppState};
use booth_service::bootstrap::{init_metrics, init_tracing, shutdown_signal, Stores};
use booth_service::{Config, Gallery, ResourceLock, ThemeService, TriggerChannel};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.service.log_level);

    info!(service = %config.service.name, "Starting booth server");

    init_metrics(config.service.metrics_port)?;

    let stores = Stores::connect(&config).await?;

    let state = AppState {
        docs: stores.docs.clone(),
        lock: Arc::new(ResourceLock::from_config(stores.docs.clone(), &config.lock)),
        trigger: TriggerChannel::new(stores.docs.clone()),
        gallery: Arc::new(Gallery::new(
            stores.docs.clone(),
            stores.blobs.clone(),
            &config.blob,
            &config.gallery,
        )),
        themes: Arc::new(ThemeService::new(stores.docs.clone(), config.themes.max_length)),
    };

    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Booth server started successfully");

    shutdown_signal().await;

    info!("Shutting down booth server");
    api_handle.abort();
    stores.shutdown();

    info!("Booth server stopped");
    Ok(())
}
