use anyhow::{Context, Result};
use booth_service::bootstrap::{init_tracing, shutdown_signal, Stores};
use booth_service::{
    CaptureController, CaptureEngine, Config, DeviceIdentityProvider, FileKeyValueStore, Gallery,
    ResourceLock, StillImageSource, TriggerChannel,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Delay before reopening the camera after a failed session.
const REMOUNT_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.service.log_level);

    let device_id = DeviceIdentityProvider::new(FileKeyValueStore::new(&config.capture.identity_path))
        .device_id()
        .context("Failed to load device identity")?;

    info!(device_id = %device_id, "Starting booth device");

    let stores = Stores::connect(&config).await?;

    let lock = Arc::new(ResourceLock::from_config(stores.docs.clone(), &config.lock));
    let gallery = Arc::new(Gallery::new(
        stores.docs.clone(),
        stores.blobs.clone(),
        &config.blob,
        &config.gallery,
    ));
    let engine = Arc::new(CaptureEngine::new(
        Box::new(StillImageSource::new(&config.capture.frame_path)),
        config.capture.aspect_ratio,
        config.capture.mirror,
    ));
    let controller = CaptureController::new(
        device_id,
        lock,
        TriggerChannel::new(stores.docs.clone()),
        engine,
        gallery,
        config.capture.countdown_secs,
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let mut status = controller.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            info!(state = ?current.state, countdown = ?current.countdown, "Booth status");
        }
    });

    loop {
        match controller.run(shutdown.clone()).await {
            Ok(()) => break,
            Err(e) => {
                error!(error = %e, "Capture session ended, retrying");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(REMOUNT_DELAY) => {}
                }
            }
        }
    }

    stores.shutdown();
    info!("Booth device stopped");
    Ok(())
}
