//! Capture engine: countdown, crop and lossless encode of a single frame.

pub mod countdown;
pub mod crop;
pub mod source;

pub use countdown::{Countdown, CountdownOutcome};
pub use crop::CropRegion;
pub use source::{FrameSource, StillImageSource};

use crate::error::BoothError;
use bytes::Bytes;
use image::{ImageFormat, RgbaImage};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// One encoded capture, ready for upload.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub content_type: &'static str,
    pub extension: &'static str,
}

/// Encode a raster as PNG.
pub fn encode_png(image: &RgbaImage) -> Result<EncodedImage, BoothError> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| BoothError::Device(format!("PNG encoding failed: {e}")))?;

    Ok(EncodedImage {
        data: Bytes::from(buf.into_inner()),
        width: image.width(),
        height: image.height(),
        content_type: "image/png",
        extension: "png",
    })
}

/// Owns the camera feed and turns a frame into an encoded capture.
pub struct CaptureEngine {
    source: Mutex<Box<dyn FrameSource>>,
    aspect_ratio: f64,
    mirror: bool,
    in_flight: AtomicBool,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CaptureEngine {
    pub fn new(source: Box<dyn FrameSource>, aspect_ratio: f64, mirror: bool) -> Self {
        Self {
            source: Mutex::new(source),
            aspect_ratio,
            mirror,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Open the camera feed.
    pub async fn open(&self) -> Result<(), BoothError> {
        self.source.lock().await.open().await
    }

    /// Release the camera feed.
    pub async fn close(&self) {
        let mut source = self.source.lock().await;
        source.close().await;
        info!(source = %source.name(), "Camera feed closed");
    }

    /// Grab, crop and encode one frame.
    ///
    /// Returns `Ok(None)` when another capture is still in flight, so two
    /// overlapping expirations never produce two images.
    #[instrument(skip(self))]
    pub async fn capture_frame(&self) -> Result<Option<EncodedImage>, BoothError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            warn!("Capture already in flight, skipping");
            return Ok(None);
        }
        let _guard = InFlightGuard(&self.in_flight);

        let frame = self.source.lock().await.grab().await?;
        let (aspect, mirror) = (self.aspect_ratio, self.mirror);

        let encoded = tokio::task::spawn_blocking(move || {
            let cropped = crop::render(&frame, aspect, mirror);
            encode_png(&cropped)
        })
        .await
        .map_err(|e| BoothError::Device(format!("capture task failed: {e}")))??;

        info!(
            width = encoded.width,
            height = encoded.height,
            size_bytes = encoded.data.len(),
            "Frame captured"
        );
        metrics::counter!("booth.captures").increment(1);

        Ok(Some(encoded))
    }
}
