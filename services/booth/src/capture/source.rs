use crate::error::BoothError;
use async_trait::async_trait;
use image::RgbaImage;
use std::path::PathBuf;
use tracing::{debug, info};

/// A live camera feed.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Human-readable name for logs
    fn name(&self) -> String;

    /// Acquire the camera. Permission or device failures are `Device` errors.
    async fn open(&mut self) -> Result<(), BoothError>;

    /// Grab the most recent frame.
    async fn grab(&mut self) -> Result<RgbaImage, BoothError>;

    /// Release the camera.
    async fn close(&mut self);
}

/// Reads frames from an image file that a camera process keeps overwriting.
pub struct StillImageSource {
    path: PathBuf,
    opened: bool,
}

impl StillImageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            opened: false,
        }
    }
}

#[async_trait]
impl FrameSource for StillImageSource {
    fn name(&self) -> String {
        format!("still:{}", self.path.display())
    }

    async fn open(&mut self) -> Result<(), BoothError> {
        tokio::fs::metadata(&self.path).await.map_err(|e| {
            BoothError::Device(format!("camera feed {} unavailable: {e}", self.path.display()))
        })?;
        self.opened = true;
        info!(source = %self.name(), "Camera feed opened");
        Ok(())
    }

    async fn grab(&mut self) -> Result<RgbaImage, BoothError> {
        if !self.opened {
            return Err(BoothError::Device("camera feed is not open".to_string()));
        }

        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            BoothError::Device(format!("failed to read frame {}: {e}", self.path.display()))
        })?;

        // Decoding is CPU bound; keep it off the async workers.
        let frame = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
            .await
            .map_err(|e| BoothError::Device(format!("frame decode task failed: {e}")))?
            .map_err(|e| BoothError::Device(format!("undecodable frame: {e}")))?
            .to_rgba8();

        debug!(width = frame.width(), height = frame.height(), "Frame grabbed");
        Ok(frame)
    }

    async fn close(&mut self) {
        self.opened = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_feed_is_device_error() {
        let mut source = StillImageSource::new("/nonexistent/frame.png");
        assert!(matches!(source.open().await, Err(BoothError::Device(_))));
        assert!(matches!(source.grab().await, Err(BoothError::Device(_))));
    }

    #[tokio::test]
    async fn test_grabs_written_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        RgbaImage::new(8, 6).save(&path).unwrap();

        let mut source = StillImageSource::new(&path);
        source.open().await.unwrap();
        let frame = source.grab().await.unwrap();
        assert_eq!(frame.dimensions(), (8, 6));

        source.close().await;
        assert!(source.grab().await.is_err());
    }
}
