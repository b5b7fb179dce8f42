//! Centered crop-to-fill arithmetic and rasterisation.

use image::{imageops, RgbaImage};

/// Source rectangle to cut out of a frame, in fractional pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CropRegion {
    pub sx: f64,
    pub sy: f64,
    pub sw: f64,
    pub sh: f64,
}

impl CropRegion {
    /// Largest centered rectangle of aspect ratio `aspect` (width / height)
    /// that fits a `vw` x `vh` frame. Never stretches.
    pub fn compute(vw: f64, vh: f64, aspect: f64) -> Self {
        if vw / vh > aspect {
            // Frame is wider than the target: keep full height.
            let sh = vh;
            let sw = vh * aspect;
            Self {
                sx: (vw - sw) / 2.0,
                sy: 0.0,
                sw,
                sh,
            }
        } else {
            let sw = vw;
            let sh = vw / aspect;
            Self {
                sx: 0.0,
                sy: (vh - sh) / 2.0,
                sw,
                sh,
            }
        }
    }

    /// Whole-pixel rectangle `(x, y, width, height)` inside a frame of the
    /// given size. Sizes truncate, offsets round; the result is clamped to
    /// the frame and is at least one pixel in each direction.
    pub fn to_pixels(&self, frame_width: u32, frame_height: u32) -> (u32, u32, u32, u32) {
        let width = (self.sw.trunc() as u32).clamp(1, frame_width.max(1));
        let height = (self.sh.trunc() as u32).clamp(1, frame_height.max(1));
        let x = (self.sx.round().max(0.0) as u32).min(frame_width.saturating_sub(width));
        let y = (self.sy.round().max(0.0) as u32).min(frame_height.saturating_sub(height));
        (x, y, width, height)
    }
}

/// Cut the crop region for `aspect` out of `frame`, optionally mirrored
/// horizontally. The output raster is exactly the cropped size.
pub fn render(frame: &RgbaImage, aspect: f64, mirror: bool) -> RgbaImage {
    let region = CropRegion::compute(frame.width() as f64, frame.height() as f64, aspect);
    let (x, y, width, height) = region.to_pixels(frame.width(), frame.height());

    let cropped = imageops::crop_imm(frame, x, y, width, height).to_image();
    if mirror {
        imageops::flip_horizontal(&cropped)
    } else {
        cropped
    }
}
