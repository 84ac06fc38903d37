//! Thumbnail store: one JPEG per sampled frame, keyed by video and timestamp

use std::path::{Path, PathBuf};

use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;

use crate::{Result, VsError};

/// Writes compressed stills at paths derived from `(video_id, timestamp)`.
#[derive(Debug, Clone)]
pub struct ThumbnailStore {
    dir: PathBuf,
    quality: u8,
    max_side: u32,
}

impl ThumbnailStore {
    pub fn new(dir: PathBuf, quality: u8, max_side: u32) -> Self {
        Self {
            dir,
            quality,
            max_side,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic path for a frame. Timestamps are keyed to the microsecond,
    /// so consecutive frames stay distinct at any real frame rate.
    pub fn path_for(&self, video_id: &str, timestamp: f64) -> PathBuf {
        self.dir.join(format!("{}_{:.6}.jpg", video_id, timestamp))
    }

    /// Write the thumbnail for a frame, overwriting any previous one, and
    /// return its path.
    pub fn write(&self, video_id: &str, timestamp: f64, image: &RgbImage) -> Result<PathBuf> {
        let path = self.path_for(video_id, timestamp);

        let resized;
        let image = if self.max_side > 0 && image.width().max(image.height()) > self.max_side {
            let (w, h) = fit_within(image.width(), image.height(), self.max_side);
            resized = image::imageops::resize(image, w, h, FilterType::Triangle);
            &resized
        } else {
            image
        };

        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, self.quality).encode_image(image)?;
        std::fs::write(&path, bytes)
            .map_err(|e| VsError::Persistence(format!("{}: {}", path.display(), e)))?;

        Ok(path)
    }

    /// Remove every thumbnail.
    pub fn clear(&self) -> Result<()> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }
}

fn fit_within(width: u32, height: u32, max_side: u32) -> (u32, u32) {
    if width >= height {
        let h = (height as u64 * max_side as u64 / width as u64).max(1) as u32;
        (max_side, h)
    } else {
        let w = (width as u64 * max_side as u64 / height as u64).max(1) as u32;
        (w, max_side)
    }
}
