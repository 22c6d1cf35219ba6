//! Image decoding and bounding.

use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Decoded RGB raster held by an image content item.
#[derive(Debug, Clone)]
pub struct ImageAsset {
    raster: Arc<RgbImage>,
}

impl ImageAsset {
    pub fn from_rgb(raster: RgbImage) -> Self {
        Self {
            raster: Arc::new(raster),
        }
    }

    pub fn raster(&self) -> &Arc<RgbImage> {
        &self.raster
    }

    pub fn width(&self) -> u32 {
        self.raster.width()
    }

    pub fn height(&self) -> u32 {
        self.raster.height()
    }

    /// Drop the store's reference to the pixel buffer.
    pub(crate) fn release(self) {
        debug!(
            "Releasing {}x{} image raster",
            self.raster.width(),
            self.raster.height()
        );
    }
}

pub(crate) fn normalize(bytes: &[u8], max_bytes: usize, max_dimension: u32) -> Result<ImageAsset> {
    if bytes.is_empty() {
        return Err(Error::InvalidMedia("Empty image data provided".to_string()));
    }
    if bytes.len() > max_bytes {
        return Err(Error::InvalidMedia(format!(
            "Image too large: {} bytes (max {max_bytes})",
            bytes.len()
        )));
    }

    let decoded = image::load_from_memory(bytes)
        .map_err(|e| Error::InvalidMedia(format!("Failed to decode image: {e}")))?;

    let mut rgb = DynamicImage::ImageRgb8(decoded.into_rgb8());
    if rgb.width() > max_dimension || rgb.height() > max_dimension {
        rgb = rgb.resize(max_dimension, max_dimension, FilterType::Lanczos3);
        info!("Resized image to {}x{}", rgb.width(), rgb.height());
    }

    Ok(ImageAsset::from_rgb(rgb.into_rgb8()))
}
