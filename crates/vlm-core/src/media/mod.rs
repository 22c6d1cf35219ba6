//! Media normalization: raw upload bytes to bounded, model-consumable assets.
//!
//! Images are decoded to RGB8 and capped in pixel dimensions; audio is
//! transcoded by an external tool into a mono 8 kHz 16-bit PCM WAV file that
//! lives in a scoped temporary path.

mod raster;
mod transcode;

use std::sync::Arc;

pub use raster::ImageAsset;
pub use transcode::{AudioAsset, AudioTranscoder, FfmpegTranscoder};

use crate::config::MediaConfig;
use crate::error::{Error, Result};

/// Converts raw image/audio bytes into assets owned by the conversation store.
#[derive(Clone)]
pub struct MediaNormalizer {
    config: MediaConfig,
    transcoder: Arc<dyn AudioTranscoder>,
}

impl MediaNormalizer {
    pub fn new(config: MediaConfig) -> Self {
        let transcoder = Arc::new(FfmpegTranscoder::new(
            config.ffmpeg_path.clone(),
            config.transcode_timeout,
        ));
        Self { config, transcoder }
    }

    pub fn with_transcoder(config: MediaConfig, transcoder: Arc<dyn AudioTranscoder>) -> Self {
        Self { config, transcoder }
    }

    pub fn config(&self) -> &MediaConfig {
        &self.config
    }

    /// Decode, convert to RGB and downscale on the blocking pool.
    pub async fn normalize_image(&self, bytes: Vec<u8>) -> Result<ImageAsset> {
        let max_bytes = self.config.max_image_bytes;
        let max_dimension = self.config.max_image_dimension;
        tokio::task::spawn_blocking(move || raster::normalize(&bytes, max_bytes, max_dimension))
            .await
            .map_err(|e| Error::InvalidMedia(format!("Image decode task failed: {e}")))?
    }

    /// Transcode arbitrary audio bytes into a temporary mono 8 kHz WAV file.
    pub async fn normalize_audio(&self, bytes: &[u8]) -> Result<AudioAsset> {
        transcode::normalize(self.transcoder.as_ref(), bytes, self.config.max_audio_bytes).await
    }
}
