//! Audio transcoding to mono 8 kHz 16-bit PCM WAV.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempPath;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const OUTPUT_SAMPLE_RATE: u32 = 8_000;

/// External audio converter. Writes a mono 8 kHz PCM WAV to `output`.
#[async_trait]
pub trait AudioTranscoder: Send + Sync {
    async fn transcode(&self, input: &Path, output: &Path) -> Result<()>;
}

/// Runs `ffmpeg` as a child process with a hard deadline.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: PathBuf,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(program: PathBuf, timeout: Duration) -> Self {
        Self { program, timeout }
    }
}

#[async_trait]
impl AudioTranscoder for FfmpegTranscoder {
    async fn transcode(&self, input: &Path, output: &Path) -> Result<()> {
        let rate = OUTPUT_SAMPLE_RATE.to_string();
        let child = Command::new(&self.program)
            .arg("-y")
            .arg("-i")
            .arg(input)
            .args(["-ar", rate.as_str(), "-ac", "1", "-c:a", "pcm_s16le"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => Error::ConversionFailed(format!(
                    "{} not found; install ffmpeg to enable audio input",
                    self.program.display()
                )),
                _ => Error::ConversionFailed(format!("Failed to start transcoder: {e}")),
            })?;

        // Dropping the future on timeout drops the child, which kills it.
        let result = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::ConversionFailed(format!(
                    "Transcoder timed out after {}s",
                    self.timeout.as_secs_f32()
                ))
            })?
            .map_err(|e| Error::ConversionFailed(format!("Transcoder failed: {e}")))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let tail = stderr.lines().last().unwrap_or("").trim();
            return Err(Error::ConversionFailed(format!(
                "Transcoder exited with {}: {tail}",
                result.status
            )));
        }
        Ok(())
    }
}

/// Transcoded audio file. Deleted when released or dropped.
#[derive(Debug)]
pub struct AudioAsset {
    path: TempPath,
    size_bytes: u64,
}

impl AudioAsset {
    pub fn from_temp_path(path: TempPath) -> Result<Self> {
        let size_bytes = std::fs::metadata(&path)?.len();
        Ok(Self { path, size_bytes })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Delete the backing file. Failures are logged, never raised.
    pub(crate) fn release(self) {
        let shown = self.path.display().to_string();
        match self.path.close() {
            Ok(()) => debug!("Removed transcoded audio {shown}"),
            Err(e) => warn!("Failed to remove transcoded audio {shown}: {e}"),
        }
    }
}

pub(crate) async fn normalize(
    transcoder: &dyn AudioTranscoder,
    bytes: &[u8],
    max_bytes: usize,
) -> Result<AudioAsset> {
    if bytes.is_empty() {
        return Err(Error::InvalidMedia("Empty audio data provided".to_string()));
    }
    if bytes.len() > max_bytes {
        return Err(Error::InvalidMedia(format!(
            "Audio too large: {} bytes (max {max_bytes})",
            bytes.len()
        )));
    }

    let input = tempfile::Builder::new()
        .prefix("vlm-audio-in-")
        .suffix(".audio")
        .tempfile()?
        .into_temp_path();
    tokio::fs::write(&input, bytes).await?;

    let output = tempfile::Builder::new()
        .prefix("vlm-audio-")
        .suffix(".wav")
        .tempfile()?
        .into_temp_path();

    let converted = transcoder.transcode(&input, &output).await;
    if let Err(e) = input.close() {
        warn!("Failed to remove audio upload temp file: {e}");
    }
    converted?;

    let asset = match AudioAsset::from_temp_path(output) {
        Ok(asset) => asset,
        Err(e) => {
            return Err(Error::ConversionFailed(format!(
                "Transcoder produced no output: {e}"
            )))
        }
    };
    if asset.size_bytes == 0 {
        asset.release();
        return Err(Error::ConversionFailed(
            "Transcoder produced an empty file".to_string(),
        ));
    }

    debug!(
        "Transcoded {} input bytes to {} ({} bytes)",
        bytes.len(),
        asset.path().display(),
        asset.size_bytes
    );
    Ok(asset)
}
