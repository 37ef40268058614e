//! Pure-Rust download engine built on `rusty_ytdl`.
//!
//! Needs no external executable but only understands YouTube URLs. Data is
//! streamed into a `.part` file that is renamed once the stream ends, so an
//! interrupted download never looks finished. A cancelled download keeps its
//! `.part` file and the next attempt appends to it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusty_ytdl::{Video, VideoOptions, VideoQuality, VideoSearchOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::QualityPreset;
use crate::engine::{DownloadEngine, DownloadRequest, EngineOutput, ProgressCallback, ProgressSample};
use crate::error::EngineError;
use crate::files::sanitize_filename;
use crate::format::format_duration_label;

/// Engine backed by the `rusty_ytdl` library.
#[derive(Debug, Clone, Copy, Default)]
pub struct RustyYtdlEngine;

impl RustyYtdlEngine {
    /// Creates the engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn video_options(quality: QualityPreset) -> VideoOptions {
        // Combined streams are more reliable than split audio streams.
        let (quality, filter) = match quality {
            QualityPreset::Best => (VideoQuality::Highest, VideoSearchOptions::VideoAudio),
            QualityPreset::Medium => (VideoQuality::Lowest, VideoSearchOptions::VideoAudio),
            QualityPreset::Audio => (VideoQuality::HighestAudio, VideoSearchOptions::Audio),
        };
        VideoOptions {
            quality,
            filter,
            ..Default::default()
        }
    }

    /// Destination for a title, e.g. `<dir>/<title>.mp4`.
    #[must_use]
    pub fn output_path(dir: &Path, title: &str, quality: QualityPreset) -> PathBuf {
        let extension = match quality {
            QualityPreset::Audio => "m4a",
            QualityPreset::Best | QualityPreset::Medium => "mp4",
        };
        let name = sanitize_filename(title);
        dir.join(format!("{name}.{extension}"))
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// Bytes of an existing `.part` file that can be kept for a stream of
/// `total` bytes. Zero when the total is unknown or the file is too large.
fn resume_offset(part_len: u64, total: u64) -> u64 {
    if total > 0 && part_len <= total {
        part_len
    } else {
        0
    }
}

/// Drops the part of `chunk` that is already on disk, decreasing `skip`.
fn unwritten_tail<'a>(chunk: &'a [u8], skip: &mut u64) -> &'a [u8] {
    let len = chunk.len() as u64;
    if *skip >= len {
        *skip -= len;
        return &[];
    }
    let start = usize::try_from(*skip).unwrap_or(chunk.len());
    *skip = 0;
    &chunk[start..]
}

async fn open_partial(path: &Path, offset: u64) -> std::io::Result<tokio::fs::File> {
    if offset > 0 {
        tokio::fs::OpenOptions::new().append(true).open(path).await
    } else {
        tokio::fs::File::create(path).await
    }
}

#[async_trait]
impl DownloadEngine for RustyYtdlEngine {
    fn name(&self) -> &'static str {
        "rusty_ytdl"
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<EngineOutput, EngineError> {
        debug!("Downloading {} using rusty_ytdl", request.url);

        let video = Video::new_with_options(&request.url, Self::video_options(request.quality))
            .map_err(|e| EngineError::Failed(format!("Failed to create video instance: {e}")))?;

        let info = tokio::select! {
            () = cancel.cancelled() => return Err(EngineError::Cancelled),
            info = video.get_info() => info
                .map_err(|e| EngineError::Failed(format!("Failed to get video info: {e}")))?,
        };

        let title = info.video_details.title.clone();
        let duration_label = info
            .video_details
            .length_seconds
            .parse::<u64>()
            .ok()
            .map(format_duration_label);
        let output_path = Self::output_path(&request.output_dir, &title, request.quality);
        let part_path = partial_path(&output_path);

        let stream = video
            .stream()
            .await
            .map_err(|e| EngineError::Failed(format!("Failed to create stream: {e}")))?;
        let total = stream.content_length() as u64;
        info!("Stream content length for {}: {} bytes", request.video_id, total);

        let existing = tokio::fs::metadata(&part_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let offset = resume_offset(existing, total);
        if offset > 0 {
            info!(
                "Resuming {} at {} of {} bytes",
                request.video_id, offset, total
            );
        }
        let mut file = open_partial(&part_path, offset).await?;
        // The stream always starts at byte 0; bytes already on disk are skipped.
        let mut skip = offset;
        let mut downloaded = offset;
        let sample = |downloaded: u64| ProgressSample {
            downloaded_bytes: downloaded,
            total_bytes: total,
            title: Some(title.clone()),
            duration_label: duration_label.clone(),
            output_path: Some(output_path.clone()),
        };
        if offset > 0 {
            progress(sample(offset));
        }

        let result: Result<(), EngineError> = async {
            loop {
                let chunk = tokio::select! {
                    () = cancel.cancelled() => return Err(EngineError::Cancelled),
                    chunk = stream.chunk() => chunk
                        .map_err(|e| EngineError::Failed(format!("Failed to download chunk: {e}")))?,
                };
                let Some(chunk) = chunk else {
                    break;
                };
                let fresh = unwritten_tail(&chunk, &mut skip);
                if fresh.is_empty() {
                    continue;
                }
                file.write_all(fresh).await?;
                downloaded += fresh.len() as u64;
                progress(sample(downloaded));
            }
            file.flush().await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            if let Err(flush_err) = file.flush().await {
                warn!("Failed to flush {}: {}", part_path.display(), flush_err);
            }
            drop(file);
            if matches!(e, EngineError::Cancelled) {
                debug!("Keeping {} ({} bytes) for resume", part_path.display(), downloaded);
            } else if let Err(remove_err) = tokio::fs::remove_file(&part_path).await {
                warn!("Failed to remove {}: {}", part_path.display(), remove_err);
            }
            return Err(e);
        }

        tokio::fs::rename(&part_path, &output_path).await?;
        info!(
            "Downloaded {} bytes: {} -> {}",
            downloaded,
            title,
            output_path.display()
        );

        Ok(EngineOutput {
            output_path: Some(output_path),
            title: Some(title),
            duration_label,
        })
    }
}
