//! `ytgrab` Core Library
//!
//! This crate provides the task orchestration behind the `ytgrab` downloader:
//! - Download registry and scheduler with bounded parallelism
//! - Pause, resume, stop and restart of individual downloads
//! - Delta-based speed and ETA estimation with periodic smoothing
//! - Playlist coordination in fixed-size chunks
//! - Compression of local media files through ffmpeg
//! - Application configuration management
//!
//! Observers receive task snapshots through an update callback installed on
//! each service. Validation failures are returned as [`Error`]; failures of
//! the external tools are recorded on the task itself.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ytgrab_core::{AppConfig, DownloadService, YtDlpEngine};
//!
//! let config = AppConfig::load()?;
//! let service = DownloadService::new(
//!     Arc::new(YtDlpEngine::new()),
//!     config.download_directory.clone(),
//!     config.download.clone(),
//! );
//! service.set_update_callback(|task| println!("{} {}%", task.status, task.percent));
//! service.add_task("https://www.youtube.com/watch?v=dQw4w9WgXcQ")?;
//! ```

pub mod compress;
pub mod config;
pub mod coordinator;
pub mod download;
pub mod engine;
pub mod error;
pub mod failure;
pub mod files;
pub mod format;
pub mod library_engine;
pub mod playlist;
pub mod playlist_source;
pub mod progress;
pub mod shell;
pub mod smoothing;
pub mod status;
pub mod task;
pub mod video_id;

#[cfg(test)]
mod testing;

pub use compress::{
    CompressionConfig, CompressionService, DEFAULT_PROBE_TIMEOUT_SECS, EncodeProgress, Encoder,
    FfmpegEncoder, build_ffmpeg_args, generate_output_path, parse_progress_line,
};
pub use config::{AppConfig, QualityPreset};
pub use coordinator::{
    DEFAULT_PLAYLIST_PARALLEL, DEFAULT_POLL_INTERVAL_MS, PlaylistConfig, PlaylistCoordinator,
};
pub use download::{
    DEFAULT_FILENAME_TEMPLATE, DEFAULT_MAX_PARALLEL_DOWNLOADS, DownloadConfig, DownloadService,
    MAX_PARALLEL_DOWNLOADS, MIN_PARALLEL_DOWNLOADS, clamp_parallel,
};
pub use engine::{
    DownloadEngine, DownloadRequest, EngineOutput, ProgressCallback, ProgressSample, RetryPolicy,
    YtDlpEngine, download_with_retry,
};
pub use error::{
    CompressionError, EngineError, Error, FileSystemError, PlaylistError, Result, ShellError,
    TaskError,
};
pub use failure::{FailureCategory, sanitize_engine_error};
pub use files::{default_download_directory, ensure_directory, sanitize_filename};
pub use format::{format_duration_label, format_eta, format_file_size, format_speed_mbps};
pub use library_engine::RustyYtdlEngine;
pub use playlist::{Playlist, PlaylistVideo};
pub use playlist_source::{
    DEFAULT_FETCH_TIMEOUT_SECS, PlaylistSource, YtDlpPlaylistSource, extract_playlist_id,
};
pub use progress::{RateTracker, RateUpdate};
pub use shell::{ShellIntegration, SystemShell};
pub use smoothing::SmoothingState;
pub use status::{PlaylistStatus, TaskStatus, VideoStatus};
pub use task::{CompressionTask, DownloadTask, ETA_UNKNOWN, TaskId, UpdateCallback};
pub use video_id::{extract_video_id, youtube_watch_url};
