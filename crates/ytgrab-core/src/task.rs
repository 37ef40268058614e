//! Download and compression task records.
//!
//! These are the snapshots handed to the update sink and returned by the
//! services. The services own the authoritative copies.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::format::{format_eta, now_millis};
use crate::status::TaskStatus;

/// Identifier of a download or compression task.
pub type TaskId = String;

/// Prefix for download task ids.
pub const DOWNLOAD_ID_PREFIX: &str = "task-";

/// Prefix for compression task ids.
pub const COMPRESSION_ID_PREFIX: &str = "compress-";

/// ETA value meaning "unknown".
pub const ETA_UNKNOWN: i64 = -1;

/// Update sink invoked with a snapshot after every observable change.
pub type UpdateCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Generates a time-ordered download task id.
#[must_use]
pub fn new_download_id() -> TaskId {
    format!("{DOWNLOAD_ID_PREFIX}{}", Uuid::now_v7())
}

/// Generates a time-ordered compression task id.
#[must_use]
pub fn new_compression_id() -> TaskId {
    format!("{COMPRESSION_ID_PREFIX}{}", Uuid::now_v7())
}

/// A single URL download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    /// Unique, immutable id.
    pub id: TaskId,
    /// Source URL.
    pub url: String,
    /// Current status.
    pub status: TaskStatus,
    /// Raw progress (0.0 - 1.0).
    pub progress: f64,
    /// Smoothed display percent (0 - 100).
    pub percent: u8,
    /// Smoothed display speed, e.g. `"1.8MB/s"`. Empty when unknown.
    pub speed: String,
    /// Estimated seconds remaining, [`ETA_UNKNOWN`] when unknown.
    pub eta_secs: i64,
    /// Final output path once known.
    pub output_path: Option<PathBuf>,
    /// Video title once known.
    pub title: String,
    /// Human readable duration once known.
    pub duration_label: String,
    /// Total size in bytes once known.
    pub file_size: u64,
    /// User-facing failure message. Only set in [`TaskStatus::Error`].
    pub last_error: Option<String>,
    /// When the task was created or last (re)started (Unix millis).
    pub started_at: u64,
    /// When the task reached a terminal state (Unix millis).
    pub finished_at: Option<u64>,
}

impl DownloadTask {
    /// Creates a pending task for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: new_download_id(),
            url: url.into(),
            status: TaskStatus::Pending,
            progress: 0.0,
            percent: 0,
            speed: String::new(),
            eta_secs: ETA_UNKNOWN,
            output_path: None,
            title: String::new(),
            duration_label: String::new(),
            file_size: 0,
            last_error: None,
            started_at: now_millis(),
            finished_at: None,
        }
    }

    /// Title if known, otherwise the URL.
    #[must_use]
    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            &self.url
        } else {
            &self.title
        }
    }

    /// ETA formatted for display.
    #[must_use]
    pub fn eta_label(&self) -> String {
        format_eta(self.eta_secs)
    }

    /// Clears progress and failure state before a restart.
    pub(crate) fn reset_progress(&mut self) {
        self.progress = 0.0;
        self.percent = 0;
        self.speed.clear();
        self.eta_secs = ETA_UNKNOWN;
        self.last_error = None;
        self.finished_at = None;
    }

    /// Moves to a halted status and stamps `finished_at`.
    pub(crate) fn finish(&mut self, status: TaskStatus) {
        self.status = status;
        self.speed.clear();
        self.finished_at = Some(now_millis());
        if status != TaskStatus::Error {
            self.last_error = None;
        }
    }
}

/// A single file compression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionTask {
    /// Unique, immutable id.
    pub id: TaskId,
    /// Source media file.
    pub input_path: PathBuf,
    /// Destination file.
    pub output_path: PathBuf,
    /// Current status. Never [`TaskStatus::Paused`].
    pub status: TaskStatus,
    /// Progress (0.0 - 1.0).
    pub progress: f64,
    /// Display percent (0 - 100).
    pub percent: u8,
    /// Failure message. Only set in [`TaskStatus::Error`].
    pub last_error: Option<String>,
    /// When the task was created (Unix millis).
    pub started_at: u64,
    /// When the task reached a terminal state (Unix millis).
    pub finished_at: Option<u64>,
}

impl CompressionTask {
    /// Creates a pending compression of `input_path` into `output_path`.
    #[must_use]
    pub fn new(input_path: PathBuf, output_path: PathBuf) -> Self {
        Self {
            id: new_compression_id(),
            input_path,
            output_path,
            status: TaskStatus::Pending,
            progress: 0.0,
            percent: 0,
            last_error: None,
            started_at: now_millis(),
            finished_at: None,
        }
    }

    /// Input file name for display.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.input_path.file_name().map_or_else(
            || self.input_path.display().to_string(),
            |n| n.to_string_lossy().into_owned(),
        )
    }

    pub(crate) fn set_progress(&mut self, progress: f64) {
        self.progress = progress.clamp(0.0, 1.0);
        self.percent = (self.progress * 100.0).round() as u8;
    }

    pub(crate) fn finish(&mut self, status: TaskStatus, error: Option<String>) {
        self.status = status;
        self.last_error = error;
        self.finished_at = Some(now_millis());
    }
}
