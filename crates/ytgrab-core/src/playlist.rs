//! Playlist and playlist video records.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::format::now_millis;
use crate::status::{PlaylistStatus, VideoStatus};
use crate::task::ETA_UNKNOWN;

/// One video of a playlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistVideo {
    /// Canonical video id.
    pub id: String,
    /// Video title.
    pub title: String,
    /// Human readable duration.
    pub duration: String,
    /// Watch URL.
    pub url: String,
    /// Current status.
    pub status: VideoStatus,
    /// Progress (0.0 - 1.0).
    pub progress: f64,
    /// Failure message.
    pub error: Option<String>,
    /// Output file once downloaded.
    pub output_path: Option<PathBuf>,
    /// Output size in bytes.
    pub file_size: u64,
    /// Display speed mirrored from the download task.
    pub speed: String,
    /// Seconds remaining mirrored from the download task.
    pub eta_secs: i64,
    /// Creation time (Unix millis).
    pub created_at: u64,
    /// Last update time (Unix millis).
    pub updated_at: u64,
}

impl PlaylistVideo {
    /// Creates a pending video.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        duration: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            title: title.into(),
            duration: duration.into(),
            url: url.into(),
            status: VideoStatus::Pending,
            progress: 0.0,
            error: None,
            output_path: None,
            file_size: 0,
            speed: String::new(),
            eta_secs: ETA_UNKNOWN,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A playlist and its member videos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Playlist {
    /// Playlist id (the `list=` parameter).
    pub id: String,
    /// Display title.
    pub title: String,
    /// Source URL.
    pub url: String,
    /// Member videos in playlist order.
    pub videos: Vec<PlaylistVideo>,
    /// Current status.
    pub status: PlaylistStatus,
    /// Number of videos. Kept equal to `videos.len()`.
    pub total_videos: usize,
    /// Number of completed videos. Advisory.
    pub downloaded: usize,
    /// Failure message.
    pub error: Option<String>,
    /// Creation time (Unix millis).
    pub created_at: u64,
    /// Last update time (Unix millis).
    pub updated_at: u64,
}

impl Playlist {
    /// Creates an empty playlist in [`PlaylistStatus::Parsing`].
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            title: title.into(),
            url: url.into(),
            videos: Vec::new(),
            status: PlaylistStatus::Parsing,
            total_videos: 0,
            downloaded: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = now_millis();
    }

    /// Appends a video.
    pub fn add_video(&mut self, video: PlaylistVideo) {
        self.videos.push(video);
        self.total_videos = self.videos.len();
        self.touch();
    }

    /// Removes a video by id. Returns true if it was present.
    pub fn remove_video(&mut self, video_id: &str) -> bool {
        let before = self.videos.len();
        self.videos.retain(|v| v.id != video_id);
        self.total_videos = self.videos.len();
        self.touch();
        self.videos.len() != before
    }

    /// Sets the playlist status and error.
    pub fn update_status(&mut self, status: PlaylistStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.touch();
    }

    /// Looks up a video by id.
    #[must_use]
    pub fn video(&self, video_id: &str) -> Option<&PlaylistVideo> {
        self.videos.iter().find(|v| v.id == video_id)
    }

    fn video_mut(&mut self, video_id: &str) -> Option<&mut PlaylistVideo> {
        self.videos.iter_mut().find(|v| v.id == video_id)
    }

    /// Sets a video's status and error. Returns false if the video is unknown.
    pub fn update_video_status(
        &mut self,
        video_id: &str,
        status: VideoStatus,
        error: Option<String>,
    ) -> bool {
        let Some(video) = self.video_mut(video_id) else {
            return false;
        };
        video.status = status;
        video.error = error;
        video.updated_at = now_millis();
        self.touch();
        true
    }

    /// Mirrors progress, speed and ETA onto a video.
    pub fn update_video_progress(
        &mut self,
        video_id: &str,
        progress: f64,
        speed: &str,
        eta_secs: i64,
    ) -> bool {
        let Some(video) = self.video_mut(video_id) else {
            return false;
        };
        video.progress = progress.clamp(0.0, 1.0);
        video.speed = speed.to_string();
        video.eta_secs = eta_secs;
        video.updated_at = now_millis();
        self.touch();
        true
    }

    /// Records a video's output file.
    pub fn update_video_output(&mut self, video_id: &str, path: PathBuf, file_size: u64) -> bool {
        let Some(video) = self.video_mut(video_id) else {
            return false;
        };
        video.output_path = Some(path);
        video.file_size = file_size;
        video.updated_at = now_millis();
        self.touch();
        true
    }

    fn videos_with(&self, status: VideoStatus) -> Vec<&PlaylistVideo> {
        self.videos.iter().filter(|v| v.status == status).collect()
    }

    /// Videos not started yet.
    #[must_use]
    pub fn pending_videos(&self) -> Vec<&PlaylistVideo> {
        self.videos_with(VideoStatus::Pending)
    }

    /// Videos with a running download.
    #[must_use]
    pub fn downloading_videos(&self) -> Vec<&PlaylistVideo> {
        self.videos_with(VideoStatus::Downloading)
    }

    /// Videos downloaded successfully.
    #[must_use]
    pub fn completed_videos(&self) -> Vec<&PlaylistVideo> {
        self.videos_with(VideoStatus::Completed)
    }

    /// Percent of videos completed (0 - 100).
    #[must_use]
    pub fn download_progress(&self) -> f64 {
        if self.videos.is_empty() {
            return 0.0;
        }
        self.completed_videos().len() as f64 / self.videos.len() as f64 * 100.0
    }

    /// Returns true if the playlist can be handed to the coordinator.
    #[must_use]
    pub fn is_ready_for_download(&self) -> bool {
        self.status == PlaylistStatus::Ready && !self.videos.is_empty()
    }

    /// Returns true if any video failed.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.videos.iter().any(|v| v.status == VideoStatus::Error)
    }
}
