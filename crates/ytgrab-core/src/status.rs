//! Status enums shared by downloads, compressions and playlists.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a download or compression task.
///
/// Compression tasks never enter [`TaskStatus::Paused`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Waiting for a free download slot.
    Pending,
    /// Slot acquired, engine not yet producing output.
    Starting,
    /// Engine running.
    Downloading,
    /// Stop or pause requested, waiting for the engine to return.
    Stopping,
    /// Halted by the user, can be resumed.
    Paused,
    /// Halted by the user.
    Stopped,
    /// Finished successfully.
    Completed,
    /// Finished with a failure.
    Error,
}

impl TaskStatus {
    /// Returns true while the task holds a scheduler slot.
    #[must_use]
    pub const fn is_active(self) -> bool {
        match self {
            Self::Starting | Self::Downloading | Self::Stopping => true,
            Self::Pending | Self::Paused | Self::Stopped | Self::Completed | Self::Error => false,
        }
    }

    /// Returns true for terminal states.
    ///
    /// `Paused` is neither active nor finished.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        match self {
            Self::Stopped | Self::Completed | Self::Error => true,
            Self::Pending | Self::Starting | Self::Downloading | Self::Stopping | Self::Paused => {
                false
            }
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Starting => write!(f, "Starting"),
            Self::Downloading => write!(f, "Downloading"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Paused => write!(f, "Paused"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Completed => write!(f, "Completed"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Status of a whole playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaylistStatus {
    /// Metadata is still being fetched.
    Parsing,
    /// Metadata loaded, nothing downloading yet.
    Ready,
    /// Videos are being downloaded.
    Downloading,
    /// Processing finished. Individual videos may still have failed.
    Completed,
    /// Cancelled or failed to load.
    Error,
}

impl std::fmt::Display for PlaylistStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parsing => write!(f, "parsing"),
            Self::Ready => write!(f, "ready"),
            Self::Downloading => write!(f, "downloading"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Status of a single video inside a playlist.
///
/// Mapping from the backing download task:
/// `Pending`/`Starting`/`Downloading`/`Stopping` -> `Downloading`,
/// `Paused` -> `Paused`, `Completed` -> `Completed`,
/// `Stopped`/`Error` -> `Error`. `Skipped` is only set by cancelling the playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoStatus {
    /// Not started.
    Pending,
    /// Backing task is queued or running.
    Downloading,
    /// Backing task completed.
    Completed,
    /// Backing task failed or was stopped.
    Error,
    /// Abandoned because the playlist was cancelled.
    Skipped,
    /// Backing task is paused.
    Paused,
}

impl VideoStatus {
    /// Maps a download task status onto the playlist video status.
    #[must_use]
    pub const fn from_task(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending
            | TaskStatus::Starting
            | TaskStatus::Downloading
            | TaskStatus::Stopping => Self::Downloading,
            TaskStatus::Paused => Self::Paused,
            TaskStatus::Completed => Self::Completed,
            TaskStatus::Stopped | TaskStatus::Error => Self::Error,
        }
    }
}

impl std::fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Downloading => write!(f, "downloading"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
            Self::Skipped => write!(f, "skipped"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TaskStatus; 8] = [
        TaskStatus::Pending,
        TaskStatus::Starting,
        TaskStatus::Downloading,
        TaskStatus::Stopping,
        TaskStatus::Paused,
        TaskStatus::Stopped,
        TaskStatus::Completed,
        TaskStatus::Error,
    ];

    #[test]
    fn test_active_and_finished_are_disjoint() {
        for status in ALL {
            assert!(
                !(status.is_active() && status.is_finished()),
                "{status} is both active and finished"
            );
        }
    }

    #[test]
    fn test_active_states() {
        let active: Vec<_> = ALL.into_iter().filter(|s| s.is_active()).collect();
        assert_eq!(
            active,
            vec![
                TaskStatus::Starting,
                TaskStatus::Downloading,
                TaskStatus::Stopping
            ]
        );
    }

    #[test]
    fn test_paused_and_pending_are_neither() {
        assert!(!TaskStatus::Paused.is_active());
        assert!(!TaskStatus::Paused.is_finished());
        assert!(!TaskStatus::Pending.is_active());
        assert!(!TaskStatus::Pending.is_finished());
    }

    #[test]
    fn test_video_status_mapping() {
        assert_eq!(
            VideoStatus::from_task(TaskStatus::Stopping),
            VideoStatus::Downloading
        );
        assert_eq!(VideoStatus::from_task(TaskStatus::Paused), VideoStatus::Paused);
        assert_eq!(VideoStatus::from_task(TaskStatus::Stopped), VideoStatus::Error);
        assert_eq!(
            VideoStatus::from_task(TaskStatus::Completed),
            VideoStatus::Completed
        );
    }

    #[test]
    fn test_playlist_status_serde() {
        let json = serde_json::to_string(&PlaylistStatus::Downloading).expect("serialize");
        assert_eq!(json, "\"downloading\"");
        let back: VideoStatus = serde_json::from_str("\"skipped\"").expect("deserialize");
        assert_eq!(back, VideoStatus::Skipped);
    }
}
