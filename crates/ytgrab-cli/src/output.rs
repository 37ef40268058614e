//! Rendering of task snapshots.

use ytgrab_core::{
    CompressionTask, DownloadTask, Playlist, TaskStatus, format_file_size,
};

/// Output style for task updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// One human-readable line per update.
    Text,
    /// One JSON object per update.
    Json,
}

impl OutputMode {
    /// Renders a download update.
    pub fn download(self, task: &DownloadTask) -> String {
        match self {
            Self::Text => download_line(task),
            Self::Json => serde_json::to_string(task).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}")),
        }
    }

    /// Renders a compression update.
    pub fn compression(self, task: &CompressionTask) -> String {
        match self {
            Self::Text => compression_line(task),
            Self::Json => serde_json::to_string(task).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}")),
        }
    }
}

/// `[Downloading] 42% 1.8MB/s ETA 00:12 Title`
pub fn download_line(task: &DownloadTask) -> String {
    let name = task.display_title();
    match task.status {
        TaskStatus::Downloading => {
            let mut line = format!("[{}] {:>3}%", task.status, task.percent);
            if !task.speed.is_empty() {
                line.push(' ');
                line.push_str(&task.speed);
            }
            line.push_str(&format!(" ETA {} {name}", task.eta_label()));
            line
        }
        TaskStatus::Completed => {
            let path = task
                .output_path
                .as_ref()
                .map_or_else(String::new, |p| format!(" -> {}", p.display()));
            format!(
                "[{}] {name} ({}){path}",
                task.status,
                format_file_size(task.file_size)
            )
        }
        TaskStatus::Error => format!(
            "[{}] {name}: {}",
            task.status,
            task.last_error.as_deref().unwrap_or("unknown error")
        ),
        TaskStatus::Pending
        | TaskStatus::Starting
        | TaskStatus::Stopping
        | TaskStatus::Paused
        | TaskStatus::Stopped => format!("[{}] {name}", task.status),
    }
}

/// `[Downloading]  37% clip.mkv`
pub fn compression_line(task: &CompressionTask) -> String {
    let name = task.display_name();
    match task.status {
        TaskStatus::Downloading => format!("[Compressing] {:>3}% {name}", task.percent),
        TaskStatus::Completed => format!("[{}] {name} -> {}", task.status, task.output_path.display()),
        TaskStatus::Error => format!(
            "[{}] {name}: {}",
            task.status,
            task.last_error.as_deref().unwrap_or("unknown error")
        ),
        TaskStatus::Pending
        | TaskStatus::Starting
        | TaskStatus::Stopping
        | TaskStatus::Paused
        | TaskStatus::Stopped => format!("[{}] {name}", task.status),
    }
}

/// Final summary of a playlist.
pub fn playlist_summary(playlist: &Playlist) -> String {
    let failed = playlist
        .videos
        .iter()
        .filter(|v| v.error.is_some())
        .count();
    format!(
        "Playlist '{}' {}: {}/{} downloaded, {} failed",
        playlist.title, playlist.status, playlist.downloaded, playlist.total_videos, failed
    )
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_download_line_progress() {
        let mut task = DownloadTask::new("https://youtu.be/aaaaaaaaaaa");
        task.status = TaskStatus::Downloading;
        task.percent = 42;
        task.speed = "1.8MB/s".to_string();
        task.eta_secs = 12;
        task.title = "Song".to_string();
        assert_eq!(download_line(&task), "[Downloading]  42% 1.8MB/s ETA 00:12 Song");
    }

    #[test]
    fn test_download_line_error_uses_url_without_title() {
        let mut task = DownloadTask::new("https://youtu.be/aaaaaaaaaaa");
        task.status = TaskStatus::Error;
        task.last_error = Some("This video is private.".to_string());
        assert_eq!(
            download_line(&task),
            "[Error] https://youtu.be/aaaaaaaaaaa: This video is private."
        );
    }

    #[test]
    fn test_compression_line() {
        let mut task = CompressionTask::new(
            PathBuf::from("/v/clip.mkv"),
            PathBuf::from("/v/clip-compressed.mp4"),
        );
        task.status = TaskStatus::Downloading;
        task.percent = 37;
        assert_eq!(compression_line(&task), "[Compressing]  37% clip.mkv");
    }

    #[test]
    fn test_json_mode() {
        let task = DownloadTask::new("https://youtu.be/aaaaaaaaaaa");
        let line = OutputMode::Json.download(&task);
        let value: serde_json::Value = serde_json::from_str(&line).expect("Should be JSON");
        assert_eq!(value["url"], "https://youtu.be/aaaaaaaaaaa");
        assert_eq!(value["status"], "Pending");
    }
}
