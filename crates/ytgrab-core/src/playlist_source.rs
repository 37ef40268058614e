//! Playlist metadata retrieval.
//!
//! [`YtDlpPlaylistSource`] runs `yt-dlp --flat-playlist --dump-json`, which
//! prints one JSON object per entry without resolving any media.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{PlaylistError, Result};
use crate::format::format_duration_label;
use crate::playlist::{Playlist, PlaylistVideo};
use crate::status::PlaylistStatus;
use crate::video_id::youtube_watch_url;

/// Default time allowed for a metadata fetch.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 60;

/// Minimum common title prefix used as the playlist title.
const MIN_TITLE_PREFIX: usize = 10;

/// Source of playlist metadata.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlaylistSource: Send + Sync {
    /// Fetches the playlist behind `url`, with every video `Pending` and the
    /// playlist `Ready`.
    async fn fetch_playlist(&self, url: &str) -> Result<Playlist>;
}

/// Extracts the playlist id (the `list=` parameter) from a URL.
#[must_use]
pub fn extract_playlist_id(url: &str) -> Option<String> {
    let start = url.find("list=")? + "list=".len();
    let rest = &url[start..];
    let end = rest.find(['&', '#']).unwrap_or(rest.len());
    let id = &rest[..end];
    (!id.is_empty()).then(|| id.to_string())
}

#[derive(Debug, Deserialize)]
struct FlatEntry {
    id: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    duration_string: Option<String>,
}

/// Parses `--dump-json` output into videos, skipping unusable lines.
#[must_use]
pub fn parse_playlist_json_lines(output: &str) -> Vec<PlaylistVideo> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<FlatEntry>(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("Skipping unparsable playlist line: {}", e);
                None
            }
        })
        .filter_map(|entry| {
            let id = entry.id.filter(|id| !id.is_empty())?;
            let title = entry.title.filter(|t| !t.is_empty())?;
            let duration = entry
                .duration_string
                .filter(|d| !d.is_empty())
                .or_else(|| {
                    entry
                        .duration
                        .filter(|d| *d > 0.0)
                        .map(|d| format_duration_label(d as u64))
                })
                .unwrap_or_else(|| "Unknown".to_string());
            let url = youtube_watch_url(&id);
            Some(PlaylistVideo::new(id, title, duration, url))
        })
        .collect()
}

/// Derives a playlist title from its video titles.
#[must_use]
pub fn derive_playlist_title(titles: &[&str]) -> String {
    let Some(first) = titles.first() else {
        return "Unknown Playlist".to_string();
    };

    let prefix = titles.iter().skip(1).fold(first.to_string(), |prefix, title| {
        prefix
            .chars()
            .zip(title.chars())
            .take_while(|(a, b)| a == b)
            .map(|(a, _)| a)
            .collect()
    });
    let prefix = prefix.trim();

    if titles.len() > 1 && prefix.chars().count() > MIN_TITLE_PREFIX {
        format!("{prefix} Playlist")
    } else {
        format!("{first} Playlist")
    }
}

/// Builds a `Ready` playlist from fetched videos.
fn assemble_playlist(id: String, url: &str, videos: Vec<PlaylistVideo>) -> Playlist {
    let titles: Vec<&str> = videos.iter().map(|v| v.title.as_str()).collect();
    let title = derive_playlist_title(&titles);
    let mut playlist = Playlist::new(id, title, url);
    for video in videos {
        playlist.add_video(video);
    }
    playlist.update_status(PlaylistStatus::Ready, None);
    playlist
}

/// Playlist source backed by the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlpPlaylistSource {
    program: PathBuf,
    timeout: Duration,
}

impl Default for YtDlpPlaylistSource {
    fn default() -> Self {
        Self::new()
    }
}

impl YtDlpPlaylistSource {
    /// Uses `yt-dlp` from `PATH` with the default timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("yt-dlp"),
            timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
        }
    }

    /// Uses an explicit executable.
    #[must_use]
    pub fn with_program(mut self, program: PathBuf) -> Self {
        self.program = program;
        self
    }

    /// Sets the fetch timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl PlaylistSource for YtDlpPlaylistSource {
    async fn fetch_playlist(&self, url: &str) -> Result<Playlist> {
        let id = extract_playlist_id(url).ok_or_else(|| PlaylistError::InvalidUrl {
            url: url.to_string(),
        })?;
        info!("Fetching playlist {} from {}", id, url);

        let command = Command::new(&self.program)
            .args(["--flat-playlist", "--dump-json", "--no-warnings", url])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, command)
            .await
            .map_err(|_| PlaylistError::Timeout {
                url: url.to_string(),
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|e| PlaylistError::FetchFailed {
                url: url.to_string(),
                reason: format!("failed to start {}: {e}", self.program.display()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|l| l.starts_with("ERROR:"))
                .unwrap_or_else(|| stderr.trim())
                .to_string();
            warn!("Playlist fetch failed for {}: {}", url, reason);
            return Err(PlaylistError::FetchFailed {
                url: url.to_string(),
                reason,
            }
            .into());
        }

        let videos = parse_playlist_json_lines(&String::from_utf8_lossy(&output.stdout));
        if videos.is_empty() {
            return Err(PlaylistError::FetchFailed {
                url: url.to_string(),
                reason: "playlist contains no videos".to_string(),
            }
            .into());
        }

        let playlist = assemble_playlist(id, url, videos);
        info!(
            "Fetched playlist '{}' with {} videos",
            playlist.title, playlist.total_videos
        );
        Ok(playlist)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::VideoStatus;

    #[test]
    fn test_extract_playlist_id() {
        assert_eq!(
            extract_playlist_id("https://www.youtube.com/playlist?list=PLabc123&index=2"),
            Some("PLabc123".to_string())
        );
        assert_eq!(
            extract_playlist_id("https://youtube.com/watch?v=x&list=PLxyz#t=1"),
            Some("PLxyz".to_string())
        );
        assert_eq!(extract_playlist_id("https://youtube.com/watch?v=x"), None);
        assert_eq!(extract_playlist_id("https://youtube.com/playlist?list="), None);
    }

    #[test]
    fn test_parse_playlist_json_lines() {
        let output = r#"
{"id": "aaaaaaaaaaa", "title": "First", "duration": 245.0}
not json
{"id": "bbbbbbbbbbb", "title": "Second", "duration_string": "1:02:03"}
{"id": "ccccccccccc"}
{"id": "ddddddddddd", "title": "Fourth"}
"#;
        let videos = parse_playlist_json_lines(output);
        assert_eq!(videos.len(), 3);
        assert_eq!(videos[0].duration, "4:05");
        assert_eq!(videos[0].url, "https://www.youtube.com/watch?v=aaaaaaaaaaa");
        assert_eq!(videos[1].duration, "1:02:03");
        assert_eq!(videos[2].duration, "Unknown");
        assert!(videos.iter().all(|v| v.status == VideoStatus::Pending));
    }

    #[test]
    fn test_derive_playlist_title() {
        assert_eq!(
            derive_playlist_title(&["Rust Tutorial Part 1", "Rust Tutorial Part 2"]),
            "Rust Tutorial Part Playlist"
        );
        assert_eq!(derive_playlist_title(&["Intro", "Outro"]), "Intro Playlist");
        assert_eq!(derive_playlist_title(&["Solo"]), "Solo Playlist");
        assert_eq!(derive_playlist_title(&[]), "Unknown Playlist");
    }

    #[test]
    fn test_assemble_playlist_is_ready() {
        let videos = parse_playlist_json_lines(r#"{"id": "aaaaaaaaaaa", "title": "Only"}"#);
        let playlist = assemble_playlist("PL1".to_string(), "https://x/?list=PL1", videos);
        assert_eq!(playlist.status, PlaylistStatus::Ready);
        assert_eq!(playlist.total_videos, 1);
        assert!(playlist.is_ready_for_download());
    }

    #[tokio::test]
    async fn test_fetch_rejects_non_playlist_url() {
        let source = YtDlpPlaylistSource::new();
        let err = source
            .fetch_playlist("https://www.youtube.com/watch?v=aaaaaaaaaaa")
            .await
            .expect_err("not a playlist");
        assert!(matches!(
            err,
            crate::Error::Playlist(PlaylistError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_missing_program() {
        let source = YtDlpPlaylistSource::new()
            .with_program(PathBuf::from("/nonexistent/ytgrab-test-yt-dlp"));
        let err = source
            .fetch_playlist("https://www.youtube.com/playlist?list=PL1")
            .await
            .expect_err("missing program");
        assert!(matches!(
            err,
            crate::Error::Playlist(PlaylistError::FetchFailed { .. })
        ));
    }
}
