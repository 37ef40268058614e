//! File helpers for download output.
//!
//! - Default download directory resolution
//! - Filename sanitizing for engines that name files themselves
//! - Locating the file a download produced when the engine did not report it

use std::fs;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{FileSystemError, Result};

/// Extensions left behind by interrupted downloads.
const PARTIAL_EXTENSIONS: [&str; 4] = ["part", "ytdl", "tmp", "temp"];

/// Returns the user's download directory, falling back to `~/Downloads`
/// and finally to the current directory.
#[must_use]
pub fn default_download_directory() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Creates `dir` and its parents if missing.
pub fn ensure_directory(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| {
        FileSystemError::CreateDirFailed {
            path: dir.to_path_buf(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Sanitize a string for use as a filename.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let invalid_chars = ['/', '\\', ':', '*', '?', '"', '<', '>', '|', '\0'];

    let sanitized: String = name
        .chars()
        .map(|c| if invalid_chars.contains(&c) { '_' } else { c })
        .collect();

    let trimmed = sanitized.trim().trim_matches('.');

    // Leave room for the extension.
    trimmed.chars().take(200).collect()
}

/// Size of the file at `path`, or `None` if it does not exist.
#[must_use]
pub fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
}

/// Makes `path` absolute relative to the current directory.
#[must_use]
pub fn absolutize(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn is_partial(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| PARTIAL_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// Finds the newest finished file in `dir` whose name contains the video id
/// or the sanitized title.
#[must_use]
pub fn locate_downloaded_file(dir: &Path, video_id: &str, title: &str) -> Option<PathBuf> {
    let title = sanitize_filename(title);
    let mut best: Option<(FileTime, PathBuf)> = None;

    for entry in WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        if is_partial(path) {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let matches = (!video_id.is_empty() && name.contains(video_id))
            || (!title.is_empty() && name.contains(&title));
        if !matches {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let modified = FileTime::from_last_modification_time(&metadata);
        if best.as_ref().is_none_or(|(time, _)| modified > *time) {
            best = Some((modified, path.to_path_buf()));
        }
    }

    if let Some((_, path)) = &best {
        debug!("Located downloaded file for {}: {}", video_id, path.display());
    }
    best.map(|(_, path)| path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a/b:c*d?"), "a_b_c_d_");
        assert_eq!(sanitize_filename("  .hidden. "), "hidden");
        assert_eq!(sanitize_filename(&"x".repeat(300)).len(), 200);
    }

    #[test]
    fn test_file_size() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("video.mp4");
        assert_eq!(file_size(&path), None);
        fs::write(&path, b"12345").expect("write");
        assert_eq!(file_size(&path), Some(5));
        assert_eq!(file_size(temp.path()), None);
    }

    #[test]
    fn test_ensure_directory() {
        let temp = TempDir::new().expect("temp dir");
        let nested = temp.path().join("a").join("b");
        ensure_directory(&nested).expect("create");
        assert!(nested.is_dir());
    }

    #[test]
    fn test_locate_prefers_newest_and_skips_partials() {
        let temp = TempDir::new().expect("temp dir");
        let older = temp.path().join("Song dQw4w9WgXcQ.webm");
        let newer = temp.path().join("Song dQw4w9WgXcQ.mp4");
        let partial = temp.path().join("Song dQw4w9WgXcQ.mp4.part");
        fs::write(&older, b"a").expect("write");
        fs::write(&newer, b"b").expect("write");
        fs::write(&partial, b"c").expect("write");
        filetime::set_file_mtime(&older, FileTime::from_unix_time(1_000, 0)).expect("mtime");
        filetime::set_file_mtime(&newer, FileTime::from_unix_time(2_000, 0)).expect("mtime");
        filetime::set_file_mtime(&partial, FileTime::from_unix_time(3_000, 0)).expect("mtime");

        let found = locate_downloaded_file(temp.path(), "dQw4w9WgXcQ", "");
        assert_eq!(found, Some(newer));
    }

    #[test]
    fn test_locate_by_title() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("My_Video.mp4");
        fs::write(&path, b"a").expect("write");

        assert_eq!(
            locate_downloaded_file(temp.path(), "zzzzzzzzzzz", "My/Video"),
            Some(path)
        );
        assert_eq!(locate_downloaded_file(temp.path(), "nothing", ""), None);
    }
}
