//! Canonical video id extraction from URLs.
//!
//! The id is used to correlate a playlist video with its download task and to
//! name output files when the engine does not report one. Supported shapes:
//! - `https://www.youtube.com/watch?v=<11 chars>`
//! - `https://youtu.be/<11 chars>`
//! - `https://www.youtube.com/shorts/<11 chars>`
//! - `https://vimeo.com/<digits>` (prefixed with `vimeo_`)
//!
//! Anything else gets a stable pseudo-id derived from a SHA-256 of the URL.

use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

#[allow(clippy::expect_used)]
static YOUTUBE_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:[?&]v=|youtu\.be/|/shorts/)([A-Za-z0-9_-]{11})")
        .expect("YouTube id pattern is valid")
});

#[allow(clippy::expect_used)]
static VIMEO_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"vimeo\.com/(?:video/)?(\d+)").expect("Vimeo id pattern is valid")
});

/// Extracts the canonical id for a video URL.
#[must_use]
pub fn extract_video_id(url: &str) -> String {
    if let Some(caps) = YOUTUBE_ID_RE.captures(url) {
        return caps[1].to_string();
    }
    if let Some(caps) = VIMEO_ID_RE.captures(url) {
        return format!("vimeo_{}", &caps[1]);
    }
    fallback_video_id(url)
}

/// Returns true if the URL has a recognized video shape.
#[must_use]
pub fn is_recognized_video_url(url: &str) -> bool {
    YOUTUBE_ID_RE.is_match(url) || VIMEO_ID_RE.is_match(url)
}

fn fallback_video_id(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let hex: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("video_{hex}")
}

/// Builds the canonical watch URL for a YouTube video id.
#[must_use]
pub fn youtube_watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}
