//! Translation of raw engine failures into short user-facing messages.

/// Known failure categories reported by the download engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    /// Video requires age verification.
    AgeRestricted,
    /// Video is private.
    Private,
    /// Video is not available in the user's region.
    GeoBlocked,
    /// Video was deleted or is otherwise unavailable.
    Unavailable,
    /// Video is blocked by a copyright claim.
    Copyright,
    /// Network failure or timeout.
    Network,
    /// Video requires signing in.
    SignInRequired,
}

impl FailureCategory {
    /// Classifies a raw engine message. Matching is case-insensitive and
    /// ordered so that the most specific category wins.
    #[must_use]
    pub fn classify(raw: &str) -> Option<Self> {
        let msg = raw.to_lowercase();
        let has = |needle: &str| msg.contains(needle);

        if has("confirm your age") || (has("age") && has("restrict")) {
            Some(Self::AgeRestricted)
        } else if has("private video") || has("video is private") {
            Some(Self::Private)
        } else if (has("geo") && has("block")) || has("in your country") {
            Some(Self::GeoBlocked)
        } else if has("copyright") {
            Some(Self::Copyright)
        } else if has("deleted") || has("unavailable") || has("has been removed") {
            Some(Self::Unavailable)
        } else if has("blocked") {
            Some(Self::Copyright)
        } else if has("timed out")
            || has("timeout")
            || has("network")
            || has("connection")
            || has("unable to download webpage")
        {
            Some(Self::Network)
        } else if has("sign in") || has("login") || has("log in") || has("authentication") {
            Some(Self::SignInRequired)
        } else {
            None
        }
    }

    /// Fixed sentence shown to the user for this category.
    #[must_use]
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::AgeRestricted => {
                "This video is age-restricted and cannot be downloaded without signing in."
            }
            Self::Private => "This video is private.",
            Self::GeoBlocked => "This video is not available in your region.",
            Self::Unavailable => "This video has been removed or is unavailable.",
            Self::Copyright => "This video is blocked due to a copyright claim.",
            Self::Network => "Network error. Check your connection and try again.",
            Self::SignInRequired => "This video requires signing in.",
        }
    }
}

/// Returns the user-facing message for a raw engine failure, or the raw
/// message trimmed when no category matches.
#[must_use]
pub fn sanitize_engine_error(raw: &str) -> String {
    FailureCategory::classify(raw).map_or_else(
        || raw.trim().to_string(),
        |category| category.user_message().to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_age_restriction_wins_over_sign_in() {
        let raw = "ERROR: [youtube] abc: Sign in to confirm your age. This video may be inappropriate";
        assert_eq!(
            FailureCategory::classify(raw),
            Some(FailureCategory::AgeRestricted)
        );
    }

    #[test]
    fn test_categories() {
        let cases = [
            ("ERROR: Private video. Sign in if you've been granted access", FailureCategory::Private),
            ("The uploader has not made this video available in your country", FailureCategory::GeoBlocked),
            ("Video unavailable. This video has been removed by the uploader", FailureCategory::Unavailable),
            ("This video contains content from X, who has blocked it on copyright grounds", FailureCategory::Copyright),
            ("Unable to download webpage: <urlopen error timed out>", FailureCategory::Network),
            ("Sign in to view this video", FailureCategory::SignInRequired),
        ];
        for (raw, expected) in cases {
            assert_eq!(FailureCategory::classify(raw), Some(expected), "{raw}");
        }
    }

    #[test]
    fn test_unmatched_passes_through() {
        assert_eq!(
            sanitize_engine_error("  ffmpeg exited with code 1 \n"),
            "ffmpeg exited with code 1"
        );
    }

    #[test]
    fn test_sanitized_message() {
        assert_eq!(
            sanitize_engine_error("ERROR: Private video"),
            "This video is private."
        );
    }
}
