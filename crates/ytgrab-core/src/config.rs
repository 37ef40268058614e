//! Application configuration management.
//!
//! Handles loading, saving, and managing application-wide settings:
//! - Download directory and quality preset
//! - Scheduler parallelism and smoothing window
//! - Playlist chunking and compression tool paths

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::compress::CompressionConfig;
use crate::coordinator::PlaylistConfig;
use crate::download::DownloadConfig;
use crate::error::{Error, FileSystemError, Result};
use crate::files::default_download_directory;

/// Quality preset for downloads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    /// Best available video and audio.
    Best,
    /// Single-file mp4/webm, the default.
    #[default]
    Medium,
    /// Audio only.
    Audio,
}

impl QualityPreset {
    /// Format selector passed to yt-dlp.
    #[must_use]
    pub const fn format_selector(self) -> &'static str {
        match self {
            Self::Best => "bestvideo+bestaudio/best",
            Self::Medium => "best[ext=mp4]/best[ext=webm]/best",
            Self::Audio => "bestaudio/best",
        }
    }

    /// All presets in display order.
    #[must_use]
    pub const fn all() -> [Self; 3] {
        [Self::Best, Self::Medium, Self::Audio]
    }
}

impl std::fmt::Display for QualityPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Best => write!(f, "best"),
            Self::Medium => write!(f, "medium"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

impl std::str::FromStr for QualityPreset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "best" => Ok(Self::Best),
            "medium" => Ok(Self::Medium),
            "audio" => Ok(Self::Audio),
            other => Err(Error::Configuration(format!(
                "Unknown quality preset: {other}"
            ))),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Directory where downloads are written.
    #[serde(default = "default_download_directory")]
    pub download_directory: PathBuf,
    /// Reveal finished downloads in the file manager.
    #[serde(default)]
    pub auto_reveal_on_complete: bool,
    /// Download scheduler configuration.
    #[serde(default)]
    pub download: DownloadConfig,
    /// Playlist coordinator configuration.
    #[serde(default)]
    pub playlist: PlaylistConfig,
    /// Compression configuration.
    #[serde(default)]
    pub compression: CompressionConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            download_directory: default_download_directory(),
            auto_reveal_on_complete: false,
            download: DownloadConfig::default(),
            playlist: PlaylistConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from disk, or create default if not found.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let config_path = config_file_path();

        if !config_path.exists() {
            debug!("Config file not found, using defaults");
            let config = Self::default();
            if let Err(e) = config.save() {
                warn!("Failed to save default config: {}", e);
            }
            return Ok(config);
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::FileSystem(FileSystemError::ReadFailed {
                path: path.to_path_buf(),
                reason: format!("Failed to read config file: {e}"),
            })
        })?;

        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file: {e}")))?;
        config.validate();

        info!("Loaded config from {}", path.display());
        debug!(
            "Download directory: {}",
            config.download_directory.display()
        );

        Ok(config)
    }

    /// Save configuration to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_file_path())
    }

    /// Save configuration to an explicit path, creating parent directories.
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| {
                Error::FileSystem(FileSystemError::CreateDirFailed {
                    path: parent.to_path_buf(),
                    reason: format!("Failed to create config directory: {e}"),
                })
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(config_path, content).map_err(|e| {
            Error::FileSystem(FileSystemError::WriteFailed {
                path: config_path.to_path_buf(),
                reason: format!("Failed to write config file: {e}"),
            })
        })?;

        info!("Saved config to {}", config_path.display());
        Ok(())
    }

    /// Clamp every section to its valid range.
    pub fn validate(&mut self) {
        self.download.validate();
        self.playlist.validate();
        self.compression.validate();
    }

    /// Get the path to the config file.
    #[must_use]
    pub fn config_file_path() -> PathBuf {
        config_file_path()
    }
}

/// Get the path to the config file.
fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("ytgrab")
        .join("config.json")
}
