//! Command line definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use ytgrab_core::{AppConfig, QualityPreset};

/// Download videos and playlists, compress media files.
#[derive(Debug, Parser)]
#[command(name = "ytgrab", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Download directory (overrides the config file).
    #[arg(long, global = true, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    /// Maximum concurrent downloads, 1 to 10.
    #[arg(short = 'j', long, global = true, value_name = "N")]
    pub parallel: Option<usize>,

    /// Quality preset: best, medium or audio.
    #[arg(short, long, global = true)]
    pub quality: Option<QualityPreset>,

    /// Download engine.
    #[arg(long, global = true, value_enum, default_value_t = EngineKind::YtDlp)]
    pub engine: EngineKind,

    /// Reveal finished files in the file manager.
    #[arg(long, global = true)]
    pub reveal: bool,

    /// Never reveal finished files, even if the config asks for it.
    #[arg(long, global = true, conflicts_with = "reveal")]
    pub no_reveal: bool,

    /// Print task snapshots as JSON lines.
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose console logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download one or more URLs.
    Download {
        /// Video URLs.
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Download every video of a playlist.
    Playlist {
        /// Playlist URL (must contain `list=`).
        url: String,
    },
    /// Compress local media files into `<name>-compressed.mp4`.
    Compress {
        /// Input files.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

/// Download backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    /// The yt-dlp executable.
    #[value(name = "yt-dlp")]
    YtDlp,
    /// Built-in engine, YouTube only.
    Native,
}

impl Cli {
    /// Applies command line overrides on top of the loaded configuration.
    pub fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(dir) = &self.dir {
            config.download_directory.clone_from(dir);
        }
        if let Some(parallel) = self.parallel {
            config.download.max_parallel_downloads = parallel;
        }
        if let Some(quality) = self.quality {
            config.download.quality = quality;
        }
        config.validate();
    }

    /// Whether finished files should be revealed.
    pub const fn reveal_enabled(&self, config: &AppConfig) -> bool {
        !self.no_reveal && (self.reveal || config.auto_reveal_on_complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_download_with_overrides() {
        let cli = Cli::try_parse_from([
            "ytgrab",
            "download",
            "https://youtu.be/aaaaaaaaaaa",
            "https://youtu.be/bbbbbbbbbbb",
            "-j",
            "15",
            "--quality",
            "audio",
            "--dir",
            "/tmp/videos",
        ])
        .expect("Should parse");

        let Command::Download { urls } = &cli.command else {
            panic!("expected download command");
        };
        assert_eq!(urls.len(), 2);
        assert_eq!(cli.engine, EngineKind::YtDlp);

        let mut config = AppConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config.download.max_parallel_downloads, 10);
        assert_eq!(config.download.quality, QualityPreset::Audio);
        assert_eq!(config.download_directory, PathBuf::from("/tmp/videos"));
    }

    #[test]
    fn test_parse_engine_and_flags() {
        let cli = Cli::try_parse_from([
            "ytgrab",
            "--engine",
            "native",
            "--json",
            "playlist",
            "https://www.youtube.com/playlist?list=PL1",
        ])
        .expect("Should parse");
        assert_eq!(cli.engine, EngineKind::Native);
        assert!(cli.json);
        assert!(matches!(cli.command, Command::Playlist { .. }));
    }

    #[test]
    fn test_download_requires_url() {
        assert!(Cli::try_parse_from(["ytgrab", "download"]).is_err());
        assert!(Cli::try_parse_from(["ytgrab", "--quality", "ultra", "compress", "a.mkv"]).is_err());
    }

    #[test]
    fn test_reveal_enabled() {
        let cli = Cli::try_parse_from(["ytgrab", "compress", "a.mkv"]).expect("Should parse");
        let mut config = AppConfig::default();
        config.auto_reveal_on_complete = false;
        assert!(!cli.reveal_enabled(&config));
        config.auto_reveal_on_complete = true;
        assert!(cli.reveal_enabled(&config));

        let quiet = Cli::try_parse_from(["ytgrab", "--no-reveal", "compress", "a.mkv"])
            .expect("Should parse");
        assert!(!quiet.reveal_enabled(&config));

        let loud = Cli::try_parse_from(["ytgrab", "--reveal", "compress", "a.mkv"])
            .expect("Should parse");
        assert!(loud.reveal_enabled(&AppConfig::default()));

        assert!(Cli::try_parse_from(["ytgrab", "--reveal", "--no-reveal", "compress", "a.mkv"]).is_err());
    }
}
