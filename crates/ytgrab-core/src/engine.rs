//! Download engine abstraction and the yt-dlp subprocess engine.
//!
//! An engine takes one URL and writes one file. It reports raw byte counts
//! through a [`ProgressCallback`] and stops promptly when its
//! [`CancellationToken`] fires. Scheduling, smoothing and status bookkeeping
//! all live in [`crate::download`].

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::QualityPreset;
use crate::error::EngineError;

/// Default number of retries after a failed engine invocation.
pub const DEFAULT_MAX_RETRIES: u32 = 1;

/// Default pause between attempts in milliseconds.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 2000;

/// Number of stderr lines kept for error reporting.
const STDERR_TAIL_LINES: usize = 20;

/// Marker prefixes printed by yt-dlp through our templates.
const PROGRESS_MARKER: &str = "ytgrab-progress";
const TITLE_MARKER: &str = "ytgrab-title";
const DURATION_MARKER: &str = "ytgrab-duration";
const FILE_MARKER: &str = "ytgrab-file";
const DEST_MARKER: &str = "ytgrab-dest";

/// What to download and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Source URL.
    pub url: String,
    /// Canonical video id of the URL.
    pub video_id: String,
    /// Directory to write into.
    pub output_dir: PathBuf,
    /// yt-dlp output template relative to `output_dir`.
    pub filename_template: String,
    /// Quality preset.
    pub quality: QualityPreset,
}

/// One raw progress observation from an engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSample {
    /// Bytes written so far.
    pub downloaded_bytes: u64,
    /// Expected total, zero when unknown.
    pub total_bytes: u64,
    /// Title, once the engine knows it.
    pub title: Option<String>,
    /// Human readable duration, once known.
    pub duration_label: Option<String>,
    /// Destination file, once known.
    pub output_path: Option<PathBuf>,
}

/// Result of a successful engine invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOutput {
    /// Final file, if the engine reported it.
    pub output_path: Option<PathBuf>,
    /// Title, if the engine reported it.
    pub title: Option<String>,
    /// Human readable duration.
    pub duration_label: Option<String>,
}

/// Receives raw progress samples. Called from the engine's task.
pub type ProgressCallback = Arc<dyn Fn(ProgressSample) + Send + Sync>;

/// A media extraction backend.
#[async_trait]
pub trait DownloadEngine: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Downloads `request.url`. Must return [`EngineError::Cancelled`] (or
    /// any error) promptly once `cancel` fires.
    async fn download(
        &self,
        request: &DownloadRequest,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<EngineOutput, EngineError>;
}

/// Retry behavior around an engine invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Fixed pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

/// Runs the engine, retrying failures per `policy`.
///
/// Cancellation is never retried, and cancelling during the backoff returns
/// [`EngineError::Cancelled`] immediately.
pub async fn download_with_retry(
    engine: &dyn DownloadEngine,
    request: &DownloadRequest,
    progress: ProgressCallback,
    cancel: &CancellationToken,
    policy: RetryPolicy,
) -> Result<EngineOutput, EngineError> {
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match engine
            .download(request, Arc::clone(&progress), cancel.clone())
            .await
        {
            Ok(output) => return Ok(output),
            Err(e) if cancel.is_cancelled() => {
                debug!("{} stopped for {}: {}", engine.name(), request.url, e);
                return Err(EngineError::Cancelled);
            }
            Err(e) if attempt < policy.max_retries => {
                attempt += 1;
                warn!(
                    "{} failed for {} (attempt {}/{}): {}",
                    engine.name(),
                    request.url,
                    attempt,
                    policy.max_retries + 1,
                    e
                );
                tokio::select! {
                    () = cancel.cancelled() => return Err(EngineError::Cancelled),
                    () = tokio::time::sleep(policy.backoff) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// One parsed line of yt-dlp output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum YtDlpLine {
    /// Progress counters.
    Progress {
        /// Bytes written so far.
        downloaded: u64,
        /// Total or estimated total, zero when unknown.
        total: u64,
        /// File being written, if yt-dlp reported one.
        file: Option<PathBuf>,
    },
    /// Planned output file, printed before the download starts.
    Destination(PathBuf),
    /// Video title.
    Title(String),
    /// Duration label.
    Duration(String),
    /// Final file path.
    File(PathBuf),
}

fn parse_path(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    (!value.is_empty() && value != "NA").then(|| PathBuf::from(value))
}

fn parse_count(value: &str) -> Option<u64> {
    let value = value.trim();
    value
        .parse::<u64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().map(|v| v.max(0.0) as u64))
}

/// Parses a line produced by the templates in [`YtDlpEngine::build_args`].
#[must_use]
pub fn parse_ytdlp_line(line: &str) -> Option<YtDlpLine> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (marker, rest) = line.split_once(' ')?;
    match marker {
        PROGRESS_MARKER => {
            // The file name comes last and may contain spaces.
            let mut fields = rest.splitn(4, ' ');
            let downloaded = parse_count(fields.next()?)?;
            let total = fields.next().and_then(parse_count);
            let estimate = fields.next().and_then(parse_count);
            Some(YtDlpLine::Progress {
                downloaded,
                total: total.or(estimate).unwrap_or(0),
                file: fields.next().and_then(parse_path),
            })
        }
        DEST_MARKER => parse_path(rest).map(YtDlpLine::Destination),
        TITLE_MARKER if !rest.trim().is_empty() && rest.trim() != "NA" => {
            Some(YtDlpLine::Title(rest.trim().to_string()))
        }
        DURATION_MARKER if !rest.trim().is_empty() && rest.trim() != "NA" => {
            Some(YtDlpLine::Duration(rest.trim().to_string()))
        }
        FILE_MARKER if !rest.trim().is_empty() => Some(YtDlpLine::File(PathBuf::from(rest.trim()))),
        _ => None,
    }
}

/// Picks the most useful message out of yt-dlp's stderr.
fn summarize_stderr(lines: &[String], status: std::process::ExitStatus) -> String {
    lines
        .iter()
        .rev()
        .find(|l| l.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .map_or_else(|| format!("yt-dlp exited with {status}"), Clone::clone)
}

/// Engine that drives the `yt-dlp` executable.
#[derive(Debug, Clone)]
pub struct YtDlpEngine {
    program: PathBuf,
}

impl Default for YtDlpEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl YtDlpEngine {
    /// Uses `yt-dlp` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("yt-dlp"),
        }
    }

    /// Uses an explicit executable.
    #[must_use]
    pub const fn with_program(program: PathBuf) -> Self {
        Self { program }
    }

    /// Command line arguments for one download.
    #[must_use]
    pub fn build_args(request: &DownloadRequest) -> Vec<String> {
        let output = request.output_dir.join(&request.filename_template);
        vec![
            "--newline".to_string(),
            "--progress".to_string(),
            "--continue".to_string(),
            "--no-overwrites".to_string(),
            "--no-check-certificates".to_string(),
            "--no-playlist".to_string(),
            "--no-simulate".to_string(),
            "-f".to_string(),
            request.quality.format_selector().to_string(),
            "-o".to_string(),
            output.to_string_lossy().into_owned(),
            "--progress-template".to_string(),
            format!(
                "download:{PROGRESS_MARKER} %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s %(progress.filename)s"
            ),
            "--print".to_string(),
            format!("before_dl:{DEST_MARKER} %(filename)s"),
            "--print".to_string(),
            format!("before_dl:{TITLE_MARKER} %(title)s"),
            "--print".to_string(),
            format!("before_dl:{DURATION_MARKER} %(duration_string)s"),
            "--print".to_string(),
            format!("after_move:{FILE_MARKER} %(filepath)s"),
            request.url.clone(),
        ]
    }
}

#[async_trait]
impl DownloadEngine for YtDlpEngine {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<EngineOutput, EngineError> {
        info!("Starting yt-dlp for {}", request.url);

        let mut child = Command::new(&self.program)
            .args(Self::build_args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Spawn {
                program: self.program.display().to_string(),
                reason: e.to_string(),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Failed("yt-dlp stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Failed("yt-dlp stderr unavailable".to_string()))?;

        let stdout_reader = tokio::spawn(async move {
            let mut output = EngineOutput::default();
            let mut destination: Option<PathBuf> = None;
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match parse_ytdlp_line(&line) {
                    Some(YtDlpLine::Progress {
                        downloaded,
                        total,
                        file,
                    }) => progress(ProgressSample {
                        downloaded_bytes: downloaded,
                        total_bytes: total,
                        title: output.title.clone(),
                        duration_label: output.duration_label.clone(),
                        output_path: file.or_else(|| destination.clone()),
                    }),
                    Some(YtDlpLine::Destination(path)) => destination = Some(path),
                    Some(YtDlpLine::Title(title)) => output.title = Some(title),
                    Some(YtDlpLine::Duration(label)) => output.duration_label = Some(label),
                    Some(YtDlpLine::File(path)) => output.output_path = Some(path),
                    None => {}
                }
            }
            output
        });

        let stderr_reader = tokio::spawn(async move {
            let mut tail: Vec<String> = Vec::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.remove(0);
                }
                tail.push(line);
            }
            tail
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            () = cancel.cancelled() => {
                debug!("Killing yt-dlp for {}", request.url);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill yt-dlp for {}: {}", request.url, e);
                }
                stdout_reader.abort();
                stderr_reader.abort();
                return Err(EngineError::Cancelled);
            }
        };

        let output = stdout_reader.await.unwrap_or_default();
        let stderr_tail = stderr_reader.await.unwrap_or_default();

        if status.success() {
            info!("yt-dlp finished {}", request.url);
            Ok(output)
        } else {
            Err(EngineError::Failed(summarize_stderr(&stderr_tail, status)))
        }
    }
}
