//! Compression registry.
//!
//! Re-encodes local media files with ffmpeg into a smaller H.264/AAC mp4 next
//! to the input. Compressions start immediately, without a queue, and report
//! progress as the fraction of the probed duration already encoded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{CompressionError, EngineError, Result};
use crate::status::TaskStatus;
use crate::task::{CompressionTask, TaskId, UpdateCallback};

/// Default time allowed for the duration probe.
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 30;

/// Suffix appended to the input stem.
const OUTPUT_SUFFIX: &str = "-compressed.mp4";

/// Number of stderr lines kept for error reporting.
const STDERR_TAIL_LINES: usize = 20;

/// Receives the number of seconds encoded so far.
pub type EncodeProgress = Arc<dyn Fn(f64) + Send + Sync>;

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

const fn default_probe_timeout_secs() -> u64 {
    DEFAULT_PROBE_TIMEOUT_SECS
}

/// Configuration for compression.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompressionConfig {
    /// ffmpeg executable.
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// ffprobe executable.
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
    /// Time allowed for the duration probe in seconds.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
        }
    }
}

impl CompressionConfig {
    /// Clamp values to their valid ranges.
    pub fn validate(&mut self) {
        if self.ffmpeg_path.as_os_str().is_empty() {
            self.ffmpeg_path = default_ffmpeg_path();
        }
        if self.ffprobe_path.as_os_str().is_empty() {
            self.ffprobe_path = default_ffprobe_path();
        }
        self.probe_timeout_secs = self.probe_timeout_secs.max(1);
    }

    /// Time allowed for the duration probe.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Media encoder backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Duration of `input` in seconds.
    async fn probe_duration(&self, input: &Path) -> std::result::Result<f64, EngineError>;

    /// Encodes `input` into `output`, reporting encoded seconds through
    /// `progress`. Must stop promptly once `cancel` fires.
    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        progress: EncodeProgress,
        cancel: CancellationToken,
    ) -> std::result::Result<(), EngineError>;
}

/// Destination for a compressed copy: `<dir>/<stem>-compressed.mp4`.
#[must_use]
pub fn generate_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map_or_else(String::new, |s| s.to_string_lossy().into_owned());
    input.with_file_name(format!("{stem}{OUTPUT_SUFFIX}"))
}

/// ffmpeg arguments for one compression.
#[must_use]
pub fn build_ffmpeg_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "medium".to_string(),
        "-crf".to_string(),
        "23".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "128k".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        "-progress".to_string(),
        "pipe:2".to_string(),
        "-nostats".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Parses an `out_time_us=` progress line into seconds.
#[must_use]
pub fn parse_progress_line(line: &str) -> Option<f64> {
    let micros = line.trim().strip_prefix("out_time_us=")?;
    let micros = micros.parse::<i64>().ok()?;
    (micros >= 0).then(|| micros as f64 / 1_000_000.0)
}

/// Encoder driving the `ffmpeg` and `ffprobe` executables.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::from_config(&CompressionConfig::default())
    }
}

impl FfmpegEncoder {
    /// Uses the executables named in `config`.
    #[must_use]
    pub fn from_config(config: &CompressionConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            ffprobe: config.ffprobe_path.clone(),
        }
    }
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn probe_duration(&self, input: &Path) -> std::result::Result<f64, EngineError> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "csv=p=0",
            ])
            .arg(input)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::Spawn {
                program: self.ffprobe.display().to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Probe(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let duration = stdout
            .trim()
            .parse::<f64>()
            .map_err(|e| EngineError::Probe(format!("unexpected ffprobe output '{}': {e}", stdout.trim())))?;
        debug!("Probed {}: {:.2}s", input.display(), duration);
        Ok(duration)
    }

    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        progress: EncodeProgress,
        cancel: CancellationToken,
    ) -> std::result::Result<(), EngineError> {
        let mut child = Command::new(&self.ffmpeg)
            .args(build_ffmpeg_args(input, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Spawn {
                program: self.ffmpeg.display().to_string(),
                reason: e.to_string(),
            })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Failed("ffmpeg stderr unavailable".to_string()))?;

        let reader = tokio::spawn(async move {
            let mut tail: Vec<String> = Vec::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(seconds) = parse_progress_line(&line) {
                    progress(seconds);
                } else if !line.contains('=') {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
            }
            tail
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            () = cancel.cancelled() => {
                debug!("Killing ffmpeg for {}", input.display());
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill ffmpeg for {}: {}", input.display(), e);
                }
                reader.abort();
                return Err(EngineError::Cancelled);
            }
        };

        let tail = reader.await.unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            Err(EngineError::Failed(
                tail.last()
                    .cloned()
                    .unwrap_or_else(|| format!("ffmpeg exited with {status}")),
            ))
        }
    }
}

struct Entry {
    task: CompressionTask,
    cancel: Option<CancellationToken>,
}

struct Inner {
    encoder: Arc<dyn Encoder>,
    tasks: RwLock<HashMap<TaskId, Entry>>,
    callback: RwLock<Option<UpdateCallback<CompressionTask>>>,
    probe_timeout: Duration,
}

/// Registry of compression tasks.
///
/// Cheap to clone. [`start_compression`](Self::start_compression) spawns a
/// Tokio task and must be called inside a Tokio runtime.
#[derive(Clone)]
pub struct CompressionService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CompressionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionService")
            .field("tasks", &self.inner.tasks.read().len())
            .field("probe_timeout", &self.inner.probe_timeout)
            .finish_non_exhaustive()
    }
}

impl CompressionService {
    /// Creates a registry using `encoder`.
    #[must_use]
    pub fn new(encoder: Arc<dyn Encoder>, config: &CompressionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                encoder,
                tasks: RwLock::new(HashMap::new()),
                callback: RwLock::new(None),
                probe_timeout: config.probe_timeout(),
            }),
        }
    }

    /// Installs the update callback, replacing any previous one.
    pub fn set_update_callback<F>(&self, callback: F)
    where
        F: Fn(&CompressionTask) + Send + Sync + 'static,
    {
        *self.inner.callback.write() = Some(Arc::new(callback));
    }

    /// Starts compressing `input` into `<stem>-compressed.mp4`.
    pub fn start_compression(&self, input: &Path) -> Result<CompressionTask> {
        let (task, cancel) = {
            let mut tasks = self.inner.tasks.write();
            if tasks
                .values()
                .any(|e| e.task.input_path == input && !e.task.status.is_finished())
            {
                return Err(CompressionError::AlreadyInProgress {
                    path: input.to_path_buf(),
                }
                .into());
            }
            if !input.exists() {
                return Err(CompressionError::InputNotFound {
                    path: input.to_path_buf(),
                }
                .into());
            }

            let mut task = CompressionTask::new(input.to_path_buf(), generate_output_path(input));
            task.status = TaskStatus::Starting;
            let cancel = CancellationToken::new();
            tasks.insert(
                task.id.clone(),
                Entry {
                    task: task.clone(),
                    cancel: Some(cancel.clone()),
                },
            );
            (task, cancel)
        };

        info!(
            "Compressing {} -> {}",
            task.input_path.display(),
            task.output_path.display()
        );
        self.inner.notify(&task);
        tokio::spawn(supervise(Arc::clone(&self.inner), task.clone(), cancel));
        Ok(task)
    }

    /// Stops a running compression. The output file is deleted.
    pub fn stop_compression(&self, id: &str) -> Result<()> {
        let task = {
            let mut tasks = self.inner.tasks.write();
            let entry = tasks.get_mut(id).ok_or_else(|| CompressionError::NotFound {
                id: id.to_string(),
            })?;
            if !entry.task.status.is_active() {
                return Err(CompressionError::NotActive { id: id.to_string() }.into());
            }
            entry.task.status = TaskStatus::Stopping;
            if let Some(cancel) = &entry.cancel {
                cancel.cancel();
            }
            entry.task.clone()
        };
        info!("Stopping compression {}", id);
        self.inner.notify(&task);
        Ok(())
    }

    /// Snapshot of one task.
    #[must_use]
    pub fn get_task(&self, id: &str) -> Option<CompressionTask> {
        self.inner.tasks.read().get(id).map(|e| e.task.clone())
    }

    /// Snapshots of all tasks, oldest first.
    #[must_use]
    pub fn get_all_tasks(&self) -> Vec<CompressionTask> {
        let mut tasks: Vec<CompressionTask> = self
            .inner
            .tasks
            .read()
            .values()
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    /// Returns true while any compression is running.
    #[must_use]
    pub fn has_active_tasks(&self) -> bool {
        self.inner
            .tasks
            .read()
            .values()
            .any(|e| e.task.status.is_active())
    }
}

impl Inner {
    fn notify(&self, task: &CompressionTask) {
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(task);
        }
    }

    /// Applies `f` to a task and notifies with the result.
    fn update(&self, id: &str, f: impl FnOnce(&mut Entry) -> bool) {
        let snapshot = {
            let mut tasks = self.tasks.write();
            tasks
                .get_mut(id)
                .and_then(|entry| f(entry).then(|| entry.task.clone()))
        };
        if let Some(task) = snapshot {
            self.notify(&task);
        }
    }

    fn finish(&self, id: &str, status: TaskStatus, error: Option<String>) {
        self.update(id, |entry| {
            entry.cancel = None;
            if status == TaskStatus::Completed {
                entry.task.set_progress(1.0);
            }
            entry.task.finish(status, error);
            true
        });
    }
}

async fn probe(
    inner: &Inner,
    input: &Path,
    cancel: &CancellationToken,
) -> std::result::Result<f64, EngineError> {
    let seconds = inner.probe_timeout.as_secs();
    let duration = tokio::select! {
        () = cancel.cancelled() => return Err(EngineError::Cancelled),
        probed = tokio::time::timeout(inner.probe_timeout, inner.encoder.probe_duration(input)) => {
            probed.map_err(|_| EngineError::Timeout { operation: "probe", seconds })??
        }
    };
    if duration.is_finite() && duration > 0.0 {
        Ok(duration)
    } else {
        Err(EngineError::Probe(format!("invalid duration {duration}")))
    }
}

async fn supervise(inner: Arc<Inner>, task: CompressionTask, cancel: CancellationToken) {
    let id = task.id.clone();

    // A failed probe never touched the output, so an earlier result stays.
    let duration = match probe(&inner, &task.input_path, &cancel).await {
        Ok(duration) => duration,
        Err(e) => {
            fail(&inner, &id, &cancel, &e);
            return;
        }
    };

    inner.update(&id, |entry| {
        if entry.task.status != TaskStatus::Starting {
            return false;
        }
        entry.task.status = TaskStatus::Downloading;
        true
    });

    let progress: EncodeProgress = {
        let inner = Arc::clone(&inner);
        let id = id.clone();
        Arc::new(move |seconds| {
            inner.update(&id, |entry| {
                if entry.task.status != TaskStatus::Downloading {
                    return false;
                }
                entry.task.set_progress(seconds / duration);
                true
            });
        })
    };
    let result = inner
        .encoder
        .encode(&task.input_path, &task.output_path, progress, cancel.clone())
        .await;

    match result {
        Ok(()) => {
            info!("Compression {} completed", id);
            inner.finish(&id, TaskStatus::Completed, None);
        }
        Err(e) => {
            if let Err(remove_err) = tokio::fs::remove_file(&task.output_path).await
                && remove_err.kind() != std::io::ErrorKind::NotFound
            {
                warn!(
                    "Failed to remove partial output {}: {}",
                    task.output_path.display(),
                    remove_err
                );
            }
            fail(&inner, &id, &cancel, &e);
        }
    }
}

fn fail(inner: &Inner, id: &str, cancel: &CancellationToken, error: &EngineError) {
    if cancel.is_cancelled() {
        info!("Compression {} stopped", id);
        inner.finish(id, TaskStatus::Stopped, None);
    } else {
        error!("Compression {} failed: {}", id, error);
        inner.finish(id, TaskStatus::Error, Some(error.to_string()));
    }
}
