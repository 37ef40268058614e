//! Download registry and scheduler.
//!
//! [`DownloadService`] owns every [`DownloadTask`] and enforces:
//! - At most `max_parallel_downloads` tasks hold a slot (`Starting`,
//!   `Downloading` or `Stopping`) at any time
//! - Pending tasks are promoted in creation order whenever a slot frees up
//! - At most one non-finished task per URL
//!
//! Each promoted task runs in its own Tokio task (the supervisor) that invokes
//! the engine, runs the periodic smoother, and records the outcome. User
//! actions cancel the supervisor through a per-task [`CancellationToken`]; the
//! recorded stop intent decides between `Paused` and `Stopped`.
//!
//! All state lives behind one lock that is never held across an `.await`.
//! The update callback is always invoked after the lock is released, so it may
//! call back into the service.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QualityPreset;
use crate::engine::{
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF_MS, DownloadEngine, DownloadRequest, EngineOutput,
    ProgressCallback, ProgressSample, RetryPolicy, download_with_retry,
};
use crate::error::{EngineError, Result, TaskError};
use crate::failure::sanitize_engine_error;
use crate::files::{absolutize, file_size, locate_downloaded_file};
use crate::format::now_millis;
use crate::progress::RateTracker;
use crate::smoothing::{DEFAULT_SMOOTHING_WINDOW_MS, SmoothingState};
use crate::status::TaskStatus;
use crate::task::{DownloadTask, ETA_UNKNOWN, TaskId, UpdateCallback};
use crate::video_id::extract_video_id;

/// Default maximum number of concurrent downloads.
pub const DEFAULT_MAX_PARALLEL_DOWNLOADS: usize = 2;

/// Minimum allowed concurrent downloads.
pub const MIN_PARALLEL_DOWNLOADS: usize = 1;

/// Maximum allowed concurrent downloads.
pub const MAX_PARALLEL_DOWNLOADS: usize = 10;

/// Default yt-dlp output template.
pub const DEFAULT_FILENAME_TEMPLATE: &str = "%(title)s.%(ext)s";

/// Configuration for the download scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadConfig {
    /// Maximum number of concurrent downloads.
    #[serde(default = "default_max_parallel")]
    pub max_parallel_downloads: usize,
    /// Quality preset for new downloads.
    #[serde(default)]
    pub quality: QualityPreset,
    /// Output filename template.
    #[serde(default = "default_filename_template")]
    pub filename_template: String,
    /// Length of one smoothing window in milliseconds.
    #[serde(default = "default_smoothing_window_ms")]
    pub smoothing_window_ms: u64,
    /// Retries after a failed engine invocation.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Pause between attempts in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

const fn default_max_parallel() -> usize {
    DEFAULT_MAX_PARALLEL_DOWNLOADS
}

fn default_filename_template() -> String {
    DEFAULT_FILENAME_TEMPLATE.to_string()
}

const fn default_smoothing_window_ms() -> u64 {
    DEFAULT_SMOOTHING_WINDOW_MS
}

const fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

const fn default_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_parallel_downloads: DEFAULT_MAX_PARALLEL_DOWNLOADS,
            quality: QualityPreset::default(),
            filename_template: default_filename_template(),
            smoothing_window_ms: DEFAULT_SMOOTHING_WINDOW_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

impl DownloadConfig {
    /// Clamp values to their valid ranges.
    pub fn validate(&mut self) {
        self.max_parallel_downloads =
            clamp_parallel(self.max_parallel_downloads);
        self.smoothing_window_ms = self.smoothing_window_ms.max(1);
        if self.filename_template.trim().is_empty() {
            self.filename_template = default_filename_template();
        }
    }

    /// Retry policy for engine invocations.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    /// Length of one smoothing window.
    #[must_use]
    pub const fn smoothing_window(&self) -> Duration {
        Duration::from_millis(self.smoothing_window_ms)
    }
}

/// Clamps a parallelism value to `[MIN_PARALLEL_DOWNLOADS, MAX_PARALLEL_DOWNLOADS]`.
#[must_use]
pub const fn clamp_parallel(value: usize) -> usize {
    if value < MIN_PARALLEL_DOWNLOADS {
        MIN_PARALLEL_DOWNLOADS
    } else if value > MAX_PARALLEL_DOWNLOADS {
        MAX_PARALLEL_DOWNLOADS
    } else {
        value
    }
}

/// What the user asked for when a running task was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    None,
    Pause,
    Stop,
}

struct TaskEntry {
    task: DownloadTask,
    video_id: String,
    /// Creation order, for listing.
    created: u64,
    /// Scheduling order. Renewed on restart.
    queued: u64,
    stop_mode: StopMode,
    cancel: Option<CancellationToken>,
    rate: RateTracker,
    smoothing: SmoothingState,
}

struct Registry {
    entries: HashMap<TaskId, TaskEntry>,
    by_url: HashMap<String, TaskId>,
    by_video_id: HashMap<String, TaskId>,
    active: usize,
    next_seq: u64,
    config: DownloadConfig,
    download_dir: PathBuf,
}

impl Registry {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut TaskEntry> {
        self.entries.get_mut(id).ok_or_else(|| {
            TaskError::NotFound {
                id: id.to_string(),
            }
            .into()
        })
    }

    /// Returns the id of another non-finished task that owns `url`.
    fn url_owner(&self, url: &str, except: Option<&str>) -> Option<&TaskId> {
        self.by_url.get(url).filter(|owner| {
            Some(owner.as_str()) != except
                && self
                    .entries
                    .get(*owner)
                    .is_some_and(|e| !e.task.status.is_finished())
        })
    }
}

/// Everything a supervisor needs to run one task.
struct Launch {
    id: TaskId,
    request: DownloadRequest,
    cancel: CancellationToken,
    existing_output: Option<PathBuf>,
    smoothing_window: Duration,
    retry: RetryPolicy,
}

/// Side effects collected under the lock and applied after releasing it.
#[derive(Default)]
struct Effects {
    updates: Vec<DownloadTask>,
    launches: Vec<Launch>,
}

enum Tick {
    Idle,
    Updated(DownloadTask),
    Done,
}

struct Inner {
    engine: Arc<dyn DownloadEngine>,
    state: RwLock<Registry>,
    callback: RwLock<Option<UpdateCallback<DownloadTask>>>,
}

/// Registry and scheduler for download tasks.
///
/// Cheap to clone; clones share the same registry. Operations that can start
/// a download spawn Tokio tasks and must be called from within a Tokio runtime.
#[derive(Clone)]
pub struct DownloadService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DownloadService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("DownloadService")
            .field("engine", &self.inner.engine.name())
            .field("tasks", &state.entries.len())
            .field("active", &state.active)
            .field("max_parallel", &state.config.max_parallel_downloads)
            .finish()
    }
}

impl DownloadService {
    /// Creates a service that writes into `download_dir`.
    #[must_use]
    pub fn new(
        engine: Arc<dyn DownloadEngine>,
        download_dir: PathBuf,
        mut config: DownloadConfig,
    ) -> Self {
        config.validate();
        info!(
            "Download service using {} engine, max {} parallel, into {}",
            engine.name(),
            config.max_parallel_downloads,
            download_dir.display()
        );
        Self {
            inner: Arc::new(Inner {
                engine,
                state: RwLock::new(Registry {
                    entries: HashMap::new(),
                    by_url: HashMap::new(),
                    by_video_id: HashMap::new(),
                    active: 0,
                    next_seq: 0,
                    config,
                    download_dir,
                }),
                callback: RwLock::new(None),
            }),
        }
    }

    /// Installs the update callback, replacing any previous one.
    pub fn set_update_callback<F>(&self, callback: F)
    where
        F: Fn(&DownloadTask) + Send + Sync + 'static,
    {
        *self.inner.callback.write() = Some(Arc::new(callback));
    }

    /// Registers a download for `url` and starts it if a slot is free.
    ///
    /// Returns the task as it stands after scheduling.
    pub fn add_task(&self, url: &str) -> Result<DownloadTask> {
        let url = url.trim();
        if url.is_empty() {
            return Err(TaskError::InvalidUrl {
                url: url.to_string(),
            }
            .into());
        }

        let mut effects = Effects::default();
        let snapshot = {
            let mut reg = self.inner.state.write();
            if reg.url_owner(url, None).is_some() {
                return Err(TaskError::DuplicateUrl {
                    url: url.to_string(),
                }
                .into());
            }

            let task = DownloadTask::new(url);
            let id = task.id.clone();
            let video_id = extract_video_id(url);
            let seq = reg.next_seq();
            reg.by_url.insert(url.to_string(), id.clone());
            reg.by_video_id.insert(video_id.clone(), id.clone());
            reg.entries.insert(
                id.clone(),
                TaskEntry {
                    task,
                    video_id,
                    created: seq,
                    queued: seq,
                    stop_mode: StopMode::None,
                    cancel: None,
                    rate: RateTracker::new(),
                    smoothing: SmoothingState::new(),
                },
            );
            info!("Added download {} for {}", id, url);

            promote_locked(&mut reg, &mut effects);
            reg.entries.get(&id).map(|e| e.task.clone())
        };
        self.inner.apply(effects);

        snapshot.ok_or_else(|| {
            TaskError::NotFound {
                id: url.to_string(),
            }
            .into()
        })
    }

    /// Snapshot of one task.
    #[must_use]
    pub fn get_task(&self, id: &str) -> Option<DownloadTask> {
        self.inner.state.read().entries.get(id).map(|e| e.task.clone())
    }

    /// Snapshots of all tasks in creation order.
    #[must_use]
    pub fn get_all_tasks(&self) -> Vec<DownloadTask> {
        let state = self.inner.state.read();
        let mut entries: Vec<&TaskEntry> = state.entries.values().collect();
        entries.sort_by_key(|e| e.created);
        entries.into_iter().map(|e| e.task.clone()).collect()
    }

    /// Looks up the task downloading a canonical video id.
    #[must_use]
    pub fn get_task_by_video_id(&self, video_id: &str) -> Option<DownloadTask> {
        let state = self.inner.state.read();
        state
            .by_video_id
            .get(video_id)
            .and_then(|id| state.entries.get(id))
            .map(|e| e.task.clone())
    }

    /// Finds the task for a video, by URL first and by video id second.
    #[must_use]
    pub fn find_task_for_video(&self, url: &str, video_id: &str) -> Option<DownloadTask> {
        let state = self.inner.state.read();
        state
            .by_url
            .get(url)
            .or_else(|| state.by_video_id.get(video_id))
            .and_then(|id| state.entries.get(id))
            .map(|e| e.task.clone())
    }

    /// Stops a task.
    ///
    /// Pending, paused and failed tasks stop immediately. Running tasks move to
    /// `Stopping` and end as `Stopped` once the engine returns. Already stopped
    /// or completed tasks are left alone.
    pub fn stop_task(&self, id: &str) -> Result<()> {
        let snapshot = {
            let mut reg = self.inner.state.write();
            let entry = reg.entry_mut(id)?;
            match entry.task.status {
                TaskStatus::Pending | TaskStatus::Paused | TaskStatus::Error => {
                    entry.stop_mode = StopMode::None;
                    entry.task.eta_secs = ETA_UNKNOWN;
                    entry.task.finish(TaskStatus::Stopped);
                    Some(entry.task.clone())
                }
                TaskStatus::Starting | TaskStatus::Downloading | TaskStatus::Stopping => {
                    entry.task.status = TaskStatus::Stopping;
                    entry.stop_mode = StopMode::Stop;
                    if let Some(token) = &entry.cancel {
                        token.cancel();
                    }
                    Some(entry.task.clone())
                }
                TaskStatus::Stopped | TaskStatus::Completed => None,
            }
        };

        if let Some(task) = snapshot {
            info!("Stopping download {} ({})", id, task.status);
            self.inner.notify(&task);
        }
        Ok(())
    }

    /// Pauses a running task. Does nothing for tasks that are not running.
    pub fn pause_task(&self, id: &str) -> Result<()> {
        let snapshot = {
            let mut reg = self.inner.state.write();
            let entry = reg.entry_mut(id)?;
            if !entry.task.status.is_active() || entry.stop_mode == StopMode::Stop {
                None
            } else {
                entry.task.status = TaskStatus::Stopping;
                entry.stop_mode = StopMode::Pause;
                if let Some(token) = &entry.cancel {
                    token.cancel();
                }
                Some(entry.task.clone())
            }
        };

        if let Some(task) = snapshot {
            info!("Pausing download {}", id);
            self.inner.notify(&task);
        }
        Ok(())
    }

    /// Requeues a paused task.
    pub fn resume_task(&self, id: &str) -> Result<()> {
        let mut effects = Effects::default();
        {
            let mut reg = self.inner.state.write();
            let seq = reg.next_seq();
            let entry = reg.entry_mut(id)?;
            if entry.task.status != TaskStatus::Paused {
                return Err(TaskError::InvalidTransition {
                    id: id.to_string(),
                    status: entry.task.status,
                    action: "resume",
                }
                .into());
            }
            entry.task.status = TaskStatus::Pending;
            entry.task.started_at = now_millis();
            entry.task.finished_at = None;
            entry.queued = seq;
            effects.updates.push(entry.task.clone());
            info!("Resuming download {}", id);
            promote_locked(&mut reg, &mut effects);
        }
        self.inner.apply(effects);
        Ok(())
    }

    /// Resets a failed, stopped, paused or pending task and requeues it.
    pub fn restart_task(&self, id: &str) -> Result<()> {
        let mut effects = Effects::default();
        {
            let mut reg = self.inner.state.write();
            let seq = reg.next_seq();
            let entry = reg.entry_mut(id)?;
            match entry.task.status {
                TaskStatus::Error | TaskStatus::Stopped | TaskStatus::Paused | TaskStatus::Pending => {}
                status => {
                    return Err(TaskError::InvalidTransition {
                        id: id.to_string(),
                        status,
                        action: "restart",
                    }
                    .into());
                }
            }
            let url = entry.task.url.clone();
            if reg.url_owner(&url, Some(id)).is_some() {
                return Err(TaskError::DuplicateUrl { url }.into());
            }

            let entry = reg.entry_mut(id)?;
            entry.task.reset_progress();
            entry.task.status = TaskStatus::Pending;
            entry.task.started_at = now_millis();
            entry.stop_mode = StopMode::None;
            entry.queued = seq;
            let video_id = entry.video_id.clone();
            effects.updates.push(entry.task.clone());

            reg.by_url.insert(url, id.to_string());
            reg.by_video_id.insert(video_id, id.to_string());
            info!("Restarting download {}", id);
            promote_locked(&mut reg, &mut effects);
        }
        self.inner.apply(effects);
        Ok(())
    }

    /// Removes a task, stopping it first if it is running.
    ///
    /// The slot of a running task is released when its engine returns.
    pub fn remove_task(&self, id: &str) -> Result<()> {
        let mut reg = self.inner.state.write();
        let entry = reg.entries.remove(id).ok_or_else(|| TaskError::NotFound {
            id: id.to_string(),
        })?;
        if entry.task.status.is_active()
            && let Some(token) = &entry.cancel
        {
            token.cancel();
        }
        if reg.by_url.get(&entry.task.url).is_some_and(|owner| owner == id) {
            reg.by_url.remove(&entry.task.url);
        }
        if reg.by_video_id.get(&entry.video_id).is_some_and(|owner| owner == id) {
            reg.by_video_id.remove(&entry.video_id);
        }
        info!("Removed download {} ({})", id, entry.task.status);
        Ok(())
    }

    /// Stops every task that has not finished. Returns how many were affected.
    pub fn stop_all(&self) -> usize {
        let ids: Vec<TaskId> = {
            let state = self.inner.state.read();
            state
                .entries
                .values()
                .filter(|e| !e.task.status.is_finished())
                .map(|e| e.task.id.clone())
                .collect()
        };
        ids.iter().filter(|id| self.stop_task(id).is_ok()).count()
    }

    /// Sets the parallelism limit, clamped to `[1, 10]`, and starts pending
    /// tasks if the limit went up.
    pub fn set_max_parallel_downloads(&self, max: usize) {
        let mut effects = Effects::default();
        {
            let mut reg = self.inner.state.write();
            let clamped = clamp_parallel(max);
            if clamped != max {
                warn!("Max parallel downloads {} clamped to {}", max, clamped);
            }
            reg.config.max_parallel_downloads = clamped;
            promote_locked(&mut reg, &mut effects);
        }
        self.inner.apply(effects);
    }

    /// Current parallelism limit.
    #[must_use]
    pub fn max_parallel_downloads(&self) -> usize {
        self.inner.state.read().config.max_parallel_downloads
    }

    /// Number of tasks holding a slot.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.state.read().active
    }

    /// Returns true while any task is pending, running or paused.
    #[must_use]
    pub fn has_unfinished_tasks(&self) -> bool {
        self.inner
            .state
            .read()
            .entries
            .values()
            .any(|e| !e.task.status.is_finished())
    }

    /// Directory for downloads started from now on.
    pub fn set_download_directory(&self, dir: PathBuf) {
        info!("Download directory set to {}", dir.display());
        self.inner.state.write().download_dir = dir;
    }

    /// Current download directory.
    #[must_use]
    pub fn download_directory(&self) -> PathBuf {
        self.inner.state.read().download_dir.clone()
    }

    /// Quality preset for downloads started from now on.
    pub fn set_quality_preset(&self, quality: QualityPreset) {
        self.inner.state.write().config.quality = quality;
    }

    /// Output template for downloads started from now on.
    pub fn set_filename_template(&self, template: &str) {
        let mut reg = self.inner.state.write();
        reg.config.filename_template = template.to_string();
        reg.config.validate();
    }
}

/// Promotes pending tasks in queue order until the slots are full.
fn promote_locked(reg: &mut Registry, effects: &mut Effects) {
    while reg.active < reg.config.max_parallel_downloads {
        let Some(id) = reg
            .entries
            .values()
            .filter(|e| e.task.status == TaskStatus::Pending)
            .min_by_key(|e| e.queued)
            .map(|e| e.task.id.clone())
        else {
            break;
        };

        let output_dir = reg.download_dir.clone();
        let filename_template = reg.config.filename_template.clone();
        let quality = reg.config.quality;
        let smoothing_window = reg.config.smoothing_window();
        let retry = reg.config.retry_policy();

        let Some(entry) = reg.entries.get_mut(&id) else {
            break;
        };
        let cancel = CancellationToken::new();
        entry.task.status = TaskStatus::Starting;
        entry.stop_mode = StopMode::None;
        entry.cancel = Some(cancel.clone());
        entry.rate.reset();
        entry.smoothing.clear_measurements();
        effects.updates.push(entry.task.clone());
        effects.launches.push(Launch {
            id: id.clone(),
            request: DownloadRequest {
                url: entry.task.url.clone(),
                video_id: entry.video_id.clone(),
                output_dir,
                filename_template,
                quality,
            },
            cancel,
            existing_output: entry.task.output_path.clone(),
            smoothing_window,
            retry,
        });
        reg.active += 1;
        debug!("Promoted download {} ({} active)", id, reg.active);
    }
}

/// True if `path` holds at least `total` bytes (or anything, when the total is unknown).
fn already_on_disk(path: Option<&std::path::Path>, total: u64) -> bool {
    path.and_then(file_size)
        .is_some_and(|size| size > 0 && (total == 0 || size >= total))
}

fn is_placeholder_title(title: &str) -> bool {
    title.is_empty() || title.starts_with("http")
}

/// Fills in the output path, title and size of a completed task.
fn complete_task(entry: &mut TaskEntry, output: EngineOutput, request: &DownloadRequest) {
    let task = &mut entry.task;
    if let Some(title) = output.title.filter(|t| !t.is_empty())
        && is_placeholder_title(&task.title)
    {
        task.title = title;
    }
    if let Some(label) = output.duration_label
        && task.duration_label.is_empty()
    {
        task.duration_label = label;
    }

    let reported = output.output_path.or_else(|| task.output_path.clone());
    let path = match reported {
        Some(path) if path.exists() => path,
        reported => locate_downloaded_file(&request.output_dir, &request.video_id, &task.title)
            .or(reported)
            .unwrap_or_else(|| request.output_dir.join(format!("{}.mp4", request.video_id))),
    };
    let path = absolutize(&path);
    if let Some(size) = file_size(&path) {
        task.file_size = size;
    }
    task.output_path = Some(path);
    task.progress = 1.0;
    task.percent = 100;
    task.eta_secs = 0;
    task.finish(TaskStatus::Completed);
}

impl Inner {
    fn notify(&self, task: &DownloadTask) {
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(task);
        }
    }

    fn apply(self: &Arc<Self>, effects: Effects) {
        for task in &effects.updates {
            self.notify(task);
        }
        for launch in effects.launches {
            tokio::spawn(supervise(Arc::clone(self), launch));
        }
    }

    /// Starting -> Downloading, unless a stop arrived in between.
    fn begin_download(&self, id: &str) -> Option<DownloadTask> {
        let mut reg = self.state.write();
        let entry = reg.entries.get_mut(id)?;
        if entry.task.status != TaskStatus::Starting {
            return None;
        }
        entry.task.status = TaskStatus::Downloading;
        Some(entry.task.clone())
    }

    /// Applies one raw engine sample.
    fn record_progress(&self, id: &str, sample: ProgressSample) {
        let snapshot = {
            let mut reg = self.state.write();
            let Some(entry) = reg.entries.get_mut(id) else {
                return;
            };
            if entry.task.status != TaskStatus::Downloading {
                return;
            }

            let task = &mut entry.task;
            if let Some(title) = sample.title.filter(|t| !t.is_empty())
                && is_placeholder_title(&task.title)
            {
                task.title = title;
            }
            if let Some(label) = sample.duration_label
                && task.duration_label.is_empty()
            {
                task.duration_label = label;
            }
            if let Some(path) = sample.output_path {
                task.output_path = Some(path);
            }
            if sample.total_bytes > 0 {
                task.file_size = sample.total_bytes;
            }

            let update = entry
                .rate
                .observe(sample.downloaded_bytes, sample.total_bytes);
            entry.task.progress = update.percent / 100.0;
            if let Some(eta) = update.eta_secs {
                entry.task.eta_secs = eta;
            }

            if update.delta_bytes == 0
                && already_on_disk(entry.task.output_path.as_deref(), sample.total_bytes)
            {
                entry.task.progress = 1.0;
                entry.task.percent = 100;
                entry.task.speed.clear();
                entry.task.eta_secs = 0;
                entry.smoothing.clear_measurements();
                Some(entry.task.clone())
            } else {
                entry
                    .smoothing
                    .add_measurement(update.speed_mbps(), update.percent);
                None
            }
        };

        if let Some(task) = snapshot {
            debug!("Download {} already on disk", id);
            self.notify(&task);
        }
    }

    /// Publishes the smoothed values of the last window.
    fn publish_smoothed(&self, id: &str) -> Tick {
        let mut reg = self.state.write();
        let Some(entry) = reg.entries.get_mut(id) else {
            return Tick::Done;
        };
        if entry.task.status != TaskStatus::Downloading {
            return Tick::Done;
        }
        if entry.smoothing.is_empty() {
            return Tick::Idle;
        }
        let (speed, percent) = entry.smoothing.calculate_smoothed_values();
        entry.smoothing.clear_measurements();
        entry.task.percent = percent;
        if !speed.is_empty() {
            entry.task.speed = speed;
        }
        Tick::Updated(entry.task.clone())
    }

    /// Records the engine outcome, releases the slot and promotes the next task.
    fn finish(
        self: &Arc<Self>,
        id: &str,
        result: std::result::Result<EngineOutput, EngineError>,
        cancel: &CancellationToken,
        request: &DownloadRequest,
    ) {
        let mut effects = Effects::default();
        {
            let mut reg = self.state.write();
            reg.active = reg.active.saturating_sub(1);

            if let Some(entry) = reg.entries.get_mut(id) {
                entry.cancel = None;
                entry.rate.reset();
                entry.smoothing.clear_measurements();

                match result {
                    Ok(output) => {
                        complete_task(entry, output, request);
                        info!("Download {} completed", id);
                    }
                    Err(_) if cancel.is_cancelled() => {
                        entry.task.eta_secs = ETA_UNKNOWN;
                        if entry.stop_mode == StopMode::Pause {
                            entry.task.status = TaskStatus::Paused;
                            entry.task.speed.clear();
                            info!("Download {} paused", id);
                        } else {
                            entry.task.finish(TaskStatus::Stopped);
                            info!("Download {} stopped", id);
                        }
                    }
                    Err(e) => {
                        error!("Download {} failed: {}", id, e);
                        entry.task.last_error = Some(sanitize_engine_error(&e.to_string()));
                        entry.task.eta_secs = ETA_UNKNOWN;
                        entry.task.finish(TaskStatus::Error);
                    }
                }
                entry.stop_mode = StopMode::None;
                effects.updates.push(entry.task.clone());
            } else {
                debug!("Download {} was removed while running", id);
            }

            promote_locked(&mut reg, &mut effects);
        }
        self.apply(effects);
    }
}

/// Periodically publishes smoothed progress until `stop` fires or the task
/// leaves `Downloading`.
async fn run_smoother(inner: Arc<Inner>, id: TaskId, window: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + window, window);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => match inner.publish_smoothed(&id) {
                Tick::Idle => {}
                Tick::Updated(task) => inner.notify(&task),
                Tick::Done => break,
            },
        }
    }
}

/// Runs one promoted task to completion.
async fn supervise(inner: Arc<Inner>, launch: Launch) {
    let Launch {
        id,
        request,
        cancel,
        existing_output,
        smoothing_window,
        retry,
    } = launch;

    if let Some(task) = inner.begin_download(&id) {
        inner.notify(&task);
    }

    if let Some(path) = existing_output
        .filter(|p| !cancel.is_cancelled() && file_size(p).is_some_and(|size| size > 0))
    {
        info!(
            "Download {} already complete at {}",
            id,
            path.display()
        );
        let output = EngineOutput {
            output_path: Some(path),
            ..EngineOutput::default()
        };
        inner.finish(&id, Ok(output), &cancel, &request);
        return;
    }

    let ticker_stop = cancel.child_token();
    let ticker = tokio::spawn(run_smoother(
        Arc::clone(&inner),
        id.clone(),
        smoothing_window,
        ticker_stop.clone(),
    ));

    let progress: ProgressCallback = {
        let inner = Arc::clone(&inner);
        let id = id.clone();
        Arc::new(move |sample| inner.record_progress(&id, sample))
    };
    let result =
        download_with_retry(inner.engine.as_ref(), &request, progress, &cancel, retry).await;

    ticker_stop.cancel();
    if let Err(e) = ticker.await {
        warn!("Smoother for {} ended abnormally: {}", id, e);
    }
    inner.finish(&id, result, &cancel, &request);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingEngine, GatedEngine, test_config, wait_for};
    use parking_lot::Mutex;
    use tempfile::TempDir;

    const URL_A: &str = "https://www.youtube.com/watch?v=aaaaaaaaaaa";
    const URL_B: &str = "https://www.youtube.com/watch?v=bbbbbbbbbbb";

    fn service(engine: Arc<dyn DownloadEngine>, max: usize) -> (DownloadService, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let service = DownloadService::new(engine, dir.path().to_path_buf(), test_config(max));
        (service, dir)
    }

    fn status(service: &DownloadService, id: &str) -> Option<TaskStatus> {
        service.get_task(id).map(|t| t.status)
    }

    #[tokio::test]
    async fn test_duplicate_url_rejected_until_finished() {
        let engine = GatedEngine::new();
        let (service, _dir) = service(engine.clone(), 2);

        let task = service.add_task(URL_A).expect("first add");
        let err = service.add_task(URL_A).expect_err("duplicate");
        assert!(matches!(
            err,
            crate::Error::Task(TaskError::DuplicateUrl { .. })
        ));

        service.stop_task(&task.id).expect("stop");
        assert!(wait_for(|| status(&service, &task.id) == Some(TaskStatus::Stopped)).await);
        assert!(service.add_task(URL_A).is_ok());
    }

    #[tokio::test]
    async fn test_empty_url_rejected() {
        let (service, _dir) = service(GatedEngine::new(), 1);
        assert!(matches!(
            service.add_task("   "),
            Err(crate::Error::Task(TaskError::InvalidUrl { .. }))
        ));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let engine = GatedEngine::new();
        let (service, _dir) = service(engine.clone(), 1);

        let running = service.add_task(URL_A).expect("add");
        let pending = service.add_task(URL_B).expect("add");
        assert_eq!(pending.status, TaskStatus::Pending);

        service.stop_task(&pending.id).expect("stop pending");
        assert_eq!(status(&service, &pending.id), Some(TaskStatus::Stopped));
        service.stop_task(&pending.id).expect("stop again");
        assert_eq!(status(&service, &pending.id), Some(TaskStatus::Stopped));

        engine.release(URL_A);
        assert!(wait_for(|| status(&service, &running.id) == Some(TaskStatus::Completed)).await);
        service.stop_task(&running.id).expect("stop completed");
        assert_eq!(status(&service, &running.id), Some(TaskStatus::Completed));

        assert!(service.stop_task("task-missing").is_err());
    }

    #[tokio::test]
    async fn test_parallelism_is_clamped() {
        let (service, _dir) = service(GatedEngine::new(), 0);
        assert_eq!(service.max_parallel_downloads(), MIN_PARALLEL_DOWNLOADS);

        service.set_max_parallel_downloads(15);
        assert_eq!(service.max_parallel_downloads(), MAX_PARALLEL_DOWNLOADS);
        service.set_max_parallel_downloads(0);
        assert_eq!(service.max_parallel_downloads(), 1);
    }

    #[tokio::test]
    async fn test_single_slot_promotes_in_order() {
        let engine = GatedEngine::new();
        let (service, _dir) = service(engine.clone(), 1);

        let first = service.add_task(URL_A).expect("add");
        let second = service.add_task(URL_B).expect("add");
        assert_eq!(first.status, TaskStatus::Starting);
        assert_eq!(second.status, TaskStatus::Pending);
        assert_eq!(service.active_count(), 1);

        engine.release(URL_A);
        assert!(wait_for(|| status(&service, &first.id) == Some(TaskStatus::Completed)).await);
        assert!(wait_for(|| status(&service, &second.id).is_some_and(TaskStatus::is_active)).await);

        engine.release(URL_B);
        assert!(wait_for(|| status(&service, &second.id) == Some(TaskStatus::Completed)).await);
        assert_eq!(engine.max_running.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(service.active_count(), 0);
    }

    #[tokio::test]
    async fn test_raising_limit_starts_pending_tasks() {
        let engine = GatedEngine::new();
        let (service, _dir) = service(engine.clone(), 1);

        service.add_task(URL_A).expect("add");
        let second = service.add_task(URL_B).expect("add");
        service.set_max_parallel_downloads(2);
        assert!(status(&service, &second.id).is_some_and(TaskStatus::is_active));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let engine = GatedEngine::new();
        let (service, _dir) = service(engine.clone(), 1);

        let task = service.add_task(URL_A).expect("add");
        service.pause_task(&task.id).expect("pause");
        assert!(wait_for(|| status(&service, &task.id) == Some(TaskStatus::Paused)).await);
        let paused = service.get_task(&task.id).expect("task");
        assert!(paused.last_error.is_none());
        assert_eq!(service.active_count(), 0);

        service.resume_task(&task.id).expect("resume");
        assert!(wait_for(|| status(&service, &task.id) == Some(TaskStatus::Downloading)).await);
        engine.release(URL_A);
        assert!(wait_for(|| status(&service, &task.id) == Some(TaskStatus::Completed)).await);
    }

    #[tokio::test]
    async fn test_resume_requires_paused() {
        let (service, _dir) = service(GatedEngine::new(), 1);
        let task = service.add_task(URL_A).expect("add");
        let err = service.resume_task(&task.id).expect_err("not paused");
        assert!(matches!(
            err,
            crate::Error::Task(TaskError::InvalidTransition { action: "resume", .. })
        ));
    }

    #[tokio::test]
    async fn test_pause_ignores_inactive_tasks() {
        let (service, _dir) = service(GatedEngine::new(), 1);
        service.add_task(URL_A).expect("add");
        let pending = service.add_task(URL_B).expect("add");
        service.pause_task(&pending.id).expect("pause");
        assert_eq!(status(&service, &pending.id), Some(TaskStatus::Pending));
    }

    #[tokio::test]
    async fn test_stop_running_task_releases_slot() {
        let engine = GatedEngine::new();
        let (service, _dir) = service(engine.clone(), 1);

        let first = service.add_task(URL_A).expect("add");
        let second = service.add_task(URL_B).expect("add");
        service.stop_task(&first.id).expect("stop");
        assert_eq!(status(&service, &first.id), Some(TaskStatus::Stopping));

        assert!(wait_for(|| status(&service, &first.id) == Some(TaskStatus::Stopped)).await);
        let stopped = service.get_task(&first.id).expect("task");
        assert!(stopped.last_error.is_none());
        assert!(stopped.finished_at.is_some());
        assert!(wait_for(|| status(&service, &second.id).is_some_and(TaskStatus::is_active)).await);
    }

    #[tokio::test]
    async fn test_engine_failure_is_sanitized() {
        let engine = Arc::new(FailingEngine {
            message: "ERROR: [youtube] x: Private video. Sign in if you've been granted access"
                .to_string(),
        });
        let (service, _dir) = service(engine, 1);

        let task = service.add_task(URL_A).expect("add");
        assert!(wait_for(|| status(&service, &task.id) == Some(TaskStatus::Error)).await);
        let failed = service.get_task(&task.id).expect("task");
        assert_eq!(failed.last_error.as_deref(), Some("This video is private."));
        assert_eq!(service.active_count(), 0);
    }

    #[tokio::test]
    async fn test_restart_after_error() {
        let engine = GatedEngine::new();
        engine.fail_with(URL_A, "network unreachable");
        let (service, _dir) = service(engine.clone(), 1);

        let task = service.add_task(URL_A).expect("add");
        engine.release(URL_A);
        assert!(wait_for(|| status(&service, &task.id) == Some(TaskStatus::Error)).await);

        service.restart_task(&task.id).expect("restart");
        let restarted = service.get_task(&task.id).expect("task");
        assert!(restarted.status.is_active());
        assert!(restarted.last_error.is_none());
        assert_eq!(restarted.eta_secs, ETA_UNKNOWN);

        let err = service.restart_task(&task.id).expect_err("running");
        assert!(matches!(
            err,
            crate::Error::Task(TaskError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_failed_task_clears_error() {
        let engine = GatedEngine::new();
        engine.fail_with(URL_A, "HTTP Error 403: Forbidden");
        let (service, _dir) = service(engine.clone(), 1);

        let task = service.add_task(URL_A).expect("add");
        engine.release(URL_A);
        assert!(wait_for(|| status(&service, &task.id) == Some(TaskStatus::Error)).await);
        assert!(service.get_task(&task.id).is_some_and(|t| t.last_error.is_some()));

        service.stop_task(&task.id).expect("stop");
        let stopped = service.get_task(&task.id).expect("task");
        assert_eq!(stopped.status, TaskStatus::Stopped);
        assert!(stopped.last_error.is_none());
        assert!(stopped.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_restart_paused_task_completes() {
        let engine = GatedEngine::new();
        let (service, _dir) = service(engine.clone(), 1);

        let task = service.add_task(URL_A).expect("add");
        assert!(wait_for(|| status(&service, &task.id) == Some(TaskStatus::Downloading)).await);
        service.pause_task(&task.id).expect("pause");
        assert!(wait_for(|| status(&service, &task.id) == Some(TaskStatus::Paused)).await);
        assert_eq!(service.active_count(), 0);

        service.restart_task(&task.id).expect("restart");
        let restarted = service.get_task(&task.id).expect("task");
        assert!(restarted.status.is_active());
        assert_eq!(restarted.percent, 0);

        assert!(wait_for(|| engine.running() == 1).await);
        engine.release(URL_A);
        assert!(wait_for(|| status(&service, &task.id) == Some(TaskStatus::Completed)).await);
        assert_eq!(engine.started.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_restart_stopped_task_waits_for_slot() {
        let engine = GatedEngine::new();
        let (service, _dir) = service(engine.clone(), 1);

        let first = service.add_task(URL_A).expect("add");
        let second = service.add_task(URL_B).expect("add");
        service.stop_task(&first.id).expect("stop");
        assert!(wait_for(|| status(&service, &first.id) == Some(TaskStatus::Stopped)).await);
        assert!(wait_for(|| status(&service, &second.id).is_some_and(TaskStatus::is_active)).await);

        service.restart_task(&first.id).expect("restart");
        assert_eq!(status(&service, &first.id), Some(TaskStatus::Pending));

        engine.release(URL_B);
        assert!(wait_for(|| status(&service, &second.id) == Some(TaskStatus::Completed)).await);
        assert!(wait_for(|| status(&service, &first.id).is_some_and(TaskStatus::is_active)).await);

        assert!(wait_for(|| engine.running() == 1).await);
        engine.release(URL_A);
        assert!(wait_for(|| status(&service, &first.id) == Some(TaskStatus::Completed)).await);
        assert_eq!(service.active_count(), 0);
    }

    #[tokio::test]
    async fn test_restart_rejected_when_url_taken() {
        let (service, _dir) = service(GatedEngine::new(), 1);
        let first = service.add_task(URL_A).expect("add");
        service.stop_task(&first.id).expect("stop");
        assert!(wait_for(|| status(&service, &first.id) == Some(TaskStatus::Stopped)).await);

        service.add_task(URL_A).expect("re-add");
        assert!(matches!(
            service.restart_task(&first.id),
            Err(crate::Error::Task(TaskError::DuplicateUrl { .. }))
        ));
    }

    #[tokio::test]
    async fn test_remove_running_task() {
        let engine = GatedEngine::new();
        let (service, _dir) = service(engine.clone(), 1);

        let first = service.add_task(URL_A).expect("add");
        let second = service.add_task(URL_B).expect("add");
        service.remove_task(&first.id).expect("remove");
        assert!(service.get_task(&first.id).is_none());
        assert!(service.remove_task(&first.id).is_err());

        assert!(wait_for(|| status(&service, &second.id).is_some_and(TaskStatus::is_active)).await);
        assert!(service.add_task(URL_A).is_ok());
    }

    #[tokio::test]
    async fn test_lookup_by_video_id() {
        let (service, _dir) = service(GatedEngine::new(), 1);
        let task = service.add_task(URL_A).expect("add");

        let found = service.get_task_by_video_id("aaaaaaaaaaa").expect("by id");
        assert_eq!(found.id, task.id);
        let found = service
            .find_task_for_video("https://youtu.be/unknown", "aaaaaaaaaaa")
            .expect("fallback");
        assert_eq!(found.id, task.id);
        assert!(service.find_task_for_video("x", "y").is_none());
    }

    #[tokio::test]
    async fn test_smoothed_progress_is_published() {
        let engine = GatedEngine::new();
        let (service, _dir) = service(engine.clone(), 1);
        let updates: Arc<Mutex<Vec<DownloadTask>>> = Arc::default();
        let sink = Arc::clone(&updates);
        service.set_update_callback(move |task| sink.lock().push(task.clone()));

        let task = service.add_task(URL_A).expect("add");
        assert!(
            wait_for(|| updates
                .lock()
                .iter()
                .any(|t| t.status == TaskStatus::Downloading && t.percent == 50))
            .await
        );
        let current = service.get_task(&task.id).expect("task");
        assert_eq!(current.title, "Video aaaaaaaaaaa");
        assert_eq!(current.progress, 0.5);

        engine.release(URL_A);
        assert!(wait_for(|| updates.lock().iter().any(|t| t.status == TaskStatus::Completed)).await);
        let done = service.get_task(&task.id).expect("task");
        assert_eq!(done.percent, 100);
        assert_eq!(done.duration_label, "3:33");
        assert!(done.output_path.is_some_and(|p| p.is_absolute()));
    }

    #[tokio::test]
    async fn test_existing_file_reports_complete_immediately() {
        let engine = GatedEngine::new();
        let (service, dir) = service(engine.clone(), 1);
        let existing = dir.path().join("done.mp4");
        std::fs::write(&existing, vec![0u8; 2048]).expect("write");
        engine.with_samples(
            URL_A,
            vec![ProgressSample {
                downloaded_bytes: 0,
                total_bytes: 2048,
                output_path: Some(existing.clone()),
                ..ProgressSample::default()
            }],
        );

        let task = service.add_task(URL_A).expect("add");
        assert!(wait_for(|| service.get_task(&task.id).is_some_and(|t| t.percent == 100)).await);

        engine.release(URL_A);
        assert!(wait_for(|| status(&service, &task.id) == Some(TaskStatus::Completed)).await);
        let done = service.get_task(&task.id).expect("task");
        assert_eq!(done.output_path, Some(existing));
        assert_eq!(done.file_size, 2048);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ytdlp_reports_file_already_on_disk() {
        let scripts = TempDir::new().expect("temp dir");
        let downloads = TempDir::new().expect("temp dir");
        let existing = downloads.path().join("Song.mp4");
        std::fs::write(&existing, vec![0u8; 1024]).expect("write");
        let program = crate::testing::fake_ytdlp(
            scripts.path(),
            &format!(
                "echo 'ytgrab-progress 0 1024 NA {path}'\n\
                 echo 'ytgrab-progress 0 1024 NA {path}'\n\
                 exec sleep 5",
                path = existing.display()
            ),
        );
        let service = DownloadService::new(
            Arc::new(crate::engine::YtDlpEngine::with_program(program)),
            downloads.path().to_path_buf(),
            test_config(1),
        );

        let task = service.add_task(URL_A).expect("add");
        assert!(wait_for(|| service.get_task(&task.id).is_some_and(|t| t.percent == 100)).await);
        let current = service.get_task(&task.id).expect("task");
        assert_eq!(current.status, TaskStatus::Downloading);
        assert_eq!(current.output_path, Some(existing));

        service.stop_task(&task.id).expect("stop");
        assert!(wait_for(|| status(&service, &task.id) == Some(TaskStatus::Stopped)).await);
    }

    #[tokio::test]
    async fn test_callback_may_reenter_service() {
        let engine = GatedEngine::new();
        let (service, _dir) = service(engine.clone(), 1);
        let seen = Arc::new(Mutex::new(0usize));
        let reentrant = service.clone();
        let counter = Arc::clone(&seen);
        service.set_update_callback(move |_| {
            *counter.lock() = reentrant.get_all_tasks().len();
        });

        service.add_task(URL_A).expect("add");
        engine.release(URL_A);
        assert!(wait_for(|| *seen.lock() == 1 && !service.has_unfinished_tasks()).await);
    }

    #[tokio::test]
    async fn test_stop_all() {
        let (service, _dir) = service(GatedEngine::new(), 1);
        service.add_task(URL_A).expect("add");
        service.add_task(URL_B).expect("add");
        assert_eq!(service.stop_all(), 2);
        assert!(wait_for(|| !service.has_unfinished_tasks()).await);
    }
}
