//! Playlist coordinator.
//!
//! Turns a [`Playlist`] into download tasks on a shared [`DownloadService`].
//! Videos are processed in chunks of `max_parallel`; every video of a chunk
//! must settle before the next chunk starts. While a video downloads, a poller
//! mirrors the task's progress onto the playlist record.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::download::DownloadService;
use crate::error::{Error, PlaylistError, Result, TaskError};
use crate::playlist::{Playlist, PlaylistVideo};
use crate::playlist_source::{DEFAULT_FETCH_TIMEOUT_SECS, PlaylistSource};
use crate::status::{PlaylistStatus, TaskStatus, VideoStatus};

/// Default number of videos downloaded together.
pub const DEFAULT_PLAYLIST_PARALLEL: usize = 3;

/// Default interval between task polls.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Capacity of the processing queue.
const QUEUE_CAPACITY: usize = 10;

/// Configuration for playlist processing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlaylistConfig {
    /// Videos per chunk.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Interval between task polls in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Time allowed for a metadata fetch in seconds.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

const fn default_max_parallel() -> usize {
    DEFAULT_PLAYLIST_PARALLEL
}

const fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

const fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_PLAYLIST_PARALLEL,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
        }
    }
}

impl PlaylistConfig {
    /// Clamp values to their valid ranges.
    pub fn validate(&mut self) {
        self.max_parallel = self.max_parallel.max(1);
        self.poll_interval_ms = self.poll_interval_ms.max(1);
        self.fetch_timeout_secs = self.fetch_timeout_secs.max(1);
    }

    /// Interval between task polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Time allowed for a metadata fetch.
    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

struct Inner {
    downloads: DownloadService,
    playlists: RwLock<HashMap<String, Playlist>>,
    /// Playlists with a running processor.
    claims: Mutex<HashSet<String>>,
    config: RwLock<PlaylistConfig>,
    queue: mpsc::Sender<String>,
}

impl Inner {
    fn with_playlist<R>(&self, id: &str, f: impl FnOnce(&mut Playlist) -> R) -> Option<R> {
        self.playlists.write().get_mut(id).map(f)
    }

    fn status_of(&self, id: &str) -> Option<PlaylistStatus> {
        self.playlists.read().get(id).map(|p| p.status)
    }
}

/// Releases a processing claim when dropped.
struct Claim {
    inner: Arc<Inner>,
    id: String,
}

impl Claim {
    fn acquire(inner: &Arc<Inner>, id: &str) -> Option<Self> {
        inner.claims.lock().insert(id.to_string()).then(|| Self {
            inner: Arc::clone(inner),
            id: id.to_string(),
        })
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.inner.claims.lock().remove(&self.id);
    }
}

/// Coordinates playlist downloads on top of a [`DownloadService`].
///
/// Cheap to clone. Must be created inside a Tokio runtime.
#[derive(Clone)]
pub struct PlaylistCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PlaylistCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaylistCoordinator")
            .field("playlists", &self.inner.playlists.read().len())
            .field("config", &*self.inner.config.read())
            .finish_non_exhaustive()
    }
}

impl PlaylistCoordinator {
    /// Creates a coordinator and starts its dispatcher.
    #[must_use]
    pub fn new(downloads: DownloadService, mut config: PlaylistConfig) -> Self {
        config.validate();
        let (queue, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let inner = Arc::new(Inner {
            downloads,
            playlists: RwLock::new(HashMap::new()),
            claims: Mutex::new(HashSet::new()),
            config: RwLock::new(config),
            queue,
        });
        tokio::spawn(dispatch(Arc::downgrade(&inner), receiver));
        Self { inner }
    }

    /// Registers a playlist and queues it for processing.
    ///
    /// A `Ready` playlist starts downloading as soon as the dispatcher picks
    /// it up.
    pub fn add_playlist(&self, playlist: Playlist) -> Result<()> {
        let id = playlist.id.clone();
        {
            let mut playlists = self.inner.playlists.write();
            if playlists.contains_key(&id) {
                return Err(PlaylistError::AlreadyExists { id }.into());
            }
            info!(
                "Added playlist {} '{}' with {} videos",
                id, playlist.title, playlist.total_videos
            );
            playlists.insert(id.clone(), playlist);
        }

        if let Err(e) = self.inner.queue.try_send(id) {
            let id = match e {
                mpsc::error::TrySendError::Full(id) | mpsc::error::TrySendError::Closed(id) => id,
            };
            debug!("Playlist queue unavailable, processing {} directly", id);
            tokio::spawn(process(Arc::clone(&self.inner), id));
        }
        Ok(())
    }

    /// Fetches a playlist from `source` and registers it.
    pub async fn fetch_and_add(&self, source: &dyn PlaylistSource, url: &str) -> Result<Playlist> {
        let playlist = source.fetch_playlist(url).await?;
        let snapshot = playlist.clone();
        self.add_playlist(playlist)?;
        Ok(snapshot)
    }

    /// Starts downloading a `Ready` playlist.
    pub fn download_playlist(&self, id: &str) -> Result<()> {
        self.inner
            .with_playlist(id, |playlist| {
                if !playlist.is_ready_for_download() {
                    return Err(Error::from(PlaylistError::NotReady {
                        id: id.to_string(),
                        status: playlist.status,
                        videos: playlist.videos.len(),
                    }));
                }
                playlist.update_status(PlaylistStatus::Downloading, None);
                Ok(())
            })
            .ok_or_else(|| PlaylistError::NotFound { id: id.to_string() })??;

        info!("Downloading playlist {}", id);
        tokio::spawn(process(Arc::clone(&self.inner), id.to_string()));
        Ok(())
    }

    /// Snapshot of one playlist.
    #[must_use]
    pub fn get_playlist(&self, id: &str) -> Option<Playlist> {
        self.inner.playlists.read().get(id).cloned()
    }

    /// Snapshots of all playlists, oldest first.
    #[must_use]
    pub fn get_all_playlists(&self) -> Vec<Playlist> {
        let mut playlists: Vec<Playlist> = self.inner.playlists.read().values().cloned().collect();
        playlists.sort_by_key(|p| p.created_at);
        playlists
    }

    /// Cancels a playlist.
    ///
    /// The playlist moves to `Error` and its downloading videos to `Skipped`.
    /// Download tasks already started keep running; no further chunk starts.
    pub fn cancel_playlist(&self, id: &str) -> Result<()> {
        self.inner
            .with_playlist(id, |playlist| {
                let downloading: Vec<String> = playlist
                    .downloading_videos()
                    .iter()
                    .map(|v| v.id.clone())
                    .collect();
                for video_id in &downloading {
                    playlist.update_video_status(video_id, VideoStatus::Skipped, None);
                }
                playlist.update_status(
                    PlaylistStatus::Error,
                    Some("Playlist download cancelled".to_string()),
                );
            })
            .ok_or_else(|| PlaylistError::NotFound { id: id.to_string() })?;
        info!("Cancelled playlist {}", id);
        Ok(())
    }

    /// Sets the chunk size (minimum 1) for chunks started from now on.
    pub fn set_max_playlist_parallel(&self, max: usize) {
        self.inner.config.write().max_parallel = max.max(1);
    }

    /// Current chunk size.
    #[must_use]
    pub fn max_playlist_parallel(&self) -> usize {
        self.inner.config.read().max_parallel
    }

    /// Returns true while any playlist is being processed.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        !self.inner.claims.lock().is_empty()
    }
}

async fn dispatch(inner: Weak<Inner>, mut receiver: mpsc::Receiver<String>) {
    while let Some(id) = receiver.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        process(inner, id).await;
    }
    debug!("Playlist dispatcher stopped");
}

/// Downloads every pending video of a playlist, chunk by chunk.
async fn process(inner: Arc<Inner>, id: String) {
    let Some(_claim) = Claim::acquire(&inner, &id) else {
        debug!("Playlist {} is already being processed", id);
        return;
    };

    let pending = inner.with_playlist(&id, |playlist| {
        match playlist.status {
            PlaylistStatus::Ready => playlist.update_status(PlaylistStatus::Downloading, None),
            PlaylistStatus::Downloading => {}
            status => {
                debug!("Playlist {} not processed in status {}", id, status);
                return Vec::new();
            }
        }
        playlist
            .pending_videos()
            .into_iter()
            .cloned()
            .collect::<Vec<PlaylistVideo>>()
    });
    let Some(pending) = pending.filter(|videos| !videos.is_empty()) else {
        finish_playlist(&inner, &id);
        return;
    };

    let chunk_size = inner.config.read().max_parallel;
    let poll_interval = inner.config.read().poll_interval();
    info!(
        "Processing {} videos of playlist {} in chunks of {}",
        pending.len(),
        id,
        chunk_size
    );

    for chunk in pending.chunks(chunk_size) {
        if inner.status_of(&id) != Some(PlaylistStatus::Downloading) {
            info!("Playlist {} cancelled, stopping", id);
            return;
        }

        let mut set = JoinSet::new();
        for video in chunk {
            set.spawn(watch_video(
                Arc::clone(&inner),
                id.clone(),
                video.id.clone(),
                video.url.clone(),
                poll_interval,
            ));
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!("Video watcher for playlist {} failed: {}", id, e);
            }
        }
    }

    finish_playlist(&inner, &id);
}

/// Marks a still-downloading playlist `Completed`, whatever its videos did.
fn finish_playlist(inner: &Inner, id: &str) {
    inner.with_playlist(id, |playlist| {
        if playlist.status != PlaylistStatus::Downloading {
            return;
        }
        playlist.downloaded = playlist.completed_videos().len();
        playlist.update_status(PlaylistStatus::Completed, None);
        info!(
            "Playlist {} completed: {}/{} videos downloaded",
            id, playlist.downloaded, playlist.total_videos
        );
    });
}

/// Starts the download of one video and mirrors its task until it settles.
async fn watch_video(
    inner: Arc<Inner>,
    playlist_id: String,
    video_id: String,
    url: String,
    poll_interval: Duration,
) {
    let started = inner.with_playlist(&playlist_id, |playlist| {
        playlist.status == PlaylistStatus::Downloading
            && playlist.video(&video_id).is_some_and(|v| v.status != VideoStatus::Skipped)
            && playlist.update_video_status(&video_id, VideoStatus::Downloading, None)
    });
    if started != Some(true) {
        return;
    }

    let task_id = match inner.downloads.add_task(&url) {
        Ok(task) => task.id,
        Err(Error::Task(TaskError::DuplicateUrl { .. })) => {
            match inner.downloads.find_task_for_video(&url, &video_id) {
                Some(task) => {
                    debug!("Video {} joins existing task {}", video_id, task.id);
                    task.id
                }
                None => {
                    mark_video_failed(&inner, &playlist_id, &video_id, "Download task not found");
                    return;
                }
            }
        }
        Err(e) => {
            warn!("Could not start video {} of playlist {}: {}", video_id, playlist_id, e);
            mark_video_failed(&inner, &playlist_id, &video_id, &e.to_string());
            return;
        }
    };

    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let task = inner.downloads.get_task(&task_id);
        let settled = inner
            .with_playlist(&playlist_id, |playlist| {
                let Some(video) = playlist.video(&video_id) else {
                    return true;
                };
                if video.status == VideoStatus::Skipped {
                    return true;
                }
                let Some(task) = task else {
                    playlist.update_video_status(
                        &video_id,
                        VideoStatus::Error,
                        Some("Download task was removed".to_string()),
                    );
                    return true;
                };

                playlist.update_video_progress(&video_id, task.progress, &task.speed, task.eta_secs);
                let status = VideoStatus::from_task(task.status);
                match task.status {
                    TaskStatus::Completed => {
                        if let Some(path) = task.output_path {
                            playlist.update_video_output(&video_id, path, task.file_size);
                        }
                        playlist.update_video_status(&video_id, status, None);
                        playlist.downloaded = playlist.completed_videos().len();
                        true
                    }
                    TaskStatus::Stopped | TaskStatus::Error => {
                        let error = task
                            .last_error
                            .unwrap_or_else(|| format!("Download {}", task.status.to_string().to_lowercase()));
                        playlist.update_video_status(&video_id, status, Some(error));
                        true
                    }
                    TaskStatus::Pending
                    | TaskStatus::Starting
                    | TaskStatus::Downloading
                    | TaskStatus::Stopping
                    | TaskStatus::Paused => {
                        playlist.update_video_status(&video_id, status, None);
                        false
                    }
                }
            })
            .unwrap_or(true);
        if settled {
            break;
        }
    }
}

fn mark_video_failed(inner: &Inner, playlist_id: &str, video_id: &str, error: &str) {
    inner.with_playlist(playlist_id, |playlist| {
        playlist.update_video_status(video_id, VideoStatus::Error, Some(error.to_string()));
    });
}
