//! Fake engines and helpers shared by unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::download::DownloadConfig;
use crate::engine::{DownloadEngine, DownloadRequest, EngineOutput, ProgressCallback, ProgressSample};
use crate::error::EngineError;

/// Engine whose downloads block until released or cancelled.
#[derive(Default)]
pub struct GatedEngine {
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    failures: Mutex<HashMap<String, String>>,
    samples: Mutex<HashMap<String, Vec<ProgressSample>>>,
    running: AtomicUsize,
    pub started: AtomicUsize,
    pub max_running: AtomicUsize,
}

impl GatedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn gate(&self, url: &str) -> Arc<Notify> {
        Arc::clone(self.gates.lock().entry(url.to_string()).or_default())
    }

    /// Lets the download of `url` finish.
    pub fn release(&self, url: &str) {
        self.gate(url).notify_one();
    }

    /// Makes the download of `url` fail with `message` once released.
    pub fn fail_with(&self, url: &str, message: &str) {
        self.failures
            .lock()
            .insert(url.to_string(), message.to_string());
    }

    /// Replaces the default progress sample for `url`.
    pub fn with_samples(&self, url: &str, samples: Vec<ProgressSample>) {
        self.samples.lock().insert(url.to_string(), samples);
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DownloadEngine for GatedEngine {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn download(
        &self,
        request: &DownloadRequest,
        progress: ProgressCallback,
        cancel: CancellationToken,
    ) -> Result<EngineOutput, EngineError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);

        let samples = self.samples.lock().get(&request.url).cloned().unwrap_or_else(|| {
            vec![ProgressSample {
                downloaded_bytes: 512,
                total_bytes: 1024,
                title: Some(format!("Video {}", request.video_id)),
                ..ProgressSample::default()
            }]
        });
        for sample in samples {
            progress(sample);
        }

        let gate = self.gate(&request.url);
        let outcome = tokio::select! {
            () = cancel.cancelled() => Err(EngineError::Cancelled),
            () = gate.notified() => match self.failures.lock().get(&request.url) {
                Some(message) => Err(EngineError::Failed(message.clone())),
                None => Ok(EngineOutput {
                    output_path: None,
                    title: Some(format!("Video {}", request.video_id)),
                    duration_label: Some("3:33".to_string()),
                }),
            },
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Engine that fails every download immediately.
pub struct FailingEngine {
    pub message: String,
}

#[async_trait]
impl DownloadEngine for FailingEngine {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn download(
        &self,
        _request: &DownloadRequest,
        _progress: ProgressCallback,
        _cancel: CancellationToken,
    ) -> Result<EngineOutput, EngineError> {
        Err(EngineError::Failed(self.message.clone()))
    }
}

/// Fast-settling configuration for tests.
pub fn test_config(max_parallel: usize) -> DownloadConfig {
    DownloadConfig {
        max_parallel_downloads: max_parallel,
        smoothing_window_ms: 20,
        max_retries: 0,
        retry_backoff_ms: 1,
        ..DownloadConfig::default()
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Writes an executable shell script standing in for `yt-dlp`.
#[cfg(unix)]
pub fn fake_ytdlp(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("yt-dlp");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("make script executable");
    path
}
