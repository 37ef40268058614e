//! ytgrab - download videos and playlists, compress media files.
//!
//! This is the command line entry point. All task orchestration lives in
//! `ytgrab-core`; this binary wires the services together, prints every
//! update and stops running tasks on Ctrl-C.

mod cli;
mod logging;
mod output;

use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::Mutex;
use tracing::{error, info, warn};
use ytgrab_core::{
    AppConfig, CompressionService, DownloadEngine, DownloadService, FfmpegEncoder,
    PlaylistCoordinator, PlaylistStatus, RustyYtdlEngine, ShellIntegration, SystemShell,
    TaskId, TaskStatus, YtDlpEngine, YtDlpPlaylistSource, ensure_directory,
};

use crate::cli::{Cli, Command, EngineKind};
use crate::logging::LoggingConfig;
use crate::output::{OutputMode, playlist_summary};

/// How often the front-end checks whether all tasks have settled.
const SETTLE_POLL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut logging_config = LoggingConfig::auto();
    if cli.verbose {
        logging_config = logging_config.with_console_level(tracing::Level::DEBUG);
    }
    if !std::io::stderr().is_terminal() {
        logging_config = logging_config.without_ansi();
    }
    let _guard = match logging::init(&logging_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("warning: file logging disabled: {e}");
            logging::init(&logging_config.without_file()).ok()
        }
    };

    info!("Starting ytgrab {}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Runs the selected command. Returns false if any task failed.
async fn run(cli: Cli) -> ytgrab_core::Result<bool> {
    let mut config = AppConfig::load()?;
    cli.apply_overrides(&mut config);
    let mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let reveal = cli.reveal_enabled(&config);

    match cli.command {
        Command::Download { ref urls } => {
            let downloads = download_service(cli.engine, &config)?;
            let finished = track_downloads(&downloads, mode);
            for url in urls {
                if let Err(e) = downloads.add_task(url) {
                    eprintln!("{url}: {e}");
                }
            }
            wait_until_settled(|| !downloads.has_unfinished_tasks(), || {
                downloads.stop_all();
            })
            .await;
            Ok(finish_downloads(&downloads, &finished, reveal))
        }
        Command::Playlist { ref url } => {
            let downloads = download_service(cli.engine, &config)?;
            let finished = track_downloads(&downloads, mode);
            let coordinator = PlaylistCoordinator::new(downloads.clone(), config.playlist.clone());
            let source = YtDlpPlaylistSource::new().with_timeout(config.playlist.fetch_timeout());

            let playlist = coordinator.fetch_and_add(&source, url).await?;
            println!(
                "Playlist '{}': {} videos",
                playlist.title, playlist.total_videos
            );

            let id = playlist.id.clone();
            wait_until_settled(
                || {
                    coordinator.get_playlist(&id).is_some_and(|p| {
                        matches!(p.status, PlaylistStatus::Completed | PlaylistStatus::Error)
                    }) && !downloads.has_unfinished_tasks()
                },
                || {
                    if let Err(e) = coordinator.cancel_playlist(&id) {
                        warn!("Failed to cancel playlist {}: {}", id, e);
                    }
                    downloads.stop_all();
                },
            )
            .await;

            if let Some(playlist) = coordinator.get_playlist(&id) {
                println!("{}", playlist_summary(&playlist));
            }
            Ok(finish_downloads(&downloads, &finished, reveal))
        }
        Command::Compress { ref files } => {
            let encoder = FfmpegEncoder::from_config(&config.compression);
            let service = CompressionService::new(Arc::new(encoder), &config.compression);
            service.set_update_callback(move |task| println!("{}", mode.compression(task)));

            for file in files {
                if let Err(e) = service.start_compression(file) {
                    eprintln!("{}: {e}", file.display());
                }
            }
            wait_until_settled(|| !service.has_active_tasks(), || {
                for task in service.get_all_tasks() {
                    if task.status.is_active() {
                        let _ = service.stop_compression(&task.id);
                    }
                }
            })
            .await;

            let tasks = service.get_all_tasks();
            if reveal && let Some(last) = tasks.iter().rev().find(|t| t.status == TaskStatus::Completed) {
                reveal_path(&last.output_path);
            }
            Ok(tasks.len() == files.len() && tasks.iter().all(|t| t.status == TaskStatus::Completed))
        }
    }
}

fn download_service(engine: EngineKind, config: &AppConfig) -> ytgrab_core::Result<DownloadService> {
    ensure_directory(&config.download_directory)?;
    let engine: Arc<dyn DownloadEngine> = match engine {
        EngineKind::YtDlp => Arc::new(YtDlpEngine::new()),
        EngineKind::Native => Arc::new(RustyYtdlEngine::new()),
    };
    Ok(DownloadService::new(
        engine,
        config.download_directory.clone(),
        config.download.clone(),
    ))
}

/// Prints every update and collects the paths of completed downloads.
fn track_downloads(downloads: &DownloadService, mode: OutputMode) -> Arc<Mutex<Vec<PathBuf>>> {
    let finished: Arc<Mutex<Vec<PathBuf>>> = Arc::default();
    let sink = Arc::clone(&finished);
    let last_lines: Mutex<HashMap<TaskId, String>> = Mutex::default();
    downloads.set_update_callback(move |task| {
        let line = mode.download(task);
        // The smoother republishes unchanged values.
        if last_lines.lock().insert(task.id.clone(), line.clone()).as_ref() == Some(&line) {
            return;
        }
        println!("{line}");
        if task.status == TaskStatus::Completed
            && let Some(path) = &task.output_path
        {
            sink.lock().push(path.clone());
        }
    });
    finished
}

fn finish_downloads(downloads: &DownloadService, finished: &Mutex<Vec<PathBuf>>, reveal: bool) -> bool {
    if reveal && let Some(path) = finished.lock().last() {
        reveal_path(path);
    }
    let tasks = downloads.get_all_tasks();
    let ok = tasks.iter().all(|t| t.status == TaskStatus::Completed);
    info!(
        "{} of {} downloads completed",
        tasks.iter().filter(|t| t.status == TaskStatus::Completed).count(),
        tasks.len()
    );
    ok
}

fn reveal_path(path: &std::path::Path) {
    if let Err(e) = SystemShell.reveal_in_file_manager(path) {
        warn!("Could not reveal {}: {}", path.display(), e);
    }
}

/// Polls `settled` until it holds. The first Ctrl-C calls `interrupt` and
/// keeps waiting for the tasks to wind down; a second one exits immediately.
async fn wait_until_settled(mut settled: impl FnMut() -> bool, interrupt: impl FnOnce()) {
    let mut interrupt = Some(interrupt);
    let mut listening = true;
    let mut ticker = tokio::time::interval(SETTLE_POLL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if settled() {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c(), if listening => {
                if let Err(e) = signal {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                    listening = false;
                    continue;
                }
                match interrupt.take() {
                    Some(interrupt) => {
                        eprintln!("Stopping... press Ctrl-C again to exit immediately");
                        interrupt();
                    }
                    None => break,
                }
            }
        }
    }
}
