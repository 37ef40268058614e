//! Error types for ytgrab core operations.
//!
//! Errors are grouped by domain:
//! - [`TaskError`] for download registry validation
//! - [`PlaylistError`] for the playlist coordinator and metadata source
//! - [`CompressionError`] for the compression registry
//! - [`EngineError`] for failures reported by the external download/encode tools
//! - [`FileSystemError`] for file operations
//! - [`ShellError`] for file manager integration
//!
//! Validation errors are returned synchronously to the caller. Engine errors
//! never surface through this type at the service boundary: they are recorded
//! on the task itself and delivered through the update sink.

use std::path::PathBuf;

use thiserror::Error;

use crate::status::{PlaylistStatus, TaskStatus};

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ytgrab core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Download registry error.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Playlist coordinator error.
    #[error(transparent)]
    Playlist(#[from] PlaylistError),

    /// Compression registry error.
    #[error(transparent)]
    Compression(#[from] CompressionError),

    /// External engine error.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// File system operation failed.
    #[error(transparent)]
    FileSystem(#[from] FileSystemError),

    /// Shell integration failed.
    #[error(transparent)]
    Shell(#[from] ShellError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Download registry validation errors.
#[derive(Debug, Error)]
pub enum TaskError {
    /// No task with this id exists.
    #[error("task not found: {id}")]
    NotFound {
        /// Requested task id.
        id: String,
    },

    /// A non-finished task already owns this URL.
    #[error("task already exists for URL: {url}")]
    DuplicateUrl {
        /// The duplicated URL.
        url: String,
    },

    /// The requested action is not allowed from the task's current status.
    #[error("cannot {action} task {id} in status {status}")]
    InvalidTransition {
        /// Task id.
        id: String,
        /// Current status.
        status: TaskStatus,
        /// Attempted action.
        action: &'static str,
    },

    /// The URL is empty or malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
    },
}

/// Playlist errors.
#[derive(Debug, Error)]
pub enum PlaylistError {
    /// No playlist with this id is registered.
    #[error("playlist not found: {id}")]
    NotFound {
        /// Playlist id.
        id: String,
    },

    /// A playlist with this id is already registered.
    #[error("playlist already exists: {id}")]
    AlreadyExists {
        /// Playlist id.
        id: String,
    },

    /// The playlist cannot be downloaded in its current state.
    #[error("playlist {id} is not ready for download (status: {status}, videos: {videos})")]
    NotReady {
        /// Playlist id.
        id: String,
        /// Current status.
        status: PlaylistStatus,
        /// Number of videos.
        videos: usize,
    },

    /// The URL does not reference a playlist.
    #[error("not a playlist URL: {url}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
    },

    /// The metadata tool failed or returned nothing usable.
    #[error("failed to fetch playlist {url}: {reason}")]
    FetchFailed {
        /// Playlist URL.
        url: String,
        /// Failure description.
        reason: String,
    },

    /// The metadata tool did not finish in time.
    #[error("timed out fetching playlist {url} after {seconds}s")]
    Timeout {
        /// Playlist URL.
        url: String,
        /// Timeout that elapsed.
        seconds: u64,
    },
}

/// Compression registry errors.
#[derive(Debug, Error)]
pub enum CompressionError {
    /// No compression task with this id exists.
    #[error("compression task not found: {id}")]
    NotFound {
        /// Task id.
        id: String,
    },

    /// A non-finished compression already targets this input.
    #[error("compression already in progress for file: {}", path.display())]
    AlreadyInProgress {
        /// Input path.
        path: PathBuf,
    },

    /// The input file does not exist.
    #[error("input file does not exist: {}", path.display())]
    InputNotFound {
        /// Input path.
        path: PathBuf,
    },

    /// The task is not running, so it cannot be stopped.
    #[error("compression task is not active: {id}")]
    NotActive {
        /// Task id.
        id: String,
    },
}

/// Failures reported by the external download and encode tools.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The tool could not be started.
    #[error("failed to start {program}: {reason}")]
    Spawn {
        /// Program name.
        program: String,
        /// Failure description.
        reason: String,
    },

    /// The tool ran and reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The invocation was cancelled through its cancellation token.
    #[error("cancelled")]
    Cancelled,

    /// The invocation exceeded its time limit.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// Operation name.
        operation: &'static str,
        /// Timeout that elapsed.
        seconds: u64,
    },

    /// Media duration could not be determined.
    #[error("failed to probe duration: {0}")]
    Probe(String),

    /// IO error while talking to the tool or writing output.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// File system errors.
#[derive(Debug, Error)]
pub enum FileSystemError {
    /// Reading a file failed.
    #[error("failed to read {}: {reason}", path.display())]
    ReadFailed {
        /// Path being read.
        path: PathBuf,
        /// Failure description.
        reason: String,
    },

    /// Writing a file failed.
    #[error("failed to write {}: {reason}", path.display())]
    WriteFailed {
        /// Path being written.
        path: PathBuf,
        /// Failure description.
        reason: String,
    },

    /// Creating a directory failed.
    #[error("failed to create directory {}: {reason}", path.display())]
    CreateDirFailed {
        /// Directory path.
        path: PathBuf,
        /// Failure description.
        reason: String,
    },
}

/// Failures opening or revealing files with the desktop shell.
#[derive(Debug, Error)]
pub enum ShellError {
    /// The path does not exist.
    #[error("path does not exist: {}", path.display())]
    PathNotFound {
        /// Requested path.
        path: PathBuf,
    },

    /// The platform command could not be started.
    #[error("failed to run {program}: {reason}")]
    CommandFailed {
        /// Program name.
        program: &'static str,
        /// Failure description.
        reason: String,
    },

    /// No file manager integration exists for this platform.
    #[error("shell integration is not supported on this platform")]
    Unsupported,
}
