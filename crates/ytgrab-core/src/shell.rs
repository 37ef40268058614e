//! File manager integration.
//!
//! Commands are spawned and never awaited. A failure here is reported to the
//! caller and does not affect any task.

use std::ffi::OsString;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::{debug, warn};

use crate::error::ShellError;

/// Opens files with the desktop shell.
pub trait ShellIntegration: Send + Sync {
    /// Shows `path` selected in the system file manager.
    fn reveal_in_file_manager(&self, path: &Path) -> Result<(), ShellError>;

    /// Opens `path` with its default application.
    fn open_with_default_app(&self, path: &Path) -> Result<(), ShellError>;
}

/// A platform command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    /// Executable name.
    pub program: &'static str,
    /// Arguments.
    pub args: Vec<OsString>,
}

/// Command that reveals `path` in the file manager.
///
/// Linux file managers have no common "select" flag, so the parent directory
/// is opened instead.
#[must_use]
pub fn reveal_command(path: &Path) -> Option<ShellCommand> {
    if cfg!(target_os = "macos") {
        Some(ShellCommand {
            program: "open",
            args: vec!["-R".into(), path.into()],
        })
    } else if cfg!(target_os = "windows") {
        let mut select = OsString::from("/select,");
        select.push(path);
        Some(ShellCommand {
            program: "explorer",
            args: vec![select],
        })
    } else if cfg!(unix) {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(path);
        Some(ShellCommand {
            program: "xdg-open",
            args: vec![dir.into()],
        })
    } else {
        None
    }
}

/// Command that opens `path` with its default application.
#[must_use]
pub fn open_command(path: &Path) -> Option<ShellCommand> {
    if cfg!(target_os = "macos") {
        Some(ShellCommand {
            program: "open",
            args: vec![path.into()],
        })
    } else if cfg!(target_os = "windows") {
        Some(ShellCommand {
            program: "cmd",
            args: vec!["/C".into(), "start".into(), "".into(), path.into()],
        })
    } else if cfg!(unix) {
        Some(ShellCommand {
            program: "xdg-open",
            args: vec![path.into()],
        })
    } else {
        None
    }
}

/// [`ShellIntegration`] using the platform's own commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemShell;

impl SystemShell {
    fn spawn(path: &Path, command: Option<ShellCommand>) -> Result<(), ShellError> {
        if !path.exists() {
            return Err(ShellError::PathNotFound {
                path: path.to_path_buf(),
            });
        }
        let command = command.ok_or(ShellError::Unsupported)?;
        debug!("Running {} {:?}", command.program, command.args);

        Command::new(command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(drop)
            .map_err(|e| {
                warn!("Failed to run {}: {}", command.program, e);
                ShellError::CommandFailed {
                    program: command.program,
                    reason: e.to_string(),
                }
            })
    }
}

impl ShellIntegration for SystemShell {
    fn reveal_in_file_manager(&self, path: &Path) -> Result<(), ShellError> {
        Self::spawn(path, reveal_command(path))
    }

    fn open_with_default_app(&self, path: &Path) -> Result<(), ShellError> {
        Self::spawn(path, open_command(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_path_is_rejected() {
        let result = SystemShell.reveal_in_file_manager(Path::new("/nonexistent/ytgrab/file.mp4"));
        assert!(matches!(result, Err(ShellError::PathNotFound { .. })));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linux_reveal_opens_parent() {
        let command = reveal_command(Path::new("/videos/clip.mp4")).expect("command");
        assert_eq!(command.program, "xdg-open");
        assert_eq!(command.args, vec![OsString::from("/videos")]);

        let command = open_command(Path::new("/videos/clip.mp4")).expect("command");
        assert_eq!(command.args, vec![OsString::from("/videos/clip.mp4")]);
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn test_macos_reveal_selects_file() {
        let command = reveal_command(Path::new("/videos/clip.mp4")).expect("command");
        assert_eq!(command.program, "open");
        assert_eq!(command.args[0], OsString::from("-R"));
    }
}
