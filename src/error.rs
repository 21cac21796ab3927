use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, BrowserError>;

/// Errors surfaced by the tree store and the browser controller.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// The path does not exist.
    #[error("Not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The path exists but could not be read.
    #[error("Permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    /// A directory operation was requested on a file.
    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    /// Filesystem change notification is not available on this platform.
    #[error("Watching unavailable: {0}")]
    WatchUnavailable(String),

    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid path provided by the user.
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl BrowserError {
    /// Classify an I/O error raised while touching `path`.
    pub fn from_io(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => BrowserError::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => BrowserError::PermissionDenied(path.to_path_buf()),
            _ => BrowserError::Io(err),
        }
    }
}

impl From<notify::Error> for BrowserError {
    fn from(err: notify::Error) -> Self {
        BrowserError::WatchUnavailable(err.to_string())
    }
}
