//! Filesystem error types.

use std::io;
use thiserror::Error;

/// Error type shared by every filesystem and file handle.
#[derive(Debug, Error)]
pub enum VfsError {
    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Permission denied, including operations a handle refuses to support.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Handle has already been closed.
    #[error("file already closed: {0}")]
    Closed(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// Seek to a negative or otherwise unrepresentable offset.
    #[error("invalid seek: {0}")]
    InvalidSeek(String),

    /// Offset or length outside the valid range.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Path escapes the filesystem root.
    #[error("path escapes root: {0}")]
    PathEscapesRoot(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create a Closed error.
    pub fn closed(path: impl Into<String>) -> Self {
        Self::Closed(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create a DirectoryNotEmpty error.
    pub fn directory_not_empty(path: impl Into<String>) -> Self {
        Self::DirectoryNotEmpty(path.into())
    }

    /// Create an InvalidSeek error.
    pub fn invalid_seek(msg: impl Into<String>) -> Self {
        Self::InvalidSeek(msg.into())
    }

    /// Create a PathEscapesRoot error.
    pub fn path_escapes_root(path: impl Into<String>) -> Self {
        Self::PathEscapesRoot(path.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Map an `io::Error` to the matching predicate variant where one
    /// exists, so callers can branch on kind across backends.
    pub fn from_io(path: impl Into<String>, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.into()),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.into()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.into()),
            _ => Self::Io(err),
        }
    }

    /// Returns true for the not-found predicate, however it was produced.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Returns true for the already-exists predicate.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::AlreadyExists(_) => true,
            Self::Io(e) => e.kind() == io::ErrorKind::AlreadyExists,
            _ => false,
        }
    }

    /// Prefix a resource error with the stage that failed. Predicate and
    /// permission errors pass through untouched so callers can still
    /// branch on them.
    pub fn context(self, msg: &str) -> Self {
        match self {
            e @ (Self::NotFound(_)
            | Self::AlreadyExists(_)
            | Self::PermissionDenied(_)
            | Self::Closed(_)
            | Self::IsADirectory(_)
            | Self::NotADirectory(_)
            | Self::DirectoryNotEmpty(_)) => e,
            e if e.is_not_found() || e.is_already_exists() => e,
            e => Self::Other(format!("{msg}: {e}")),
        }
    }
}

/// Convert VfsError to std::io::Error for compatibility.
impl From<VfsError> for io::Error {
    fn from(e: VfsError) -> Self {
        match e {
            VfsError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VfsError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            VfsError::PermissionDenied(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            VfsError::Closed(msg) => io::Error::other(format!("file already closed: {msg}")),
            VfsError::IsADirectory(msg) => io::Error::new(io::ErrorKind::IsADirectory, msg),
            VfsError::NotADirectory(msg) => io::Error::new(io::ErrorKind::NotADirectory, msg),
            VfsError::DirectoryNotEmpty(msg) => {
                io::Error::new(io::ErrorKind::DirectoryNotEmpty, msg)
            }
            VfsError::InvalidSeek(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VfsError::OutOfRange(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VfsError::PathEscapesRoot(msg) => {
                io::Error::new(io::ErrorKind::PermissionDenied, msg)
            }
            VfsError::Io(e) => e,
            VfsError::Other(msg) => io::Error::other(msg),
        }
    }
}

/// Result type shared by every filesystem operation.
pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_helpers() {
        assert!(VfsError::not_found("a.txt").is_not_found());
        assert!(VfsError::Io(io::Error::new(io::ErrorKind::NotFound, "gone")).is_not_found());
        assert!(!VfsError::other("boom").is_not_found());
        assert!(VfsError::already_exists("a.txt").is_already_exists());
    }

    #[test]
    fn context_leaves_predicates_alone() {
        let e = VfsError::not_found("a.txt").context("error opening base file");
        assert!(e.is_not_found());

        let e = VfsError::other("disk on fire").context("error copying base to cache");
        assert_eq!(
            e.to_string(),
            "error copying base to cache: disk on fire"
        );
    }

    #[test]
    fn io_mapping_round_trip() {
        let e = VfsError::from_io("a.txt", io::Error::new(io::ErrorKind::NotFound, "x"));
        assert!(e.is_not_found());
        let back: io::Error = e.into();
        assert_eq!(back.kind(), io::ErrorKind::NotFound);
    }
}
