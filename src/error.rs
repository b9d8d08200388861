//! VFS error types.
//!
//! Every backend translates its own failures (HTTP status codes, errno values,
//! malformed archives) into [`VfsError`] at the `Root`/`Resource` boundary, so
//! nothing above the backends branches on backend detail.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// VFS error type.
#[derive(Debug, Error)]
pub enum VfsError {
    /// File, directory or remote object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A path component that must be a directory is not one.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a regular file.
    #[error("not a regular file: {0}")]
    NotRegularFile(String),

    /// Not a symbolic link.
    #[error("not a symbolic link: {0}")]
    NotSymlink(String),

    /// Path escapes root (security violation).
    #[error("path escapes root: {0}")]
    PathEscapesRoot(String),

    /// Symlink chain did not converge.
    #[error("too many symbolic links")]
    TooManyLinks,

    /// Symlink target text exceeds the configured maximum.
    #[error("symlink too large: {0}")]
    SymlinkTooLarge(String),

    /// Requested window does not fit inside the resource.
    #[error("invalid range")]
    InvalidRange,

    /// Seek target outside the reader's window.
    #[error("outside of range")]
    OutsideRange,

    /// The remote server ignored or rejected the `Range` header.
    #[error("range requests are not supported by the remote server")]
    RangeRequestsNotSupported,

    /// The remote object changed since the resource was first probed.
    #[error("content has changed since first request")]
    ContentChanged,

    /// Any HTTP status the range protocol does not branch on.
    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),

    /// Response headers the range protocol cannot work with.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Malformed archive.
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// Compression method other than STORED or DEFLATE.
    #[error("unsupported compression method: {0:#x}")]
    UnsupportedCompression(u16),

    /// Invalid path or lookup input.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Seek requested on a stream that cannot seek.
    #[error("file is not seekable")]
    NotSeekable,

    /// The caller went away before the operation finished.
    #[error("operation canceled")]
    Canceled,

    /// The operation ran out of time.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Blob attribute sidecar could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error observed by several waiters of the same operation.
    #[error(transparent)]
    Shared(Arc<VfsError>),
}

impl VfsError {
    /// Create a NotFound error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create a NotRegularFile error.
    pub fn not_regular_file(path: impl Into<String>) -> Self {
        Self::NotRegularFile(path.into())
    }

    /// Create a NotSymlink error.
    pub fn not_symlink(path: impl Into<String>) -> Self {
        Self::NotSymlink(path.into())
    }

    /// Create a PathEscapesRoot error.
    pub fn path_escapes_root(path: impl Into<String>) -> Self {
        Self::PathEscapesRoot(path.into())
    }

    /// Create an InvalidArchive error.
    pub fn invalid_archive(msg: impl Into<String>) -> Self {
        Self::InvalidArchive(msg.into())
    }

    /// Create an InvalidPath error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Maps transport timeouts onto [`VfsError::DeadlineExceeded`].
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            VfsError::DeadlineExceeded
        } else {
            VfsError::Http(err)
        }
    }

    /// Looks through [`VfsError::Shared`] wrappers.
    pub fn inner(&self) -> &VfsError {
        match self {
            VfsError::Shared(e) => e.inner(),
            other => other,
        }
    }

    /// Errors the serving layer surfaces to clients as `404 Not Found`.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.inner(),
            VfsError::NotFound(_)
                | VfsError::NotADirectory(_)
                | VfsError::NotRegularFile(_)
                | VfsError::NotSymlink(_)
                | VfsError::PathEscapesRoot(_)
                | VfsError::TooManyLinks
                | VfsError::SymlinkTooLarge(_)
        )
    }

    /// Client disconnects and timeouts, kept apart from real I/O failures.
    pub fn is_canceled(&self) -> bool {
        match self.inner() {
            VfsError::Canceled | VfsError::DeadlineExceeded => true,
            VfsError::Http(e) => e.is_timeout(),
            VfsError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }

    /// Recovers a [`VfsError`] that crossed an `AsyncRead` boundary.
    pub fn from_io(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<VfsError>()) {
            if let Some(Ok(inner)) = err.into_inner().map(|inner| inner.downcast::<VfsError>()) {
                return *inner;
            }
            return VfsError::Io(io::Error::other("wrapped VFS error lost"));
        }

        match err.kind() {
            io::ErrorKind::NotFound => VfsError::NotFound(err.to_string()),
            io::ErrorKind::NotADirectory => VfsError::NotADirectory(err.to_string()),
            io::ErrorKind::TimedOut => VfsError::DeadlineExceeded,
            _ => VfsError::Io(err),
        }
    }

    /// Wraps a [`VfsError`] so it can travel through `AsyncRead`.
    pub fn into_io(self) -> io::Error {
        match self {
            VfsError::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}

impl From<tokio::time::error::Elapsed> for VfsError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        VfsError::DeadlineExceeded
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_io_error() {
        let err = VfsError::ContentChanged.into_io();
        assert!(matches!(VfsError::from_io(err), VfsError::ContentChanged));
    }

    #[test]
    fn test_plain_io_not_found_maps_to_not_found() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(VfsError::from_io(err).is_not_found());
    }

    #[test]
    fn test_shared_errors_classify_like_their_inner_error() {
        let shared = VfsError::Shared(Arc::new(VfsError::not_found("a.zip")));
        assert!(shared.is_not_found());
        assert!(!shared.is_canceled());

        let shared = VfsError::Shared(Arc::new(VfsError::DeadlineExceeded));
        assert!(shared.is_canceled());
    }

    #[test]
    fn test_symlink_failures_are_not_found_class() {
        assert!(VfsError::TooManyLinks.is_not_found());
        assert!(VfsError::SymlinkTooLarge("x".into()).is_not_found());
        assert!(!VfsError::RangeRequestsNotSupported.is_not_found());
    }
}
