use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a file system operation.
pub type FsResult<T> = Result<T, FsError>;

/// An error that occurred during a file system operation.
///
/// The first ten variants form the closed taxonomy that crosses the
/// [`FileSystem`](crate::FileSystem) interface; everything else surfaces as an
/// I/O error at the FUSE boundary.
#[derive(Debug, Error)]
pub enum FsError {
    /// The path does not exist in the addressed layer.
    #[error("path not found: {0}")]
    NotFound(String),

    /// The path already exists.
    #[error("path already exists: {0}")]
    AlreadyExists(String),

    /// The directory is not empty.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// The path is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// The path is a directory.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// The argument is invalid (bad path, bad mode, negative size).
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// The caller may not access the path.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The filesystem is read-only.
    #[error("filesystem is read-only")]
    ReadOnlyFilesystem,

    /// The operation would cross filesystem layers that cannot share links.
    #[error("cross-device link: {0}")]
    CrossDevice(String),

    /// The operation was cancelled between store calls.
    #[error("operation interrupted")]
    Interrupted,

    /// An error from the delta store.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// An error applying store migrations.
    #[error("store migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// IO error during a filesystem operation.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Custom error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FsError {
    /// Creates a new custom error.
    pub fn custom(error: impl Into<anyhow::Error>) -> FsError {
        FsError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Maps the error to the POSIX errno reported at the FUSE boundary.
    ///
    /// The closed taxonomy maps deterministically; anything outside it
    /// surfaces as `EIO`.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::Invalid(_) => libc::EINVAL,
            FsError::PermissionDenied(_) => libc::EACCES,
            FsError::ReadOnlyFilesystem => libc::EROFS,
            FsError::CrossDevice(_) => libc::EXDEV,
            FsError::Interrupted
            | FsError::Store(_)
            | FsError::Migrate(_)
            | FsError::Io(_)
            | FsError::Custom(_) => libc::EIO,
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_errno_mapping() {
        assert_eq!(FsError::NotFound("/a".into()).to_errno(), libc::ENOENT);
        assert_eq!(FsError::AlreadyExists("/a".into()).to_errno(), libc::EEXIST);
        assert_eq!(FsError::NotEmpty("/a".into()).to_errno(), libc::ENOTEMPTY);
        assert_eq!(FsError::NotADirectory("/a".into()).to_errno(), libc::ENOTDIR);
        assert_eq!(FsError::IsADirectory("/a".into()).to_errno(), libc::EISDIR);
        assert_eq!(FsError::Invalid("bad".into()).to_errno(), libc::EINVAL);
        assert_eq!(
            FsError::PermissionDenied("/a".into()).to_errno(),
            libc::EACCES
        );
        assert_eq!(FsError::ReadOnlyFilesystem.to_errno(), libc::EROFS);
        assert_eq!(FsError::CrossDevice("/a".into()).to_errno(), libc::EXDEV);
        assert_eq!(FsError::Interrupted.to_errno(), libc::EIO);
    }

    #[test]
    fn test_error_custom_is_io() {
        let err = FsError::custom(anyhow::anyhow!("boom"));
        assert_eq!(err.to_errno(), libc::EIO);
    }
}
