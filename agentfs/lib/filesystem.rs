use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{DirEntry, FsError, FsResult, FsStats, Stats};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A trait that defines the interface for a filesystem layer.
///
/// The base layer, the delta layer and the merged overlay all expose this
/// interface; the FUSE adapter and the workspace import/export walks consume
/// it. Paths are virtual, absolute, and normalized lexically (see
/// [`crate::path`]). Every operation takes a [`CancellationToken`] and must
/// observe it between distinct store calls; in-flight store transactions are
/// allowed to complete.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Returns file metadata, following symlinks.
    async fn stat(&self, ctx: &CancellationToken, path: &str) -> FsResult<Stats>;

    /// Returns file metadata without following symlinks.
    async fn lstat(&self, ctx: &CancellationToken, path: &str) -> FsResult<Stats>;

    /// Returns the target of a symbolic link.
    async fn readlink(&self, ctx: &CancellationToken, path: &str) -> FsResult<String>;

    /// Returns filesystem statistics.
    async fn statfs(&self, ctx: &CancellationToken) -> FsResult<FsStats>;

    /// Returns the entries of a directory.
    async fn readdir(&self, ctx: &CancellationToken, path: &str) -> FsResult<Vec<DirEntry>>;

    /// Creates a directory.
    ///
    /// ## Errors
    ///
    /// Returns `AlreadyExists` if an entry with the same name exists, and
    /// `NotFound` if the parent directory does not.
    async fn mkdir(&self, ctx: &CancellationToken, path: &str, mode: u32) -> FsResult<()>;

    /// Removes an empty directory.
    ///
    /// ## Errors
    ///
    /// Returns `NotADirectory` if the target is not a directory and
    /// `NotEmpty` if it still has children.
    async fn rmdir(&self, ctx: &CancellationToken, path: &str) -> FsResult<()>;

    /// Creates a new regular file and returns an open handle plus its stats.
    async fn create(
        &self,
        ctx: &CancellationToken,
        path: &str,
        mode: u32,
    ) -> FsResult<(Box<dyn File>, Stats)>;

    /// Opens an existing file.
    ///
    /// `flags` follows the POSIX open flag encoding (`O_RDONLY`, `O_WRONLY`,
    /// `O_RDWR`, `O_TRUNC`, `O_APPEND`).
    async fn open(&self, ctx: &CancellationToken, path: &str, flags: i32)
        -> FsResult<Box<dyn File>>;

    /// Removes a file or symlink (not a directory).
    ///
    /// ## Errors
    ///
    /// Returns `IsADirectory` if the target is a directory.
    async fn remove(&self, ctx: &CancellationToken, path: &str) -> FsResult<()>;

    /// Renames or moves a file or directory.
    ///
    /// If the destination exists it is replaced; a non-empty destination
    /// directory fails with `NotEmpty`.
    async fn rename(
        &self,
        ctx: &CancellationToken,
        old_path: &str,
        new_path: &str,
    ) -> FsResult<()>;

    /// Changes permission bits, preserving the file type bits.
    async fn chmod(&self, ctx: &CancellationToken, path: &str, mode: u32) -> FsResult<()>;

    /// Changes file ownership.
    async fn chown(&self, ctx: &CancellationToken, path: &str, uid: u32, gid: u32)
        -> FsResult<()>;

    /// Changes the file size.
    async fn truncate(&self, ctx: &CancellationToken, path: &str, size: u64) -> FsResult<()>;

    /// Updates access and modification times.
    ///
    /// Absent values leave the corresponding time unchanged; the
    /// status-change time always advances.
    async fn utimens(
        &self,
        ctx: &CancellationToken,
        path: &str,
        atime: Option<i64>,
        mtime: Option<i64>,
    ) -> FsResult<()>;

    /// Creates a symbolic link at `link_path` pointing at `target`.
    async fn symlink(&self, ctx: &CancellationToken, target: &str, link_path: &str)
        -> FsResult<()>;

    /// Creates a hard link to `old_path` at `new_path`.
    ///
    /// ## Errors
    ///
    /// Returns `IsADirectory` if the source is a directory.
    async fn link(&self, ctx: &CancellationToken, old_path: &str, new_path: &str)
        -> FsResult<()>;

    /// Checks whether the path is accessible with the given mode.
    async fn access(&self, ctx: &CancellationToken, path: &str, mode: u32) -> FsResult<()>;
}

/// An open file handle.
///
/// Reads and writes are offset-addressed and do not carry a cursor. Handles
/// use interior locking so they can be shared behind an `Arc`.
#[async_trait]
pub trait File: Send + Sync {
    /// Reads up to `buf.len()` bytes at the given offset, returning the number
    /// of bytes read. A short count means end-of-file.
    async fn read(&self, ctx: &CancellationToken, buf: &mut [u8], offset: u64) -> FsResult<usize>;

    /// Writes the data at the given offset, returning the number of bytes
    /// written.
    async fn write(&self, ctx: &CancellationToken, data: &[u8], offset: u64) -> FsResult<usize>;

    /// Flushes any buffered data to storage.
    async fn sync(&self, ctx: &CancellationToken) -> FsResult<()>;

    /// Closes the handle.
    async fn close(&self) -> FsResult<()>;

    /// Returns the file's current metadata.
    async fn stat(&self, ctx: &CancellationToken) -> FsResult<Stats>;

    /// Changes the file size.
    async fn truncate(&self, ctx: &CancellationToken, size: u64) -> FsResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Fails with [`FsError::Interrupted`] once the token has been cancelled.
///
/// Operations call this between distinct store calls; a transaction that has
/// already begun runs to completion.
pub fn check_cancelled(ctx: &CancellationToken) -> FsResult<()> {
    if ctx.is_cancelled() {
        Err(FsError::Interrupted)
    } else {
        Ok(())
    }
}

/// Returns true if the open flags request write access.
pub fn flags_want_write(flags: i32) -> bool {
    flags & (libc::O_WRONLY | libc::O_RDWR | libc::O_TRUNC | libc::O_APPEND) != 0
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_want_write() {
        assert!(!flags_want_write(libc::O_RDONLY));
        assert!(flags_want_write(libc::O_WRONLY));
        assert!(flags_want_write(libc::O_RDWR));
        assert!(flags_want_write(libc::O_RDONLY | libc::O_TRUNC));
        assert!(flags_want_write(libc::O_WRONLY | libc::O_APPEND));
    }

    #[test]
    fn test_check_cancelled() {
        let ctx = CancellationToken::new();
        assert!(check_cancelled(&ctx).is_ok());
        ctx.cancel();
        assert!(matches!(check_cancelled(&ctx), Err(FsError::Interrupted)));
    }
}
