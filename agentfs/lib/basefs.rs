use std::{
    io,
    os::unix::fs::{FileExt, MetadataExt},
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    check_cancelled,
    filesystem::{File, FileSystem},
    flags_want_write,
    path::normalize_path,
    DirEntry, FsError, FsResult, FsStats, Stats,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The read-only base layer: a passthrough over a host directory tree.
///
/// Every virtual path is normalized, joined onto the root and verified to
/// still be contained by it; escapes resolve to a permission error. All
/// mutating operations return [`FsError::ReadOnlyFilesystem`]; the overlay
/// never calls them, but the adapter is permitted to refuse.
#[derive(Debug, Clone)]
pub struct BaseFs {
    root: PathBuf,
}

/// A positionless read handle over a host file.
pub struct BaseFile {
    file: Mutex<std::fs::File>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BaseFs {
    /// Creates a base layer rooted at the given host directory.
    pub fn new(root: impl AsRef<Path>) -> FsResult<Self> {
        let root = root.as_ref().canonicalize().map_err(map_io)?;
        let meta = std::fs::metadata(&root).map_err(map_io)?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory(root.display().to_string()));
        }
        Ok(Self { root })
    }

    /// Returns the host root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a virtual path to a host path, refusing escapes.
    fn resolve(&self, path: &str) -> FsResult<PathBuf> {
        let normalized = normalize_path(path);
        let full = self.root.join(normalized.trim_start_matches('/'));
        if !full.starts_with(&self.root) {
            return Err(FsError::PermissionDenied(path.to_string()));
        }
        Ok(full)
    }

    async fn symlink_metadata(&self, path: &str) -> FsResult<std::fs::Metadata> {
        let host_path = self.resolve(path)?;
        tokio::fs::symlink_metadata(&host_path)
            .await
            .map_err(|err| map_io_at(err, path))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl FileSystem for BaseFs {
    async fn stat(&self, ctx: &CancellationToken, path: &str) -> FsResult<Stats> {
        check_cancelled(ctx)?;
        let host_path = self.resolve(path)?;
        let meta = tokio::fs::metadata(&host_path)
            .await
            .map_err(|err| map_io_at(err, path))?;
        Ok(metadata_to_stats(&meta))
    }

    async fn lstat(&self, ctx: &CancellationToken, path: &str) -> FsResult<Stats> {
        check_cancelled(ctx)?;
        let meta = self.symlink_metadata(path).await?;
        Ok(metadata_to_stats(&meta))
    }

    async fn readlink(&self, ctx: &CancellationToken, path: &str) -> FsResult<String> {
        check_cancelled(ctx)?;
        let meta = self.symlink_metadata(path).await?;
        if !meta.file_type().is_symlink() {
            return Err(FsError::Invalid(format!("not a symlink: {path}")));
        }
        let host_path = self.resolve(path)?;
        let target = tokio::fs::read_link(&host_path)
            .await
            .map_err(|err| map_io_at(err, path))?;
        Ok(target.to_string_lossy().into_owned())
    }

    async fn statfs(&self, ctx: &CancellationToken) -> FsResult<FsStats> {
        check_cancelled(ctx)?;
        let stat = nix::sys::statvfs::statvfs(&self.root)
            .map_err(|err| FsError::Io(io::Error::from_raw_os_error(err as i32)))?;
        Ok(FsStats {
            blocks: stat.blocks(),
            bfree: stat.blocks_free(),
            bavail: stat.blocks_available(),
            files: stat.files(),
            ffree: stat.files_free(),
            bsize: stat.block_size() as u32,
            namelen: stat.name_max() as u32,
        })
    }

    async fn readdir(&self, ctx: &CancellationToken, path: &str) -> FsResult<Vec<DirEntry>> {
        check_cancelled(ctx)?;
        let host_path = self.resolve(path)?;

        let mut dir = tokio::fs::read_dir(&host_path)
            .await
            .map_err(|err| map_io_at(err, path))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|err| map_io_at(err, path))? {
            // Skip entries we cannot stat or whose names are not valid UTF-8.
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(meta) = tokio::fs::symlink_metadata(entry.path()).await else {
                continue;
            };
            entries.push(DirEntry {
                name,
                mode: meta.mode(),
                ino: meta.ino(),
            });
        }
        Ok(entries)
    }

    async fn mkdir(&self, _ctx: &CancellationToken, _path: &str, _mode: u32) -> FsResult<()> {
        Err(FsError::ReadOnlyFilesystem)
    }

    async fn rmdir(&self, _ctx: &CancellationToken, _path: &str) -> FsResult<()> {
        Err(FsError::ReadOnlyFilesystem)
    }

    async fn create(
        &self,
        _ctx: &CancellationToken,
        _path: &str,
        _mode: u32,
    ) -> FsResult<(Box<dyn File>, Stats)> {
        Err(FsError::ReadOnlyFilesystem)
    }

    async fn open(
        &self,
        ctx: &CancellationToken,
        path: &str,
        flags: i32,
    ) -> FsResult<Box<dyn File>> {
        check_cancelled(ctx)?;
        if flags_want_write(flags) {
            return Err(FsError::ReadOnlyFilesystem);
        }

        let host_path = self.resolve(path)?;
        let file = tokio::fs::File::open(&host_path)
            .await
            .map_err(|err| map_io_at(err, path))?
            .into_std()
            .await;

        Ok(Box::new(BaseFile {
            file: Mutex::new(file),
        }))
    }

    async fn remove(&self, _ctx: &CancellationToken, _path: &str) -> FsResult<()> {
        Err(FsError::ReadOnlyFilesystem)
    }

    async fn rename(
        &self,
        _ctx: &CancellationToken,
        _old_path: &str,
        _new_path: &str,
    ) -> FsResult<()> {
        Err(FsError::ReadOnlyFilesystem)
    }

    async fn chmod(&self, _ctx: &CancellationToken, _path: &str, _mode: u32) -> FsResult<()> {
        Err(FsError::ReadOnlyFilesystem)
    }

    async fn chown(
        &self,
        _ctx: &CancellationToken,
        _path: &str,
        _uid: u32,
        _gid: u32,
    ) -> FsResult<()> {
        Err(FsError::ReadOnlyFilesystem)
    }

    async fn truncate(&self, _ctx: &CancellationToken, _path: &str, _size: u64) -> FsResult<()> {
        Err(FsError::ReadOnlyFilesystem)
    }

    async fn utimens(
        &self,
        _ctx: &CancellationToken,
        _path: &str,
        _atime: Option<i64>,
        _mtime: Option<i64>,
    ) -> FsResult<()> {
        Err(FsError::ReadOnlyFilesystem)
    }

    async fn symlink(
        &self,
        _ctx: &CancellationToken,
        _target: &str,
        _link_path: &str,
    ) -> FsResult<()> {
        Err(FsError::ReadOnlyFilesystem)
    }

    async fn link(
        &self,
        _ctx: &CancellationToken,
        _old_path: &str,
        _new_path: &str,
    ) -> FsResult<()> {
        Err(FsError::ReadOnlyFilesystem)
    }

    async fn access(&self, ctx: &CancellationToken, path: &str, _mode: u32) -> FsResult<()> {
        check_cancelled(ctx)?;
        self.symlink_metadata(path).await?;
        Ok(())
    }
}

#[async_trait]
impl File for BaseFile {
    async fn read(&self, ctx: &CancellationToken, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        check_cancelled(ctx)?;
        let file = self.file.lock().expect("base file lock poisoned");
        match file.read_at(buf, offset) {
            Ok(n) => Ok(n),
            Err(err) => Err(FsError::Io(err)),
        }
    }

    async fn write(&self, _ctx: &CancellationToken, _data: &[u8], _offset: u64) -> FsResult<usize> {
        Err(FsError::ReadOnlyFilesystem)
    }

    async fn sync(&self, _ctx: &CancellationToken) -> FsResult<()> {
        Ok(())
    }

    async fn close(&self) -> FsResult<()> {
        Ok(())
    }

    async fn stat(&self, ctx: &CancellationToken) -> FsResult<Stats> {
        check_cancelled(ctx)?;
        let file = self.file.lock().expect("base file lock poisoned");
        let meta = file.metadata().map_err(FsError::Io)?;
        Ok(metadata_to_stats(&meta))
    }

    async fn truncate(&self, _ctx: &CancellationToken, _size: u64) -> FsResult<()> {
        Err(FsError::ReadOnlyFilesystem)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn metadata_to_stats(meta: &std::fs::Metadata) -> Stats {
    Stats {
        ino: meta.ino(),
        mode: meta.mode(),
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        size: meta.size(),
        atime: meta.atime(),
        mtime: meta.mtime(),
        ctime: meta.ctime(),
    }
}

fn map_io(err: io::Error) -> FsError {
    match err.kind() {
        io::ErrorKind::NotFound => FsError::NotFound("base path".to_string()),
        io::ErrorKind::PermissionDenied => FsError::PermissionDenied("base path".to_string()),
        _ => FsError::Io(err),
    }
}

fn map_io_at(err: io::Error, path: &str) -> FsError {
    match err.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        io::ErrorKind::PermissionDenied => FsError::PermissionDenied(path.to_string()),
        _ => FsError::Io(err),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
