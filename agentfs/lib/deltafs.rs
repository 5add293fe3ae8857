use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use lru::LruCache;
use tokio_util::sync::CancellationToken;

use crate::{
    check_cancelled,
    defaults::DEFAULT_DENTRY_CACHE_CAPACITY,
    filesystem::{File, FileSystem},
    path::{join_path, split_path},
    stats::{S_IFDIR, S_IFLNK, S_IFREG},
    store::{Store, ROOT_INO},
    DirEntry, FsError, FsResult, FsStats, Stats,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The writable delta layer, backed by the [`Store`].
///
/// Path resolution walks dentries from the root inode; each hop consults an
/// LRU cache before falling back to the store. The cache is invalidated on
/// every unlink, rmdir and rename of the cached segment.
pub struct DeltaFs {
    store: Arc<Store>,
    dentry_cache: Mutex<LruCache<DentryKey, u64>>,
}

/// An open handle on a delta file.
pub struct DeltaFile {
    store: Arc<Store>,
    ino: u64,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct DentryKey {
    parent_ino: u64,
    name: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DeltaFs {
    /// Creates a delta filesystem over the given store.
    pub fn new(store: Arc<Store>) -> Self {
        let capacity = NonZeroUsize::new(DEFAULT_DENTRY_CACHE_CAPACITY)
            .expect("dentry cache capacity is non-zero");
        Self {
            store,
            dentry_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Returns the inode number for a path.
    pub async fn ino_for_path(&self, ctx: &CancellationToken, path: &str) -> FsResult<u64> {
        self.resolve_path(ctx, path).await
    }

    /// Walks a path segment by segment from the root inode, consulting the
    /// dentry cache on each hop.
    async fn resolve_path(&self, ctx: &CancellationToken, path: &str) -> FsResult<u64> {
        check_cancelled(ctx)?;

        let mut ino = ROOT_INO;
        for part in split_path(path) {
            let key = DentryKey {
                parent_ino: ino,
                name: part.clone(),
            };

            let cached = {
                let mut cache = self.dentry_cache.lock().expect("dentry cache lock poisoned");
                cache.get(&key).copied()
            };
            if let Some(child) = cached {
                ino = child;
                continue;
            }

            let child = match self.store.lookup(ino, &part).await {
                Ok(child) => child,
                Err(FsError::NotFound(_)) => return Err(FsError::NotFound(path.to_string())),
                Err(err) => return Err(err),
            };

            let mut cache = self.dentry_cache.lock().expect("dentry cache lock poisoned");
            cache.put(key, child);
            ino = child;
        }

        Ok(ino)
    }

    /// Resolves the parent directory inode and final name of a path.
    async fn resolve_parent(&self, ctx: &CancellationToken, path: &str) -> FsResult<(u64, String)> {
        let mut parts = split_path(path);
        let Some(name) = parts.pop() else {
            return Err(FsError::Invalid(format!("no parent for {path}")));
        };
        let parent_ino = self.resolve_path(ctx, &join_path(&parts)).await?;
        Ok((parent_ino, name))
    }

    fn invalidate(&self, parent_ino: u64, name: &str) {
        let mut cache = self.dentry_cache.lock().expect("dentry cache lock poisoned");
        cache.pop(&DentryKey {
            parent_ino,
            name: name.to_string(),
        });
    }

    /// Creates every missing parent directory of `path` inside the delta,
    /// with mode 0755.
    pub async fn ensure_parent_dirs(&self, ctx: &CancellationToken, path: &str) -> FsResult<()> {
        let parts = split_path(path);
        if parts.len() <= 1 {
            return Ok(());
        }

        for depth in 1..parts.len() {
            check_cancelled(ctx)?;
            let parent = join_path(&parts[..depth]);
            match self.resolve_path(ctx, &parent).await {
                Ok(_) => {}
                Err(FsError::NotFound(_)) => match self.mkdir(ctx, &parent, 0o755).await {
                    Ok(()) | Err(FsError::AlreadyExists(_)) => {}
                    Err(err) => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Materializes a base entity (regular file, symlink or directory) into
    /// the delta, returning the new inode number.
    ///
    /// Mode, uid and gid are taken from the base stats; the content, target
    /// or link count follows the entity kind. Each variant commits as a
    /// single transaction.
    pub async fn copy_from_base(
        &self,
        ctx: &CancellationToken,
        path: &str,
        base: &dyn FileSystem,
    ) -> FsResult<u64> {
        let stats = base.lstat(ctx, path).await?;

        self.ensure_parent_dirs(ctx, path).await?;
        let (parent_ino, name) = self.resolve_parent(ctx, path).await?;

        check_cancelled(ctx)?;
        if stats.is_regular() {
            let file = base.open(ctx, path, libc::O_RDONLY).await?;
            let mut data = vec![0u8; stats.size as usize];
            let mut filled = 0usize;
            while filled < data.len() {
                let n = file.read(ctx, &mut data[filled..], filled as u64).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            data.truncate(filled);
            file.close().await?;

            let mut tx = self.store.begin().await?;
            let ino = self
                .store
                .create_inode_tx(&mut tx, stats.mode, stats.uid, stats.gid)
                .await?;
            if !data.is_empty() {
                self.store.write_data_tx(&mut tx, ino, 0, &data).await?;
            }
            self.store
                .update_size_tx(&mut tx, ino, data.len() as u64)
                .await?;
            self.store
                .create_dentry_tx(&mut tx, parent_ino, &name, ino)
                .await?;
            tx.commit().await?;
            Ok(ino)
        } else if stats.is_symlink() {
            let target = base.readlink(ctx, path).await?;

            let mut tx = self.store.begin().await?;
            let ino = self
                .store
                .create_inode_tx(&mut tx, stats.mode, stats.uid, stats.gid)
                .await?;
            self.store.create_symlink_tx(&mut tx, ino, &target).await?;
            self.store
                .update_size_tx(&mut tx, ino, target.len() as u64)
                .await?;
            self.store
                .create_dentry_tx(&mut tx, parent_ino, &name, ino)
                .await?;
            tx.commit().await?;
            Ok(ino)
        } else if stats.is_dir() {
            let mut tx = self.store.begin().await?;
            let ino = self
                .store
                .create_inode_tx(&mut tx, stats.mode, stats.uid, stats.gid)
                .await?;
            self.store
                .create_dentry_tx(&mut tx, parent_ino, &name, ino)
                .await?;
            self.store.incr_nlink_tx(&mut tx, parent_ino).await?;
            tx.commit().await?;
            Ok(ino)
        } else {
            Err(FsError::Invalid(format!(
                "unsupported base entity type at {path}"
            )))
        }
    }

    /// Creates or overwrites a whole file with the given content.
    ///
    /// Used by workspace import walks; creates missing parent directories.
    pub async fn write_file(
        &self,
        ctx: &CancellationToken,
        path: &str,
        data: &[u8],
        mode: u32,
    ) -> FsResult<()> {
        self.ensure_parent_dirs(ctx, path).await?;

        match self.resolve_path(ctx, path).await {
            Err(FsError::NotFound(_)) => {
                let (file, _) = self.create(ctx, path, mode).await?;
                file.write(ctx, data, 0).await?;
                file.close().await?;
                Ok(())
            }
            Err(err) => Err(err),
            Ok(ino) => {
                self.store.truncate(ino, 0).await?;
                if !data.is_empty() {
                    self.store.write_data(ino, 0, data).await?;
                }
                self.store.update_size(ino, data.len() as u64).await?;
                Ok(())
            }
        }
    }

    /// Reads the entire content of a file.
    pub async fn read_file(&self, ctx: &CancellationToken, path: &str) -> FsResult<Vec<u8>> {
        let ino = self.resolve_path(ctx, path).await?;
        let inode = self.store.get_inode(ino).await?;
        self.store.read_data(ino, 0, inode.size).await
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl FileSystem for DeltaFs {
    async fn stat(&self, ctx: &CancellationToken, path: &str) -> FsResult<Stats> {
        // Symlinks are not resolved inside virtual paths; stat and lstat
        // behave identically in the delta.
        self.lstat(ctx, path).await
    }

    async fn lstat(&self, ctx: &CancellationToken, path: &str) -> FsResult<Stats> {
        let ino = self.resolve_path(ctx, path).await?;
        let inode = self.store.get_inode(ino).await?;
        Ok(inode.to_stats())
    }

    async fn readlink(&self, ctx: &CancellationToken, path: &str) -> FsResult<String> {
        let ino = self.resolve_path(ctx, path).await?;
        match self.store.read_symlink(ino).await {
            Err(FsError::NotFound(_)) => Err(FsError::NotFound(path.to_string())),
            other => other,
        }
    }

    async fn statfs(&self, ctx: &CancellationToken) -> FsResult<FsStats> {
        check_cancelled(ctx)?;
        // Virtual numbers; the delta has no meaningful block accounting.
        Ok(FsStats {
            blocks: 1024 * 1024,
            bfree: 512 * 1024,
            bavail: 512 * 1024,
            files: 1_000_000,
            ffree: 999_000,
            bsize: 1024,
            namelen: 255,
        })
    }

    async fn readdir(&self, ctx: &CancellationToken, path: &str) -> FsResult<Vec<DirEntry>> {
        let ino = self.resolve_path(ctx, path).await?;
        let dentries = self.store.list_dir(ino).await?;

        let mut entries = Vec::with_capacity(dentries.len());
        for dentry in dentries {
            // Skip entries whose inode vanished under us.
            let Ok(inode) = self.store.get_inode(dentry.ino).await else {
                continue;
            };
            entries.push(DirEntry {
                name: dentry.name,
                mode: inode.mode,
                ino: dentry.ino,
            });
        }
        Ok(entries)
    }

    async fn mkdir(&self, ctx: &CancellationToken, path: &str, mode: u32) -> FsResult<()> {
        let (parent_ino, name) = self.resolve_parent(ctx, path).await?;

        let mut tx = self.store.begin().await?;
        let ino = self
            .store
            .create_inode_tx(&mut tx, S_IFDIR | (mode & 0o777), 0, 0)
            .await?;
        match self
            .store
            .create_dentry_tx(&mut tx, parent_ino, &name, ino)
            .await
        {
            Ok(()) => {}
            Err(FsError::AlreadyExists(_)) => {
                return Err(FsError::AlreadyExists(path.to_string()))
            }
            Err(err) => return Err(err),
        }
        self.store.incr_nlink_tx(&mut tx, parent_ino).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn rmdir(&self, ctx: &CancellationToken, path: &str) -> FsResult<()> {
        let (parent_ino, name) = self.resolve_parent(ctx, path).await?;
        let ino = self.store.lookup(parent_ino, &name).await.map_err(|err| {
            if matches!(err, FsError::NotFound(_)) {
                FsError::NotFound(path.to_string())
            } else {
                err
            }
        })?;

        let inode = self.store.get_inode(ino).await?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        if self.store.has_children(ino).await? {
            return Err(FsError::NotEmpty(path.to_string()));
        }

        check_cancelled(ctx)?;
        let mut tx = self.store.begin().await?;
        self.store
            .delete_dentry_tx(&mut tx, parent_ino, &name)
            .await?;
        self.store.delete_inode_tx(&mut tx, ino).await?;
        self.store.decr_nlink_tx(&mut tx, parent_ino).await?;
        tx.commit().await?;

        self.invalidate(parent_ino, &name);
        Ok(())
    }

    async fn create(
        &self,
        ctx: &CancellationToken,
        path: &str,
        mode: u32,
    ) -> FsResult<(Box<dyn File>, Stats)> {
        let (parent_ino, name) = self.resolve_parent(ctx, path).await?;

        let mut tx = self.store.begin().await?;
        let ino = self
            .store
            .create_inode_tx(&mut tx, S_IFREG | (mode & 0o777), 0, 0)
            .await?;
        match self
            .store
            .create_dentry_tx(&mut tx, parent_ino, &name, ino)
            .await
        {
            Ok(()) => {}
            Err(FsError::AlreadyExists(_)) => {
                return Err(FsError::AlreadyExists(path.to_string()))
            }
            Err(err) => return Err(err),
        }
        tx.commit().await?;

        let inode = self.store.get_inode(ino).await?;
        let file = DeltaFile {
            store: Arc::clone(&self.store),
            ino,
        };
        Ok((Box::new(file), inode.to_stats()))
    }

    async fn open(
        &self,
        ctx: &CancellationToken,
        path: &str,
        flags: i32,
    ) -> FsResult<Box<dyn File>> {
        let ino = self.resolve_path(ctx, path).await?;

        if flags & libc::O_TRUNC != 0 {
            let mut tx = self.store.begin().await?;
            self.store.truncate_tx(&mut tx, ino, 0).await?;
            self.store.update_size_tx(&mut tx, ino, 0).await?;
            tx.commit().await?;
        }

        Ok(Box::new(DeltaFile {
            store: Arc::clone(&self.store),
            ino,
        }))
    }

    async fn remove(&self, ctx: &CancellationToken, path: &str) -> FsResult<()> {
        let (parent_ino, name) = self.resolve_parent(ctx, path).await?;
        let ino = self.store.lookup(parent_ino, &name).await.map_err(|err| {
            if matches!(err, FsError::NotFound(_)) {
                FsError::NotFound(path.to_string())
            } else {
                err
            }
        })?;

        let inode = self.store.get_inode(ino).await?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }

        check_cancelled(ctx)?;
        let mut tx = self.store.begin().await?;
        self.store
            .delete_dentry_tx(&mut tx, parent_ino, &name)
            .await?;
        let remaining = self.store.decr_nlink_tx(&mut tx, ino).await?;
        if remaining == 0 {
            if inode.is_symlink() {
                self.store.delete_symlink_tx(&mut tx, ino).await?;
            } else {
                self.store.delete_data_tx(&mut tx, ino).await?;
            }
            self.store.delete_inode_tx(&mut tx, ino).await?;
        }
        tx.commit().await?;

        self.invalidate(parent_ino, &name);
        Ok(())
    }

    async fn rename(
        &self,
        ctx: &CancellationToken,
        old_path: &str,
        new_path: &str,
    ) -> FsResult<()> {
        let (old_parent, old_name) = self.resolve_parent(ctx, old_path).await?;
        let (new_parent, new_name) = self.resolve_parent(ctx, new_path).await?;

        self.store
            .rename(old_parent, new_parent, &old_name, &new_name)
            .await?;

        self.invalidate(old_parent, &old_name);
        self.invalidate(new_parent, &new_name);
        Ok(())
    }

    async fn chmod(&self, ctx: &CancellationToken, path: &str, mode: u32) -> FsResult<()> {
        let ino = self.resolve_path(ctx, path).await?;
        self.store
            .set_attr(ino, Some(mode & 0o777), None, None, None, None, None)
            .await
    }

    async fn chown(&self, ctx: &CancellationToken, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        let ino = self.resolve_path(ctx, path).await?;
        self.store
            .set_attr(ino, None, Some(uid), Some(gid), None, None, None)
            .await
    }

    async fn truncate(&self, ctx: &CancellationToken, path: &str, size: u64) -> FsResult<()> {
        let ino = self.resolve_path(ctx, path).await?;
        self.store.truncate(ino, size).await?;
        self.store.update_size(ino, size).await
    }

    async fn utimens(
        &self,
        ctx: &CancellationToken,
        path: &str,
        atime: Option<i64>,
        mtime: Option<i64>,
    ) -> FsResult<()> {
        let ino = self.resolve_path(ctx, path).await?;
        self.store.update_times(ino, atime, mtime).await
    }

    async fn symlink(
        &self,
        ctx: &CancellationToken,
        target: &str,
        link_path: &str,
    ) -> FsResult<()> {
        let (parent_ino, name) = self.resolve_parent(ctx, link_path).await?;

        let mut tx = self.store.begin().await?;
        let ino = self
            .store
            .create_inode_tx(&mut tx, S_IFLNK | 0o777, 0, 0)
            .await?;
        self.store.create_symlink_tx(&mut tx, ino, target).await?;
        self.store
            .update_size_tx(&mut tx, ino, target.len() as u64)
            .await?;
        match self
            .store
            .create_dentry_tx(&mut tx, parent_ino, &name, ino)
            .await
        {
            Ok(()) => {}
            Err(FsError::AlreadyExists(_)) => {
                return Err(FsError::AlreadyExists(link_path.to_string()))
            }
            Err(err) => return Err(err),
        }
        tx.commit().await?;
        Ok(())
    }

    async fn link(&self, ctx: &CancellationToken, old_path: &str, new_path: &str) -> FsResult<()> {
        let src_ino = self.resolve_path(ctx, old_path).await?;
        let inode = self.store.get_inode(src_ino).await?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory(old_path.to_string()));
        }

        let (parent_ino, name) = self.resolve_parent(ctx, new_path).await?;

        let mut tx = self.store.begin().await?;
        match self
            .store
            .create_dentry_tx(&mut tx, parent_ino, &name, src_ino)
            .await
        {
            Ok(()) => {}
            Err(FsError::AlreadyExists(_)) => {
                return Err(FsError::AlreadyExists(new_path.to_string()))
            }
            Err(err) => return Err(err),
        }
        self.store.incr_nlink_tx(&mut tx, src_ino).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn access(&self, ctx: &CancellationToken, path: &str, _mode: u32) -> FsResult<()> {
        self.resolve_path(ctx, path).await?;
        Ok(())
    }
}

#[async_trait]
impl File for DeltaFile {
    async fn read(&self, ctx: &CancellationToken, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        check_cancelled(ctx)?;
        let data = self
            .store
            .read_data(self.ino, offset, buf.len() as u64)
            .await?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    async fn write(&self, ctx: &CancellationToken, data: &[u8], offset: u64) -> FsResult<usize> {
        check_cancelled(ctx)?;
        self.store.write_data(self.ino, offset, data).await?;

        // Writes are not self-extending; raise the size when this one went
        // past end-of-file, otherwise just bump mtime.
        let inode = self.store.get_inode(self.ino).await?;
        let end = offset + data.len() as u64;
        if end > inode.size {
            self.store.update_size(self.ino, end).await?;
        } else {
            self.store
                .update_times(self.ino, None, Some(chrono::Utc::now().timestamp()))
                .await?;
        }

        Ok(data.len())
    }

    async fn sync(&self, _ctx: &CancellationToken) -> FsResult<()> {
        // The store's journal handles durability.
        Ok(())
    }

    async fn close(&self) -> FsResult<()> {
        Ok(())
    }

    async fn stat(&self, ctx: &CancellationToken) -> FsResult<Stats> {
        check_cancelled(ctx)?;
        Ok(self.store.get_inode(self.ino).await?.to_stats())
    }

    async fn truncate(&self, ctx: &CancellationToken, size: u64) -> FsResult<()> {
        check_cancelled(ctx)?;
        self.store.truncate(self.ino, size).await?;
        self.store.update_size(self.ino, size).await
    }
}

impl DeltaFile {
    /// Returns the delta inode number behind this handle.
    pub fn ino(&self) -> u64 {
        self.ino
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use tempfile::tempdir;

    async fn open_delta() -> (tempfile::TempDir, DeltaFs) {
        let dir = tempdir().unwrap();
        let store = Store::open(StoreConfig::new(dir.path().join("delta.db")))
            .await
            .unwrap();
        (dir, DeltaFs::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn test_deltafs_mkdir_rmdir_contract() {
        let (_dir, delta) = open_delta().await;
        let ctx = CancellationToken::new();

        delta.mkdir(&ctx, "/d", 0o755).await.unwrap();
        let root = delta.lstat(&ctx, "/").await.unwrap();
        assert_eq!(root.nlink, 3); // 2 + one subdirectory

        let stats = delta.lstat(&ctx, "/d").await.unwrap();
        assert!(stats.is_dir());
        assert_eq!(stats.perm(), 0o755);

        delta.mkdir(&ctx, "/d/inner", 0o700).await.unwrap();
        assert!(matches!(
            delta.rmdir(&ctx, "/d").await,
            Err(FsError::NotEmpty(_))
        ));

        delta.rmdir(&ctx, "/d/inner").await.unwrap();
        delta.rmdir(&ctx, "/d").await.unwrap();
        assert!(matches!(
            delta.lstat(&ctx, "/d").await,
            Err(FsError::NotFound(_))
        ));
        assert_eq!(delta.lstat(&ctx, "/").await.unwrap().nlink, 2);
    }

    #[tokio::test]
    async fn test_deltafs_rmdir_on_file_fails() {
        let (_dir, delta) = open_delta().await;
        let ctx = CancellationToken::new();

        delta.create(&ctx, "/f", 0o644).await.unwrap();
        assert!(matches!(
            delta.rmdir(&ctx, "/f").await,
            Err(FsError::NotADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_deltafs_create_write_read() {
        let (_dir, delta) = open_delta().await;
        let ctx = CancellationToken::new();

        let (file, stats) = delta.create(&ctx, "/hello.txt", 0o644).await.unwrap();
        assert!(stats.is_regular());
        assert_eq!(stats.size, 0);

        file.write(&ctx, b"hello delta", 0).await.unwrap();
        let mut buf = vec![0u8; 11];
        let n = file.read(&ctx, &mut buf, 0).await.unwrap();
        assert_eq!(&buf[..n], b"hello delta");

        assert_eq!(file.stat(&ctx).await.unwrap().size, 11);
    }

    #[tokio::test]
    async fn test_deltafs_open_trunc_resets_size() {
        let (_dir, delta) = open_delta().await;
        let ctx = CancellationToken::new();

        let (file, _) = delta.create(&ctx, "/t", 0o644).await.unwrap();
        file.write(&ctx, b"content", 0).await.unwrap();

        let _reopened = delta
            .open(&ctx, "/t", libc::O_RDWR | libc::O_TRUNC)
            .await
            .unwrap();
        assert_eq!(delta.lstat(&ctx, "/t").await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_deltafs_unlink_reaps_inode() {
        let (_dir, delta) = open_delta().await;
        let ctx = CancellationToken::new();

        let (file, stats) = delta.create(&ctx, "/gone", 0o644).await.unwrap();
        file.write(&ctx, b"bytes", 0).await.unwrap();

        delta.remove(&ctx, "/gone").await.unwrap();
        assert!(matches!(
            delta.lstat(&ctx, "/gone").await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            delta.store().get_inode(stats.ino).await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deltafs_symlink() {
        let (_dir, delta) = open_delta().await;
        let ctx = CancellationToken::new();

        delta.symlink(&ctx, "target", "/l").await.unwrap();
        assert_eq!(delta.readlink(&ctx, "/l").await.unwrap(), "target");

        let stats = delta.lstat(&ctx, "/l").await.unwrap();
        assert!(stats.is_symlink());
        assert_eq!(stats.size, 6);
    }

    #[tokio::test]
    async fn test_deltafs_link_counts() {
        let (_dir, delta) = open_delta().await;
        let ctx = CancellationToken::new();

        delta.create(&ctx, "/a", 0o644).await.unwrap();
        delta.link(&ctx, "/a", "/b").await.unwrap();

        let a = delta.lstat(&ctx, "/a").await.unwrap();
        let b = delta.lstat(&ctx, "/b").await.unwrap();
        assert_eq!(a.ino, b.ino);
        assert_eq!(a.nlink, 2);

        // Removing one name keeps the inode alive through the other.
        delta.remove(&ctx, "/a").await.unwrap();
        assert_eq!(delta.lstat(&ctx, "/b").await.unwrap().nlink, 1);

        delta.mkdir(&ctx, "/dir", 0o755).await.unwrap();
        assert!(matches!(
            delta.link(&ctx, "/dir", "/dir2").await,
            Err(FsError::IsADirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_deltafs_rename_invalidates_cache() {
        let (_dir, delta) = open_delta().await;
        let ctx = CancellationToken::new();

        delta.create(&ctx, "/old", 0o644).await.unwrap();
        // Warm the cache.
        delta.lstat(&ctx, "/old").await.unwrap();

        delta.rename(&ctx, "/old", "/new").await.unwrap();
        assert!(matches!(
            delta.lstat(&ctx, "/old").await,
            Err(FsError::NotFound(_))
        ));
        assert!(delta.lstat(&ctx, "/new").await.is_ok());
    }

    #[tokio::test]
    async fn test_deltafs_chmod_chown_utimens() {
        let (_dir, delta) = open_delta().await;
        let ctx = CancellationToken::new();

        delta.create(&ctx, "/f", 0o644).await.unwrap();

        delta.chmod(&ctx, "/f", 0o600).await.unwrap();
        let stats = delta.lstat(&ctx, "/f").await.unwrap();
        assert!(stats.is_regular());
        assert_eq!(stats.perm(), 0o600);

        delta.chown(&ctx, "/f", 42, 43).await.unwrap();
        let stats = delta.lstat(&ctx, "/f").await.unwrap();
        assert_eq!((stats.uid, stats.gid), (42, 43));

        delta.utimens(&ctx, "/f", Some(1000), Some(2000)).await.unwrap();
        let stats = delta.lstat(&ctx, "/f").await.unwrap();
        assert_eq!((stats.atime, stats.mtime), (1000, 2000));
    }

    #[tokio::test]
    async fn test_deltafs_readdir_sorted_store_order() {
        let (_dir, delta) = open_delta().await;
        let ctx = CancellationToken::new();

        delta.create(&ctx, "/b", 0o644).await.unwrap();
        delta.create(&ctx, "/a", 0o644).await.unwrap();
        delta.mkdir(&ctx, "/c", 0o755).await.unwrap();

        let names: Vec<String> = delta
            .readdir(&ctx, "/")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_deltafs_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("delta.db");
        let ctx = CancellationToken::new();

        {
            let store = Store::open(StoreConfig::new(&db_path)).await.unwrap();
            let delta = DeltaFs::new(Arc::new(store));
            delta
                .write_file(&ctx, "/deep/nested/file", b"persisted", 0o644)
                .await
                .unwrap();
            delta.store().close().await;
        }

        let store = Store::open(StoreConfig::new(&db_path)).await.unwrap();
        let delta = DeltaFs::new(Arc::new(store));
        assert_eq!(
            delta.read_file(&ctx, "/deep/nested/file").await.unwrap(),
            b"persisted"
        );
        assert!(delta.lstat(&ctx, "/deep/nested").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_deltafs_link_count_matches_dentries() {
        let (_dir, delta) = open_delta().await;
        let ctx = CancellationToken::new();

        delta.create(&ctx, "/one", 0o644).await.unwrap();
        delta.link(&ctx, "/one", "/two").await.unwrap();
        delta.link(&ctx, "/one", "/three").await.unwrap();

        let stats = delta.lstat(&ctx, "/one").await.unwrap();
        let dentries = delta.store().list_dir(ROOT_INO).await.unwrap();
        let references = dentries.iter().filter(|d| d.ino == stats.ino).count();
        assert_eq!(stats.nlink as usize, references);
    }
}
