use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use getset::Getters;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    check_cancelled,
    filesystem::{File, FileSystem},
    flags_want_write,
    path::parent_path,
    DeltaFs, DirEntry, FsError, FsResult, FsStats, Stats, WhiteoutIndex,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The copy-on-write merge of a read-only base layer and the writable delta.
///
/// Reads fall through from delta to base; every mutation lands in the delta,
/// copying the base entity up first when needed. Paths removed from the base
/// are tracked as whiteouts, persisted in the store and mirrored in an
/// in-memory index that pre-filters every operation.
#[derive(Getters)]
#[getset(get = "pub with_prefix")]
pub struct OverlayFs {
    /// The read-only base layer.
    base: Arc<dyn FileSystem>,

    /// The writable delta layer.
    delta: Arc<DeltaFs>,

    /// Deletion markers erasing base paths from the merged view.
    whiteout: WhiteoutIndex,

    #[getset(skip)]
    copy_up: Arc<CopyUp>,
}

/// An open handle on the merged view.
///
/// The handle is backed by exactly one layer at a time. A write on a
/// base-backed handle copies the file up, reopens it in the delta and swaps
/// the backing under the handle's own mutex; reads issued afterwards observe
/// the delta copy.
pub struct OverlayFile {
    path: String,
    copy_up: Arc<CopyUp>,
    state: Mutex<OverlayFileState>,
}

struct OverlayFileState {
    inner: Box<dyn File>,
    in_delta: bool,
}

/// Shared copy-up machinery: one mutex per overlay so concurrent writers on
/// the same path cannot double-copy.
struct CopyUp {
    base: Arc<dyn FileSystem>,
    delta: Arc<DeltaFs>,
    lock: Mutex<()>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OverlayFs {
    /// Creates an overlay over the given base and delta layers, rebuilding
    /// the whiteout index from the store.
    pub async fn new(base: Arc<dyn FileSystem>, delta: Arc<DeltaFs>) -> FsResult<Self> {
        let whiteout = WhiteoutIndex::new();
        let paths = delta.store().list_whiteouts().await?;
        debug!(count = paths.len(), "rebuilt whiteout index from store");
        whiteout.load(&paths);

        let copy_up = Arc::new(CopyUp {
            base: Arc::clone(&base),
            delta: Arc::clone(&delta),
            lock: Mutex::new(()),
        });

        Ok(Self {
            base,
            delta,
            whiteout,
            copy_up,
        })
    }

    async fn exists_in_delta(&self, ctx: &CancellationToken, path: &str) -> bool {
        self.delta.lstat(ctx, path).await.is_ok()
    }

    async fn exists_in_base(&self, ctx: &CancellationToken, path: &str) -> bool {
        self.base.lstat(ctx, path).await.is_ok()
    }

    /// Rewrites the reported inode number with the base inode recorded at
    /// copy-up, keeping inode identity stable across the copy.
    async fn apply_origin(&self, stats: Stats) -> FsResult<Stats> {
        apply_origin(&self.delta, stats).await
    }

    /// Ensures every parent directory of `path` exists in the delta,
    /// materializing intermediate directories with the base's permission
    /// bits when the base has them and 0755 otherwise.
    async fn ensure_parent_dirs(&self, ctx: &CancellationToken, path: &str) -> FsResult<()> {
        let parts = crate::path::split_path(path);
        if parts.len() <= 1 {
            return Ok(());
        }

        for depth in 1..parts.len() {
            check_cancelled(ctx)?;
            let parent = crate::path::join_path(&parts[..depth]);

            if self.exists_in_delta(ctx, &parent).await {
                continue;
            }

            let mode = match self.base.lstat(ctx, &parent).await {
                Ok(stats) if stats.is_dir() => stats.perm(),
                _ => 0o755,
            };
            match self.delta.mkdir(ctx, &parent, mode).await {
                Ok(()) | Err(FsError::AlreadyExists(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Clears an exact whiteout at `path`, store first, index second.
    async fn clear_whiteout(&self, path: &str) -> FsResult<()> {
        if self.whiteout.has_exact(path) {
            self.delta.store().delete_whiteout(path).await?;
            self.whiteout.remove(path);
        }
        Ok(())
    }

    /// Records a whiteout at `path`, store first, index second.
    async fn insert_whiteout(&self, path: &str) -> FsResult<()> {
        self.delta.store().create_whiteout(path).await?;
        self.whiteout.insert(path);
        Ok(())
    }
}

impl CopyUp {
    /// Copies a base entity into the delta and records its origin mapping.
    ///
    /// Idempotent: under the copy-up lock the delta is re-checked and the
    /// copy skipped when another writer got there first. The origin mapping
    /// is written only after the copy committed.
    async fn copy_up(&self, ctx: &CancellationToken, path: &str) -> FsResult<()> {
        let _guard = self.lock.lock().await;

        if self.delta.lstat(ctx, path).await.is_ok() {
            return Ok(());
        }

        let base_stats = self.base.lstat(ctx, path).await?;
        let delta_ino = self
            .delta
            .copy_from_base(ctx, path, self.base.as_ref())
            .await?;
        self.delta.store().add_origin(delta_ino, base_stats.ino).await?;

        debug!(path, delta_ino, base_ino = base_stats.ino, "copied up");
        Ok(())
    }
}

async fn apply_origin(delta: &DeltaFs, mut stats: Stats) -> FsResult<Stats> {
    if let Some(base_ino) = delta.store().get_origin(stats.ino).await? {
        stats.ino = base_ino;
    }
    Ok(stats)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl FileSystem for OverlayFs {
    async fn stat(&self, ctx: &CancellationToken, path: &str) -> FsResult<Stats> {
        check_cancelled(ctx)?;
        if self.whiteout.has_ancestor(path) {
            return Err(FsError::NotFound(path.to_string()));
        }

        match self.delta.stat(ctx, path).await {
            Ok(stats) => self.apply_origin(stats).await,
            Err(FsError::NotFound(_)) => self.base.stat(ctx, path).await,
            Err(err) => Err(err),
        }
    }

    async fn lstat(&self, ctx: &CancellationToken, path: &str) -> FsResult<Stats> {
        check_cancelled(ctx)?;
        if self.whiteout.has_ancestor(path) {
            return Err(FsError::NotFound(path.to_string()));
        }

        match self.delta.lstat(ctx, path).await {
            Ok(stats) => self.apply_origin(stats).await,
            Err(FsError::NotFound(_)) => self.base.lstat(ctx, path).await,
            Err(err) => Err(err),
        }
    }

    async fn readlink(&self, ctx: &CancellationToken, path: &str) -> FsResult<String> {
        check_cancelled(ctx)?;
        if self.whiteout.has_ancestor(path) {
            return Err(FsError::NotFound(path.to_string()));
        }

        match self.delta.readlink(ctx, path).await {
            Ok(target) => Ok(target),
            Err(FsError::NotFound(_)) => self.base.readlink(ctx, path).await,
            Err(err) => Err(err),
        }
    }

    async fn statfs(&self, ctx: &CancellationToken) -> FsResult<FsStats> {
        self.delta.statfs(ctx).await
    }

    async fn readdir(&self, ctx: &CancellationToken, path: &str) -> FsResult<Vec<DirEntry>> {
        check_cancelled(ctx)?;
        if self.whiteout.has_ancestor(path) {
            return Err(FsError::NotFound(path.to_string()));
        }

        let whiteouts: std::collections::HashSet<String> =
            self.whiteout.child_whiteouts(path).into_iter().collect();

        let mut merged: HashMap<String, DirEntry> = HashMap::new();
        let mut found = false;

        if let Ok(entries) = self.delta.readdir(ctx, path).await {
            found = true;
            for entry in entries {
                merged.insert(entry.name.clone(), entry);
            }
        }

        if let Ok(entries) = self.base.readdir(ctx, path).await {
            found = true;
            for entry in entries {
                if whiteouts.contains(&entry.name) || merged.contains_key(&entry.name) {
                    continue;
                }
                merged.insert(entry.name.clone(), entry);
            }
        }

        if !found {
            return Err(FsError::NotFound(path.to_string()));
        }

        // Merge order is unspecified.
        Ok(merged.into_values().collect())
    }

    async fn mkdir(&self, ctx: &CancellationToken, path: &str, mode: u32) -> FsResult<()> {
        check_cancelled(ctx)?;
        // The path itself may be whited out (recreating a deleted directory
        // is allowed); only an erased ancestor blocks the create.
        if self.whiteout.has_ancestor(&parent_path(path)) {
            return Err(FsError::NotFound(path.to_string()));
        }

        self.clear_whiteout(path).await?;
        self.ensure_parent_dirs(ctx, path).await?;
        self.delta.mkdir(ctx, path, mode).await
    }

    async fn rmdir(&self, ctx: &CancellationToken, path: &str) -> FsResult<()> {
        check_cancelled(ctx)?;
        if self.whiteout.has_ancestor(path) {
            return Err(FsError::NotFound(path.to_string()));
        }

        let stats = self.lstat(ctx, path).await?;
        if !stats.is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        if !self.readdir(ctx, path).await?.is_empty() {
            return Err(FsError::NotEmpty(path.to_string()));
        }

        // Both steps can apply: drop the delta directory and erase the base
        // one.
        if self.exists_in_delta(ctx, path).await {
            self.delta.rmdir(ctx, path).await?;
        }
        if self.exists_in_base(ctx, path).await {
            self.insert_whiteout(path).await?;
        }
        Ok(())
    }

    async fn create(
        &self,
        ctx: &CancellationToken,
        path: &str,
        mode: u32,
    ) -> FsResult<(Box<dyn File>, Stats)> {
        check_cancelled(ctx)?;
        if self.whiteout.has_ancestor(&parent_path(path)) {
            return Err(FsError::NotFound(path.to_string()));
        }

        self.clear_whiteout(path).await?;
        self.ensure_parent_dirs(ctx, path).await?;

        let (file, stats) = self.delta.create(ctx, path, mode).await?;
        let file = OverlayFile {
            path: path.to_string(),
            copy_up: Arc::clone(&self.copy_up),
            state: Mutex::new(OverlayFileState {
                inner: file,
                in_delta: true,
            }),
        };
        Ok((Box::new(file), stats))
    }

    async fn open(
        &self,
        ctx: &CancellationToken,
        path: &str,
        flags: i32,
    ) -> FsResult<Box<dyn File>> {
        check_cancelled(ctx)?;
        if self.whiteout.has_ancestor(path) {
            return Err(FsError::NotFound(path.to_string()));
        }

        let mut in_delta = self.exists_in_delta(ctx, path).await;
        let in_base = self.exists_in_base(ctx, path).await;
        if !in_delta && !in_base {
            return Err(FsError::NotFound(path.to_string()));
        }

        if flags_want_write(flags) && !in_delta && in_base {
            self.copy_up.copy_up(ctx, path).await?;
            in_delta = true;
        }

        let inner = if in_delta {
            self.delta.open(ctx, path, flags).await?
        } else {
            self.base.open(ctx, path, libc::O_RDONLY).await?
        };

        Ok(Box::new(OverlayFile {
            path: path.to_string(),
            copy_up: Arc::clone(&self.copy_up),
            state: Mutex::new(OverlayFileState { inner, in_delta }),
        }))
    }

    async fn remove(&self, ctx: &CancellationToken, path: &str) -> FsResult<()> {
        check_cancelled(ctx)?;
        if self.whiteout.has_ancestor(path) {
            return Err(FsError::NotFound(path.to_string()));
        }

        let in_delta = self.exists_in_delta(ctx, path).await;
        let in_base = self.exists_in_base(ctx, path).await;
        if !in_delta && !in_base {
            return Err(FsError::NotFound(path.to_string()));
        }

        let stats = self.lstat(ctx, path).await?;
        if stats.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }

        if in_delta {
            if let Ok(ino) = self.delta.ino_for_path(ctx, path).await {
                self.delta.store().delete_origin(ino).await?;
            }
            self.delta.remove(ctx, path).await?;
        }
        if in_base {
            self.insert_whiteout(path).await?;
        }
        Ok(())
    }

    /// Cross-layer moves become copy-up, rename in the delta, then a whiteout
    /// at the source. A base-backed directory is copied up at the top level
    /// only: its subtree stays base-backed and is materialized lazily as it
    /// is touched, which means entries created under the new name coexist
    /// with base entries that are now unreachable through the whited-out old
    /// name.
    async fn rename(
        &self,
        ctx: &CancellationToken,
        old_path: &str,
        new_path: &str,
    ) -> FsResult<()> {
        check_cancelled(ctx)?;
        if self.whiteout.has_ancestor(old_path) {
            return Err(FsError::NotFound(old_path.to_string()));
        }

        let in_delta = self.exists_in_delta(ctx, old_path).await;
        let in_base = self.exists_in_base(ctx, old_path).await;
        if !in_delta && !in_base {
            return Err(FsError::NotFound(old_path.to_string()));
        }

        if !in_delta && in_base {
            self.copy_up.copy_up(ctx, old_path).await?;
        }

        self.ensure_parent_dirs(ctx, new_path).await?;
        self.clear_whiteout(new_path).await?;
        self.delta.rename(ctx, old_path, new_path).await?;

        if in_base {
            self.insert_whiteout(old_path).await?;
        }
        Ok(())
    }

    async fn chmod(&self, ctx: &CancellationToken, path: &str, mode: u32) -> FsResult<()> {
        check_cancelled(ctx)?;
        if self.whiteout.has_ancestor(path) {
            return Err(FsError::NotFound(path.to_string()));
        }

        if !self.exists_in_delta(ctx, path).await {
            if !self.exists_in_base(ctx, path).await {
                return Err(FsError::NotFound(path.to_string()));
            }
            self.copy_up.copy_up(ctx, path).await?;
        }
        self.delta.chmod(ctx, path, mode).await
    }

    async fn chown(&self, ctx: &CancellationToken, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        check_cancelled(ctx)?;
        if self.whiteout.has_ancestor(path) {
            return Err(FsError::NotFound(path.to_string()));
        }

        if !self.exists_in_delta(ctx, path).await {
            if !self.exists_in_base(ctx, path).await {
                return Err(FsError::NotFound(path.to_string()));
            }
            self.copy_up.copy_up(ctx, path).await?;
        }
        self.delta.chown(ctx, path, uid, gid).await
    }

    async fn truncate(&self, ctx: &CancellationToken, path: &str, size: u64) -> FsResult<()> {
        check_cancelled(ctx)?;
        if self.whiteout.has_ancestor(path) {
            return Err(FsError::NotFound(path.to_string()));
        }

        if !self.exists_in_delta(ctx, path).await {
            if !self.exists_in_base(ctx, path).await {
                return Err(FsError::NotFound(path.to_string()));
            }
            self.copy_up.copy_up(ctx, path).await?;
        }
        self.delta.truncate(ctx, path, size).await
    }

    async fn utimens(
        &self,
        ctx: &CancellationToken,
        path: &str,
        atime: Option<i64>,
        mtime: Option<i64>,
    ) -> FsResult<()> {
        check_cancelled(ctx)?;
        if self.whiteout.has_ancestor(path) {
            return Err(FsError::NotFound(path.to_string()));
        }

        if !self.exists_in_delta(ctx, path).await {
            if !self.exists_in_base(ctx, path).await {
                return Err(FsError::NotFound(path.to_string()));
            }
            self.copy_up.copy_up(ctx, path).await?;
        }
        self.delta.utimens(ctx, path, atime, mtime).await
    }

    async fn symlink(
        &self,
        ctx: &CancellationToken,
        target: &str,
        link_path: &str,
    ) -> FsResult<()> {
        check_cancelled(ctx)?;
        if self.whiteout.has_ancestor(&parent_path(link_path)) {
            return Err(FsError::NotFound(link_path.to_string()));
        }

        self.clear_whiteout(link_path).await?;
        self.ensure_parent_dirs(ctx, link_path).await?;
        self.delta.symlink(ctx, target, link_path).await
    }

    async fn link(&self, ctx: &CancellationToken, old_path: &str, new_path: &str) -> FsResult<()> {
        check_cancelled(ctx)?;
        if self.whiteout.has_ancestor(old_path) {
            return Err(FsError::NotFound(old_path.to_string()));
        }

        if !self.exists_in_delta(ctx, old_path).await {
            if !self.exists_in_base(ctx, old_path).await {
                return Err(FsError::NotFound(old_path.to_string()));
            }
            self.copy_up.copy_up(ctx, old_path).await?;
        }

        self.clear_whiteout(new_path).await?;
        self.ensure_parent_dirs(ctx, new_path).await?;
        self.delta.link(ctx, old_path, new_path).await
    }

    async fn access(&self, ctx: &CancellationToken, path: &str, mode: u32) -> FsResult<()> {
        check_cancelled(ctx)?;
        if self.whiteout.has_ancestor(path) {
            return Err(FsError::NotFound(path.to_string()));
        }

        if self.delta.access(ctx, path, mode).await.is_ok() {
            return Ok(());
        }
        self.base.access(ctx, path, mode).await
    }
}

#[async_trait]
impl File for OverlayFile {
    async fn read(&self, ctx: &CancellationToken, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let state = self.state.lock().await;
        state.inner.read(ctx, buf, offset).await
    }

    async fn write(&self, ctx: &CancellationToken, data: &[u8], offset: u64) -> FsResult<usize> {
        let mut state = self.state.lock().await;
        self.ensure_delta(ctx, &mut state).await?;
        state.inner.write(ctx, data, offset).await
    }

    async fn sync(&self, ctx: &CancellationToken) -> FsResult<()> {
        let state = self.state.lock().await;
        state.inner.sync(ctx).await
    }

    async fn close(&self) -> FsResult<()> {
        let state = self.state.lock().await;
        state.inner.close().await
    }

    async fn stat(&self, ctx: &CancellationToken) -> FsResult<Stats> {
        let state = self.state.lock().await;
        let stats = state.inner.stat(ctx).await?;
        if state.in_delta {
            return apply_origin(&self.copy_up.delta, stats).await;
        }
        Ok(stats)
    }

    async fn truncate(&self, ctx: &CancellationToken, size: u64) -> FsResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_delta(ctx, &mut state).await?;
        state.inner.truncate(ctx, size).await
    }
}

impl OverlayFile {
    /// Copies the file up and swaps the handle over to the delta. The state
    /// lock is already held by the caller, so reads cannot observe the
    /// half-swapped handle.
    async fn ensure_delta(
        &self,
        ctx: &CancellationToken,
        state: &mut OverlayFileState,
    ) -> FsResult<()> {
        if state.in_delta {
            return Ok(());
        }

        self.copy_up.copy_up(ctx, &self.path).await?;
        let delta_file = self.copy_up.delta.open(ctx, &self.path, libc::O_RDWR).await?;

        state.inner.close().await?;
        state.inner = delta_file;
        state.in_delta = true;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::{Store, StoreConfig},
        BaseFs,
    };
    use tempfile::tempdir;

    struct Fixture {
        _base_dir: tempfile::TempDir,
        _delta_dir: tempfile::TempDir,
        base_root: std::path::PathBuf,
        overlay: OverlayFs,
        ctx: CancellationToken,
    }

    /// Builds an overlay over a scratch base tree and a scratch store.
    /// `files` are (path, content) pairs created on the host side.
    async fn fixture(files: &[(&str, &[u8])]) -> Fixture {
        let base_dir = tempdir().unwrap();
        for (path, content) in files {
            let host = base_dir.path().join(path.trim_start_matches('/'));
            std::fs::create_dir_all(host.parent().unwrap()).unwrap();
            std::fs::write(host, content).unwrap();
        }

        let delta_dir = tempdir().unwrap();
        let store = Store::open(StoreConfig::new(delta_dir.path().join("delta.db")))
            .await
            .unwrap();
        let base = BaseFs::new(base_dir.path()).unwrap();
        let delta = Arc::new(DeltaFs::new(Arc::new(store)));
        let overlay = OverlayFs::new(Arc::new(base), delta).await.unwrap();

        Fixture {
            base_root: base_dir.path().to_path_buf(),
            _base_dir: base_dir,
            _delta_dir: delta_dir,
            overlay,
            ctx: CancellationToken::new(),
        }
    }

    async fn read_all(f: &Fixture, path: &str, len: usize) -> Vec<u8> {
        let file = f
            .overlay
            .open(&f.ctx, path, libc::O_RDONLY)
            .await
            .unwrap();
        let mut buf = vec![0u8; len];
        let n = file.read(&f.ctx, &mut buf, 0).await.unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn test_overlay_write_leaves_base_untouched() {
        // Base contains /a/x=hello; delta empty.
        let f = fixture(&[("/a/x", b"hello")]).await;

        assert_eq!(read_all(&f, "/a/x", 5).await, b"hello");

        let file = f.overlay.open(&f.ctx, "/a/x", libc::O_RDWR).await.unwrap();
        file.write(&f.ctx, b"WORLD", 0).await.unwrap();
        file.close().await.unwrap();

        assert_eq!(read_all(&f, "/a/x", 5).await, b"WORLD");
        // The host file still reads "hello".
        assert_eq!(std::fs::read(f.base_root.join("a/x")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_overlay_unlink_base_file_leaves_whiteout() {
        let f = fixture(&[("/b/y", b"data")]).await;

        f.overlay.remove(&f.ctx, "/b/y").await.unwrap();

        assert!(matches!(
            f.overlay.lstat(&f.ctx, "/b/y").await,
            Err(FsError::NotFound(_))
        ));
        let names: Vec<String> = f
            .overlay
            .readdir(&f.ctx, "/b")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert!(!names.contains(&"y".to_string()));

        let rows = f
            .overlay
            .get_delta()
            .store()
            .list_whiteouts()
            .await
            .unwrap();
        assert_eq!(rows, vec!["/b/y".to_string()]);
    }

    #[tokio::test]
    async fn test_overlay_rmdir_requires_empty_merged_dir() {
        let f = fixture(&[("/c/d/e", b"x")]).await;

        assert!(matches!(
            f.overlay.rmdir(&f.ctx, "/c/d").await,
            Err(FsError::NotEmpty(_))
        ));

        f.overlay.remove(&f.ctx, "/c/d/e").await.unwrap();
        f.overlay.rmdir(&f.ctx, "/c/d").await.unwrap();

        let names: Vec<String> = f
            .overlay
            .readdir(&f.ctx, "/c")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert!(!names.contains(&"d".to_string()));
    }

    #[tokio::test]
    async fn test_overlay_create_persists_across_reopen() {
        let base_dir = tempdir().unwrap();
        std::fs::create_dir(base_dir.path().join("n")).unwrap();
        let delta_dir = tempdir().unwrap();
        let db_path = delta_dir.path().join("delta.db");
        let ctx = CancellationToken::new();

        {
            let store = Store::open(StoreConfig::new(&db_path)).await.unwrap();
            let delta = Arc::new(DeltaFs::new(Arc::new(store)));
            let base = Arc::new(BaseFs::new(base_dir.path()).unwrap());
            let overlay = OverlayFs::new(base, delta).await.unwrap();

            let (file, _) = overlay.create(&ctx, "/n/new", 0o644).await.unwrap();
            file.write(&ctx, b"42........", 0).await.unwrap();
            file.close().await.unwrap();
            overlay.get_delta().store().close().await;
        }

        let store = Store::open(StoreConfig::new(&db_path)).await.unwrap();
        let delta = Arc::new(DeltaFs::new(Arc::new(store)));
        let base = Arc::new(BaseFs::new(base_dir.path()).unwrap());
        let overlay = OverlayFs::new(base, delta).await.unwrap();

        assert_eq!(overlay.lstat(&ctx, "/n/new").await.unwrap().size, 10);
        let file = overlay.open(&ctx, "/n/new", libc::O_RDONLY).await.unwrap();
        let mut buf = vec![0u8; 10];
        let n = file.read(&ctx, &mut buf, 0).await.unwrap();
        assert_eq!(&buf[..n], b"42........");
    }

    #[tokio::test]
    async fn test_overlay_symlink_size_and_target() {
        let f = fixture(&[]).await;

        f.overlay.symlink(&f.ctx, "target", "/l").await.unwrap();
        assert_eq!(f.overlay.readlink(&f.ctx, "/l").await.unwrap(), "target");
        assert_eq!(f.overlay.lstat(&f.ctx, "/l").await.unwrap().size, 6);
    }

    #[tokio::test]
    async fn test_overlay_rename_base_only_file() {
        let f = fixture(&[("/a/x", b"content")]).await;

        f.overlay.rename(&f.ctx, "/a/x", "/a/z").await.unwrap();

        // The delta now carries the copied content under the new name.
        assert!(f.overlay.get_delta().lstat(&f.ctx, "/a/z").await.is_ok());
        assert_eq!(read_all(&f, "/a/z", 7).await, b"content");

        // A whiteout hides the old name.
        assert!(f
            .overlay
            .get_delta()
            .store()
            .has_whiteout("/a/x")
            .await
            .unwrap());
        let names: Vec<String> = f
            .overlay
            .readdir(&f.ctx, "/a")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert!(names.contains(&"z".to_string()));
        assert!(!names.contains(&"x".to_string()));
    }

    #[tokio::test]
    async fn test_overlay_merge_correctness() {
        let f = fixture(&[("/both", b"base"), ("/base_only", b"base")]).await;

        // Delta-only path.
        let (file, _) = f.overlay.create(&f.ctx, "/delta_only", 0o644).await.unwrap();
        file.close().await.unwrap();
        // Path present in both layers (copy-up via chmod).
        f.overlay.chmod(&f.ctx, "/both", 0o600).await.unwrap();

        assert!(f.overlay.lstat(&f.ctx, "/delta_only").await.is_ok());
        assert!(f.overlay.lstat(&f.ctx, "/base_only").await.is_ok());
        assert!(f.overlay.lstat(&f.ctx, "/both").await.is_ok());

        // Whiting out erases base visibility.
        f.overlay.remove(&f.ctx, "/base_only").await.unwrap();
        assert!(matches!(
            f.overlay.lstat(&f.ctx, "/base_only").await,
            Err(FsError::NotFound(_))
        ));

        // An ancestor whiteout erases everything beneath it.
        assert!(f.overlay.lstat(&f.ctx, "/base_only/below").await.is_err());
    }

    #[tokio::test]
    async fn test_overlay_copy_up_keeps_inode_identity() {
        let f = fixture(&[("/stable", b"inode test")]).await;

        let before = f.overlay.stat(&f.ctx, "/stable").await.unwrap();
        f.overlay.chmod(&f.ctx, "/stable", 0o600).await.unwrap();
        let after = f.overlay.stat(&f.ctx, "/stable").await.unwrap();

        assert_eq!(before.ino, after.ino);
        assert_eq!(after.perm(), 0o600);
        // The copy really lives in the delta now.
        assert!(f.overlay.get_delta().lstat(&f.ctx, "/stable").await.is_ok());
    }

    #[tokio::test]
    async fn test_overlay_handle_swaps_base_to_delta() {
        let f = fixture(&[("/swap", b"original")]).await;

        let file = f.overlay.open(&f.ctx, "/swap", libc::O_RDONLY).await.unwrap();
        let mut buf = vec![0u8; 8];
        let n = file.read(&f.ctx, &mut buf, 0).await.unwrap();
        assert_eq!(&buf[..n], b"original");

        // Writing through the same handle triggers copy-up and the swap.
        file.write(&f.ctx, b"REWRITE!", 0).await.unwrap();
        let n = file.read(&f.ctx, &mut buf, 0).await.unwrap();
        assert_eq!(&buf[..n], b"REWRITE!");

        assert!(f.overlay.get_delta().lstat(&f.ctx, "/swap").await.is_ok());
        assert_eq!(std::fs::read(f.base_root.join("swap")).unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_overlay_readdir_merges_layers() {
        let f = fixture(&[("/dir/from_base", b"1"), ("/dir/shadowed", b"base")]).await;

        let (file, _) = f.overlay.create(&f.ctx, "/dir/from_delta", 0o644).await.unwrap();
        file.close().await.unwrap();
        // Shadow a base entry from the delta.
        f.overlay
            .truncate(&f.ctx, "/dir/shadowed", 0)
            .await
            .unwrap();

        let mut names: Vec<String> = f
            .overlay
            .readdir(&f.ctx, "/dir")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "from_base".to_string(),
                "from_delta".to_string(),
                "shadowed".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_overlay_recreate_after_unlink_clears_whiteout() {
        let f = fixture(&[("/w", b"base")]).await;

        f.overlay.remove(&f.ctx, "/w").await.unwrap();
        assert!(f.overlay.get_whiteout().has_exact("/w"));

        let (file, _) = f.overlay.create(&f.ctx, "/w", 0o644).await.unwrap();
        file.write(&f.ctx, b"new", 0).await.unwrap();
        file.close().await.unwrap();

        assert!(!f.overlay.get_whiteout().has_exact("/w"));
        assert!(!f
            .overlay
            .get_delta()
            .store()
            .has_whiteout("/w")
            .await
            .unwrap());
        assert_eq!(read_all(&f, "/w", 3).await, b"new");
    }

    #[tokio::test]
    async fn test_overlay_whiteout_index_matches_store_after_rebuild() {
        let f = fixture(&[("/p/q", b"1"), ("/p/r", b"2"), ("/s", b"3")]).await;

        f.overlay.remove(&f.ctx, "/p/q").await.unwrap();
        f.overlay.remove(&f.ctx, "/s").await.unwrap();

        let rebuilt = WhiteoutIndex::new();
        let mut from_store = f
            .overlay
            .get_delta()
            .store()
            .list_whiteouts()
            .await
            .unwrap();
        rebuilt.load(&from_store);

        let mut from_index = f.overlay.get_whiteout().all();
        from_index.sort();
        from_store.sort();
        let mut from_rebuilt = rebuilt.all();
        from_rebuilt.sort();

        assert_eq!(from_index, from_store);
        assert_eq!(from_rebuilt, from_store);
    }

    #[tokio::test]
    async fn test_overlay_parent_dirs_preserve_base_permission_bits() {
        let base_dir = tempdir().unwrap();
        let special = base_dir.path().join("special");
        std::fs::create_dir(&special).unwrap();
        std::fs::write(special.join("file"), b"x").unwrap();
        std::fs::set_permissions(&special, std::os::unix::fs::PermissionsExt::from_mode(0o711))
            .unwrap();

        let delta_dir = tempdir().unwrap();
        let store = Store::open(StoreConfig::new(delta_dir.path().join("delta.db")))
            .await
            .unwrap();
        let base = Arc::new(BaseFs::new(base_dir.path()).unwrap());
        let delta = Arc::new(DeltaFs::new(Arc::new(store)));
        let overlay = OverlayFs::new(base, delta).await.unwrap();
        let ctx = CancellationToken::new();

        let (file, _) = overlay.create(&ctx, "/special/new", 0o644).await.unwrap();
        file.close().await.unwrap();

        let dir_stats = overlay.get_delta().lstat(&ctx, "/special").await.unwrap();
        assert_eq!(dir_stats.perm(), 0o711);
    }

    #[tokio::test]
    async fn test_overlay_truncate_copies_up_base_file() {
        let f = fixture(&[("/big", b"0123456789")]).await;

        f.overlay.truncate(&f.ctx, "/big", 4).await.unwrap();

        assert_eq!(f.overlay.lstat(&f.ctx, "/big").await.unwrap().size, 4);
        assert_eq!(read_all(&f, "/big", 10).await, b"0123");
        assert_eq!(
            std::fs::read(f.base_root.join("big")).unwrap(),
            b"0123456789"
        );
    }

    #[tokio::test]
    async fn test_overlay_link_from_base_source() {
        let f = fixture(&[("/orig", b"linked")]).await;

        f.overlay.link(&f.ctx, "/orig", "/alias").await.unwrap();

        assert_eq!(read_all(&f, "/alias", 6).await, b"linked");
        let orig = f.overlay.get_delta().lstat(&f.ctx, "/orig").await.unwrap();
        let alias = f.overlay.get_delta().lstat(&f.ctx, "/alias").await.unwrap();
        assert_eq!(orig.ino, alias.ino);
        assert_eq!(orig.nlink, 2);
    }

    #[tokio::test]
    async fn test_overlay_cancelled_token_interrupts() {
        let f = fixture(&[("/x", b"y")]).await;

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(matches!(
            f.overlay.lstat(&cancelled, "/x").await,
            Err(FsError::Interrupted)
        ));
    }
}
