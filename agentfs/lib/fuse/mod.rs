//! FUSE adapter for the merged overlay view.
//!
//! Translates kernel filesystem callbacks one-to-one into
//! [`FileSystem`](crate::FileSystem) calls on an [`OverlayFs`], mapping error
//! kinds to POSIX errnos at the boundary. The kernel driver addresses
//! everything by inode, while the overlay is path-keyed, so the adapter keeps
//! a bidirectional inode/path table plus a table of open file handles.

mod attr;
mod mount;

use std::{
    collections::HashMap,
    ffi::OsStr,
    future::Future,
    io,
    path::Path,
    sync::Arc,
    time::SystemTime,
};

use fuser::{
    KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow, FUSE_ROOT_ID,
};
use libc::c_int;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::attr::{mode_to_kind, stats_to_attr};
use crate::{
    defaults::DEFAULT_ATTR_TTL,
    filesystem::File,
    path::join_child,
    FileSystem, FsError, FsResult, OverlayFs, Stats,
};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use mount::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The fuser callback handler over an [`OverlayFs`].
///
/// Kernel callbacks arrive synchronously; each one is bridged onto the tokio
/// runtime that owns the overlay's store. Blocking here is by design: the
/// kernel thread waits for the operation it asked for.
pub struct OverlayFuse {
    overlay: Arc<OverlayFs>,
    tokio_handle: tokio::runtime::Handle,
    cancel: CancellationToken,

    /// Adapter inode -> virtual path.
    inodes: HashMap<u64, String>,

    /// Virtual path -> adapter inode.
    paths: HashMap<String, u64>,

    next_inode: u64,

    /// Open file handles, keyed by the fh returned to the kernel.
    handles: HashMap<u64, Arc<dyn File>>,

    next_handle: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OverlayFuse {
    /// Creates an adapter over the overlay.
    ///
    /// Must be called from within a tokio runtime; the adapter captures the
    /// runtime handle to dispatch callback work.
    pub fn new(overlay: Arc<OverlayFs>, cancel: CancellationToken) -> Self {
        let mut inodes = HashMap::new();
        let mut paths = HashMap::new();
        inodes.insert(FUSE_ROOT_ID, "/".to_string());
        paths.insert("/".to_string(), FUSE_ROOT_ID);

        Self {
            overlay,
            tokio_handle: tokio::runtime::Handle::current(),
            cancel,
            inodes,
            paths,
            next_inode: FUSE_ROOT_ID + 1,
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Runs an overlay operation to completion on the runtime.
    fn run<T, F>(&self, fut: F) -> FsResult<T>
    where
        T: Send + 'static,
        F: Future<Output = FsResult<T>> + Send + 'static,
    {
        match self.tokio_handle.block_on(self.tokio_handle.spawn(fut)) {
            Ok(result) => result,
            Err(err) => {
                warn!(?err, "filesystem task failed");
                Err(FsError::Io(io::Error::other("filesystem task failed")))
            }
        }
    }

    fn path_for(&self, ino: u64) -> Option<String> {
        self.inodes.get(&ino).cloned()
    }

    /// Builds the child path for a `(parent inode, name)` callback pair.
    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let parent_path = self.path_for(parent).ok_or(libc::ENOENT)?;
        let name = name.to_str().ok_or(libc::EINVAL)?;
        Ok(join_child(&parent_path, name))
    }

    fn ino_for(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.paths.get(path) {
            return ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.inodes.insert(ino, path.to_string());
        self.paths.insert(path.to_string(), ino);
        ino
    }

    fn forget_path(&mut self, path: &str) {
        if let Some(ino) = self.paths.remove(path) {
            self.inodes.remove(&ino);
        }
    }

    /// Rewrites the tracked path of a renamed entry and everything beneath
    /// it, so directory renames do not leave stale children in the table.
    fn rename_tracked(&mut self, old_path: &str, new_path: &str) {
        let old_prefix = format!("{old_path}/");
        let moved: Vec<(String, u64)> = self
            .paths
            .iter()
            .filter(|(path, _)| *path == old_path || path.starts_with(&old_prefix))
            .map(|(path, ino)| (path.clone(), *ino))
            .collect();

        for (path, ino) in moved {
            let relocated = format!("{new_path}{}", &path[old_path.len()..]);
            self.paths.remove(&path);
            self.paths.insert(relocated.clone(), ino);
            self.inodes.insert(ino, relocated);
        }
    }

    fn lstat_sync(&self, path: String) -> FsResult<Stats> {
        let overlay = Arc::clone(&self.overlay);
        let ctx = self.cancel.clone();
        self.run(async move { overlay.lstat(&ctx, &path).await })
    }

    fn reply_entry_for(&mut self, path: String, reply: ReplyEntry) {
        match self.lstat_sync(path.clone()) {
            Ok(stats) => {
                let ino = self.ino_for(&path);
                reply.entry(&DEFAULT_ATTR_TTL, &stats_to_attr(&stats, ino), 0);
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fuser::Filesystem for OverlayFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("overlay FUSE adapter initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        self.cancel.cancel();
        info!("overlay FUSE adapter destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        self.reply_entry_for(path, reply);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.lstat_sync(path) {
            Ok(stats) => reply.attr(&DEFAULT_ATTR_TTL, &stats_to_attr(&stats, ino)),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let overlay = Arc::clone(&self.overlay);
        let ctx = self.cancel.clone();
        let target = path.clone();
        let atime = atime.map(time_or_now_to_unix);
        let mtime = mtime.map(time_or_now_to_unix);

        let result = self.run(async move {
            if let Some(size) = size {
                overlay.truncate(&ctx, &target, size).await?;
            }
            if let Some(mode) = mode {
                overlay.chmod(&ctx, &target, mode).await?;
            }
            if uid.is_some() || gid.is_some() {
                let current = overlay.lstat(&ctx, &target).await?;
                overlay
                    .chown(
                        &ctx,
                        &target,
                        uid.unwrap_or(current.uid),
                        gid.unwrap_or(current.gid),
                    )
                    .await?;
            }
            if atime.is_some() || mtime.is_some() {
                overlay.utimens(&ctx, &target, atime, mtime).await?;
            }
            overlay.lstat(&ctx, &target).await
        });

        match result {
            Ok(stats) => reply.attr(&DEFAULT_ATTR_TTL, &stats_to_attr(&stats, ino)),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let overlay = Arc::clone(&self.overlay);
        let ctx = self.cancel.clone();
        match self.run(async move { overlay.readlink(&ctx, &path).await }) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let overlay = Arc::clone(&self.overlay);
        let ctx = self.cancel.clone();
        let target = path.clone();
        match self.run(async move { overlay.mkdir(&ctx, &target, mode).await }) {
            Ok(()) => self.reply_entry_for(path, reply),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let overlay = Arc::clone(&self.overlay);
        let ctx = self.cancel.clone();
        let target = path.clone();
        match self.run(async move { overlay.remove(&ctx, &target).await }) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let overlay = Arc::clone(&self.overlay);
        let ctx = self.cancel.clone();
        let target = path.clone();
        match self.run(async move { overlay.rmdir(&ctx, &target).await }) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, link_name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let Some(target) = target.to_str().map(str::to_string) else {
            reply.error(libc::EINVAL);
            return;
        };

        let overlay = Arc::clone(&self.overlay);
        let ctx = self.cancel.clone();
        let link_path = path.clone();
        match self.run(async move { overlay.symlink(&ctx, &target, &link_path).await }) {
            Ok(()) => self.reply_entry_for(path, reply),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let old_path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let new_path = match self.child_path(newparent, newname) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let overlay = Arc::clone(&self.overlay);
        let ctx = self.cancel.clone();
        let (src, dst) = (old_path.clone(), new_path.clone());
        match self.run(async move { overlay.rename(&ctx, &src, &dst).await }) {
            Ok(()) => {
                self.forget_path(&new_path);
                self.rename_tracked(&old_path, &new_path);
                reply.ok();
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let Some(old_path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let new_path = match self.child_path(newparent, newname) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let overlay = Arc::clone(&self.overlay);
        let ctx = self.cancel.clone();
        let (src, dst) = (old_path, new_path.clone());
        match self.run(async move { overlay.link(&ctx, &src, &dst).await }) {
            Ok(()) => self.reply_entry_for(new_path, reply),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let overlay = Arc::clone(&self.overlay);
        let ctx = self.cancel.clone();
        match self.run(async move { overlay.open(&ctx, &path, flags).await }) {
            Ok(file) => {
                let fh = self.next_handle;
                self.next_handle += 1;
                self.handles.insert(fh, Arc::from(file));
                reply.opened(fh, 0);
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let overlay = Arc::clone(&self.overlay);
        let ctx = self.cancel.clone();
        let target = path.clone();
        match self.run(async move { overlay.create(&ctx, &target, mode).await }) {
            Ok((file, stats)) => {
                let ino = self.ino_for(&path);
                let fh = self.next_handle;
                self.next_handle += 1;
                self.handles.insert(fh, Arc::from(file));
                reply.created(&DEFAULT_ATTR_TTL, &stats_to_attr(&stats, ino), 0, fh, 0);
            }
            Err(err) => reply.error(err.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(file) = self.handles.get(&fh).cloned() else {
            reply.error(libc::EBADF);
            return;
        };

        let ctx = self.cancel.clone();
        let offset = offset.max(0) as u64;
        let result = self.run(async move {
            let mut buf = vec![0u8; size as usize];
            let n = file.read(&ctx, &mut buf, offset).await?;
            buf.truncate(n);
            Ok(buf)
        });

        match result {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(file) = self.handles.get(&fh).cloned() else {
            reply.error(libc::EBADF);
            return;
        };

        let ctx = self.cancel.clone();
        let offset = offset.max(0) as u64;
        let data = data.to_vec();
        match self.run(async move { file.write(&ctx, &data, offset).await }) {
            Ok(n) => reply.written(n as u32),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some(file) = self.handles.get(&fh).cloned() else {
            reply.error(libc::EBADF);
            return;
        };
        let ctx = self.cancel.clone();
        match self.run(async move { file.sync(&ctx).await }) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(file) = self.handles.remove(&fh) else {
            reply.ok();
            return;
        };
        match self.run(async move { file.close().await }) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let Some(file) = self.handles.get(&fh).cloned() else {
            reply.error(libc::EBADF);
            return;
        };
        let ctx = self.cancel.clone();
        match self.run(async move { file.sync(&ctx).await }) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let overlay = Arc::clone(&self.overlay);
        let ctx = self.cancel.clone();
        let dir = path.clone();
        let result = self.run(async move {
            let mut entries = overlay.readdir(&ctx, &dir).await?;
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(entries)
        });

        let entries = match result {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(err.to_errno());
                return;
            }
        };

        for (index, entry) in entries.iter().enumerate().skip(offset.max(0) as usize) {
            let child = join_child(&path, &entry.name);
            let child_ino = self.ino_for(&child);
            debug!(path = %child, ino = child_ino, "readdir entry");
            if reply.add(
                child_ino,
                (index + 1) as i64,
                mode_to_kind(entry.mode),
                &entry.name,
            ) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let overlay = Arc::clone(&self.overlay);
        let ctx = self.cancel.clone();
        match self.run(async move { overlay.statfs(&ctx).await }) {
            Ok(stats) => reply.statfs(
                stats.blocks,
                stats.bfree,
                stats.bavail,
                stats.files,
                stats.ffree,
                stats.bsize,
                stats.namelen,
                stats.bsize,
            ),
            Err(err) => reply.error(err.to_errno()),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let overlay = Arc::clone(&self.overlay);
        let ctx = self.cancel.clone();
        match self.run(async move { overlay.access(&ctx, &path, mask.max(0) as u32).await }) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.to_errno()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn time_or_now_to_unix(time: TimeOrNow) -> i64 {
    match time {
        TimeOrNow::SpecificTime(t) => t
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0),
        TimeOrNow::Now => chrono::Utc::now().timestamp(),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
