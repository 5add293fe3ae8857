use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use fuser::{BackgroundSession, MountOption};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{FsError, FsResult, OverlayFs};

use super::OverlayFuse;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A mounted overlay filesystem.
///
/// This is the handle the isolation launcher holds on to: it binds the mount
/// point into its sandbox and calls [`FuseMount::unmount`] on teardown.
/// Dropping the handle unmounts as well.
pub struct FuseMount {
    session: Option<BackgroundSession>,
    mountpoint: PathBuf,
    cancel: CancellationToken,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Mounts the merged overlay view at the given mount point.
///
/// The FUSE session runs on its own background thread; callback work is
/// dispatched onto the current tokio runtime, so this must be called from
/// within one.
pub fn mount(overlay: Arc<OverlayFs>, mountpoint: impl AsRef<Path>) -> FsResult<FuseMount> {
    let mountpoint = mountpoint.as_ref().to_path_buf();
    let cancel = CancellationToken::new();
    let adapter = OverlayFuse::new(overlay, cancel.clone());

    let options = [MountOption::FSName("agentfs".to_string())];
    let session =
        fuser::spawn_mount2(adapter, &mountpoint, &options).map_err(FsError::Io)?;

    info!(mountpoint = %mountpoint.display(), "mounted overlay");
    Ok(FuseMount {
        session: Some(session),
        mountpoint,
        cancel,
    })
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FuseMount {
    /// Returns the mount point path.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmounts the filesystem and tears the session down.
    pub fn unmount(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        self.cancel.cancel();
        if let Some(session) = self.session.take() {
            session.join();
            info!(mountpoint = %self.mountpoint.display(), "unmounted overlay");
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for FuseMount {
    fn drop(&mut self) {
        self.teardown();
    }
}
