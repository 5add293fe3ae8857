use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType};

use crate::{
    defaults::DEFAULT_BLOCK_SIZE,
    stats::{S_IFDIR, S_IFLNK, S_IFMT},
    Stats,
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Fills a kernel-facing attribute record from a stats record.
///
/// The inode number is the adapter's table inode, not the layer inode: base
/// and delta inode numbers may collide, so the kernel sees the adapter's
/// stable per-path numbering instead.
pub(crate) fn stats_to_attr(stats: &Stats, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: stats.size,
        blocks: stats.size.div_ceil(512),
        atime: system_time(stats.atime),
        mtime: system_time(stats.mtime),
        ctime: system_time(stats.ctime),
        crtime: system_time(stats.ctime),
        kind: mode_to_kind(stats.mode),
        perm: stats.perm() as u16,
        nlink: stats.nlink,
        uid: stats.uid,
        gid: stats.gid,
        rdev: 0,
        blksize: DEFAULT_BLOCK_SIZE,
        flags: 0,
    }
}

/// Maps mode type bits to the kernel directory-entry type.
pub(crate) fn mode_to_kind(mode: u32) -> FileType {
    match mode & S_IFMT {
        S_IFDIR => FileType::Directory,
        S_IFLNK => FileType::Symlink,
        _ => FileType::RegularFile,
    }
}

fn system_time(ts: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(ts.max(0) as u64)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::S_IFREG;

    #[test]
    fn test_attr_conversion() {
        let stats = Stats {
            ino: 9,
            mode: S_IFREG | 0o640,
            nlink: 2,
            uid: 1000,
            gid: 1000,
            size: 1025,
            atime: 10,
            mtime: 20,
            ctime: 30,
        };

        let attr = stats_to_attr(&stats, 42);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 1025);
        assert_eq!(attr.blocks, 3); // ceil(1025 / 512)
        assert_eq!(attr.perm, 0o640);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.blksize, DEFAULT_BLOCK_SIZE);
        assert_eq!(attr.mtime, UNIX_EPOCH + Duration::from_secs(20));
    }

    #[test]
    fn test_mode_to_kind() {
        assert_eq!(mode_to_kind(S_IFDIR | 0o755), FileType::Directory);
        assert_eq!(mode_to_kind(S_IFLNK | 0o777), FileType::Symlink);
        assert_eq!(mode_to_kind(S_IFREG | 0o644), FileType::RegularFile);
    }
}
