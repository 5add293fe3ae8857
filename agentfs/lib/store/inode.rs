use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use super::{db::now_unix, Store};
use crate::{
    stats::{S_IFDIR, S_IFLNK, S_IFMT, S_IFREG},
    FsError, FsResult, Stats,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A row of the inode table: type and permission bits, link count, ownership,
/// size and the three Unix timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    /// Inode number.
    pub ino: u64,

    /// File type and permission bits.
    pub mode: u32,

    /// Number of hard links.
    pub nlink: u32,

    /// Owner user ID.
    pub uid: u32,

    /// Owner group ID.
    pub gid: u32,

    /// Size in bytes.
    pub size: u64,

    /// Access time (Unix timestamp, seconds).
    pub atime: i64,

    /// Modification time (Unix timestamp, seconds).
    pub mtime: i64,

    /// Status-change time (Unix timestamp, seconds).
    pub ctime: i64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Inode {
    /// Returns true if the inode is a directory.
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// Returns true if the inode is a regular file.
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// Returns true if the inode is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// Converts the inode row into the interface-facing stats record.
    pub fn to_stats(&self) -> Stats {
        Stats {
            ino: self.ino,
            mode: self.mode,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            size: self.size,
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }
}

impl Store {
    /// Creates a new inode and returns its number.
    ///
    /// The new inode starts with link count 1, size 0 and all three times set
    /// to now.
    pub async fn create_inode(&self, mode: u32, uid: u32, gid: u32) -> FsResult<u64> {
        let now = now_unix();
        let result = sqlx::query(
            "INSERT INTO fs_inode (mode, nlink, uid, gid, size, atime, mtime, ctime)
             VALUES (?, 1, ?, ?, 0, ?, ?, ?)",
        )
        .bind(mode as i64)
        .bind(uid as i64)
        .bind(gid as i64)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(self.writer())
        .await?;
        Ok(result.last_insert_rowid() as u64)
    }

    /// Creates a new inode within a transaction.
    pub async fn create_inode_tx(
        &self,
        tx: &mut SqliteConnection,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> FsResult<u64> {
        let now = now_unix();
        let result = sqlx::query(
            "INSERT INTO fs_inode (mode, nlink, uid, gid, size, atime, mtime, ctime)
             VALUES (?, 1, ?, ?, 0, ?, ?, ?)",
        )
        .bind(mode as i64)
        .bind(uid as i64)
        .bind(gid as i64)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        Ok(result.last_insert_rowid() as u64)
    }

    /// Retrieves an inode by number.
    pub async fn get_inode(&self, ino: u64) -> FsResult<Inode> {
        let row = sqlx::query(
            "SELECT ino, mode, nlink, uid, gid, size, atime, mtime, ctime
             FROM fs_inode WHERE ino = ?",
        )
        .bind(ino as i64)
        .fetch_optional(self.readers())
        .await?
        .ok_or_else(|| FsError::NotFound(format!("inode {ino}")))?;
        row_to_inode(&row)
    }

    /// Updates the size of a file, advancing mtime and ctime.
    pub async fn update_size(&self, ino: u64, size: u64) -> FsResult<()> {
        let now = now_unix();
        sqlx::query("UPDATE fs_inode SET size = ?, mtime = ?, ctime = ? WHERE ino = ?")
            .bind(size as i64)
            .bind(now)
            .bind(now)
            .bind(ino as i64)
            .execute(self.writer())
            .await?;
        Ok(())
    }

    /// Updates the size within a transaction.
    pub async fn update_size_tx(
        &self,
        tx: &mut SqliteConnection,
        ino: u64,
        size: u64,
    ) -> FsResult<()> {
        let now = now_unix();
        sqlx::query("UPDATE fs_inode SET size = ?, mtime = ?, ctime = ? WHERE ino = ?")
            .bind(size as i64)
            .bind(now)
            .bind(now)
            .bind(ino as i64)
            .execute(&mut *tx)
            .await?;
        Ok(())
    }

    /// Updates access and modification times.
    ///
    /// Absent values leave the corresponding time unchanged; ctime always
    /// advances.
    pub async fn update_times(
        &self,
        ino: u64,
        atime: Option<i64>,
        mtime: Option<i64>,
    ) -> FsResult<()> {
        let now = now_unix();
        sqlx::query(
            "UPDATE fs_inode
             SET atime = COALESCE(?, atime), mtime = COALESCE(?, mtime), ctime = ?
             WHERE ino = ?",
        )
        .bind(atime)
        .bind(mtime)
        .bind(now)
        .bind(ino as i64)
        .execute(self.writer())
        .await?;
        Ok(())
    }

    /// Sets inode attributes for chmod, chown, truncate and utimens.
    ///
    /// A new mode keeps the type bits and replaces the permission bits. Runs
    /// as a single read-modify-write transaction; ctime always advances.
    #[allow(clippy::too_many_arguments)]
    pub async fn set_attr(
        &self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<i64>,
        mtime: Option<i64>,
    ) -> FsResult<()> {
        let mut tx = self.begin().await?;

        let row = sqlx::query(
            "SELECT ino, mode, nlink, uid, gid, size, atime, mtime, ctime
             FROM fs_inode WHERE ino = ?",
        )
        .bind(ino as i64)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| FsError::NotFound(format!("inode {ino}")))?;
        let mut inode = row_to_inode(&row)?;

        if let Some(mode) = mode {
            inode.mode = (inode.mode & S_IFMT) | (mode & !S_IFMT);
        }
        if let Some(uid) = uid {
            inode.uid = uid;
        }
        if let Some(gid) = gid {
            inode.gid = gid;
        }
        if let Some(size) = size {
            inode.size = size;
        }
        if let Some(atime) = atime {
            inode.atime = atime;
        }
        if let Some(mtime) = mtime {
            inode.mtime = mtime;
        }
        inode.ctime = now_unix();

        sqlx::query(
            "UPDATE fs_inode
             SET mode = ?, uid = ?, gid = ?, size = ?, atime = ?, mtime = ?, ctime = ?
             WHERE ino = ?",
        )
        .bind(inode.mode as i64)
        .bind(inode.uid as i64)
        .bind(inode.gid as i64)
        .bind(inode.size as i64)
        .bind(inode.atime)
        .bind(inode.mtime)
        .bind(inode.ctime)
        .bind(ino as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Deletes an inode row. Callers only do this when the link count has
    /// reached zero; data, symlink and origin rows cascade.
    pub async fn delete_inode(&self, ino: u64) -> FsResult<()> {
        sqlx::query("DELETE FROM fs_inode WHERE ino = ?")
            .bind(ino as i64)
            .execute(self.writer())
            .await?;
        Ok(())
    }

    /// Deletes an inode row within a transaction.
    pub async fn delete_inode_tx(&self, tx: &mut SqliteConnection, ino: u64) -> FsResult<()> {
        sqlx::query("DELETE FROM fs_inode WHERE ino = ?")
            .bind(ino as i64)
            .execute(&mut *tx)
            .await?;
        Ok(())
    }

    /// Increments the link count.
    pub async fn incr_nlink(&self, ino: u64) -> FsResult<()> {
        sqlx::query("UPDATE fs_inode SET nlink = nlink + 1, ctime = ? WHERE ino = ?")
            .bind(now_unix())
            .bind(ino as i64)
            .execute(self.writer())
            .await?;
        Ok(())
    }

    /// Increments the link count within a transaction.
    pub async fn incr_nlink_tx(&self, tx: &mut SqliteConnection, ino: u64) -> FsResult<()> {
        sqlx::query("UPDATE fs_inode SET nlink = nlink + 1, ctime = ? WHERE ino = ?")
            .bind(now_unix())
            .bind(ino as i64)
            .execute(&mut *tx)
            .await?;
        Ok(())
    }

    /// Decrements the link count and returns the new count. Callers cascade
    /// deletion when it reaches zero.
    pub async fn decr_nlink(&self, ino: u64) -> FsResult<u32> {
        let mut tx = self.begin().await?;
        let nlink = self.decr_nlink_tx(&mut tx, ino).await?;
        tx.commit().await?;
        Ok(nlink)
    }

    /// Decrements the link count within a transaction, returning the new
    /// count.
    pub async fn decr_nlink_tx(&self, tx: &mut SqliteConnection, ino: u64) -> FsResult<u32> {
        sqlx::query("UPDATE fs_inode SET nlink = nlink - 1, ctime = ? WHERE ino = ?")
            .bind(now_unix())
            .bind(ino as i64)
            .execute(&mut *tx)
            .await?;

        let nlink: i64 = sqlx::query_scalar("SELECT nlink FROM fs_inode WHERE ino = ?")
            .bind(ino as i64)
            .fetch_one(&mut *tx)
            .await?;
        Ok(nlink as u32)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

pub(crate) fn row_to_inode(row: &SqliteRow) -> FsResult<Inode> {
    Ok(Inode {
        ino: row.try_get::<i64, _>("ino")? as u64,
        mode: row.try_get::<i64, _>("mode")? as u32,
        nlink: row.try_get::<i64, _>("nlink")? as u32,
        uid: row.try_get::<i64, _>("uid")? as u32,
        gid: row.try_get::<i64, _>("gid")? as u32,
        size: row.try_get::<i64, _>("size")? as u64,
        atime: row.try_get("atime")?,
        mtime: row.try_get("mtime")?,
        ctime: row.try_get("ctime")?,
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::StoreConfig;
    use super::*;
    use tempfile::tempdir;

    async fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempdir().unwrap();
        let store = Store::open(StoreConfig::new(dir.path().join("delta.db")))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_inode_create_and_get() {
        let (_dir, store) = open_store().await;

        let ino = store.create_inode(S_IFREG | 0o644, 10, 20).await.unwrap();
        let inode = store.get_inode(ino).await.unwrap();

        assert_eq!(inode.ino, ino);
        assert!(inode.is_regular());
        assert_eq!(inode.mode & 0o777, 0o644);
        assert_eq!(inode.nlink, 1);
        assert_eq!((inode.uid, inode.gid), (10, 20));
        assert_eq!(inode.size, 0);
    }

    #[tokio::test]
    async fn test_inode_nlink_adjustment() {
        let (_dir, store) = open_store().await;

        let ino = store.create_inode(S_IFREG | 0o644, 0, 0).await.unwrap();
        store.incr_nlink(ino).await.unwrap();
        assert_eq!(store.get_inode(ino).await.unwrap().nlink, 2);

        assert_eq!(store.decr_nlink(ino).await.unwrap(), 1);
        assert_eq!(store.decr_nlink(ino).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_inode_set_attr_preserves_type() {
        let (_dir, store) = open_store().await;

        let ino = store.create_inode(S_IFREG | 0o644, 0, 0).await.unwrap();
        store
            .set_attr(ino, Some(0o600), None, None, None, None, None)
            .await
            .unwrap();

        let inode = store.get_inode(ino).await.unwrap();
        assert!(inode.is_regular());
        assert_eq!(inode.mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_inode_update_times_partial() {
        let (_dir, store) = open_store().await;

        let ino = store.create_inode(S_IFREG | 0o644, 0, 0).await.unwrap();
        let before = store.get_inode(ino).await.unwrap();

        store.update_times(ino, Some(12345), None).await.unwrap();
        let after = store.get_inode(ino).await.unwrap();

        assert_eq!(after.atime, 12345);
        assert_eq!(after.mtime, before.mtime);
    }

    #[tokio::test]
    async fn test_inode_get_missing() {
        let (_dir, store) = open_store().await;
        assert!(matches!(
            store.get_inode(999).await,
            Err(FsError::NotFound(_))
        ));
    }
}
