use sqlx::SqliteConnection;

use super::Store;
use crate::{FsError, FsResult};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Store {
    /// Stores a symlink target for an inode.
    pub async fn create_symlink(&self, ino: u64, target: &str) -> FsResult<()> {
        sqlx::query("INSERT INTO fs_symlink (ino, target) VALUES (?, ?)")
            .bind(ino as i64)
            .bind(target)
            .execute(self.writer())
            .await?;
        Ok(())
    }

    /// Stores a symlink target within a transaction.
    pub async fn create_symlink_tx(
        &self,
        tx: &mut SqliteConnection,
        ino: u64,
        target: &str,
    ) -> FsResult<()> {
        sqlx::query("INSERT INTO fs_symlink (ino, target) VALUES (?, ?)")
            .bind(ino as i64)
            .bind(target)
            .execute(&mut *tx)
            .await?;
        Ok(())
    }

    /// Retrieves a symlink target.
    pub async fn read_symlink(&self, ino: u64) -> FsResult<String> {
        let target: Option<String> =
            sqlx::query_scalar("SELECT target FROM fs_symlink WHERE ino = ?")
                .bind(ino as i64)
                .fetch_optional(self.readers())
                .await?;
        target.ok_or_else(|| FsError::NotFound(format!("symlink {ino}")))
    }

    /// Removes a symlink target.
    pub async fn delete_symlink(&self, ino: u64) -> FsResult<()> {
        sqlx::query("DELETE FROM fs_symlink WHERE ino = ?")
            .bind(ino as i64)
            .execute(self.writer())
            .await?;
        Ok(())
    }

    /// Removes a symlink target within a transaction.
    pub async fn delete_symlink_tx(&self, tx: &mut SqliteConnection, ino: u64) -> FsResult<()> {
        sqlx::query("DELETE FROM fs_symlink WHERE ino = ?")
            .bind(ino as i64)
            .execute(&mut *tx)
            .await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
