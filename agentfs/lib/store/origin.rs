use sqlx::{Row, SqliteConnection};

use super::Store;
use crate::FsResult;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Store {
    /// Records a mapping from a delta inode to the base inode it was copied
    /// from, so the merged view keeps reporting the base's stable inode
    /// number after copy-up.
    pub async fn add_origin(&self, delta_ino: u64, base_ino: u64) -> FsResult<()> {
        sqlx::query("INSERT OR REPLACE INTO fs_origin (delta_ino, base_ino) VALUES (?, ?)")
            .bind(delta_ino as i64)
            .bind(base_ino as i64)
            .execute(self.writer())
            .await?;
        Ok(())
    }

    /// Records an origin mapping within a transaction.
    pub async fn add_origin_tx(
        &self,
        tx: &mut SqliteConnection,
        delta_ino: u64,
        base_ino: u64,
    ) -> FsResult<()> {
        sqlx::query("INSERT OR REPLACE INTO fs_origin (delta_ino, base_ino) VALUES (?, ?)")
            .bind(delta_ino as i64)
            .bind(base_ino as i64)
            .execute(&mut *tx)
            .await?;
        Ok(())
    }

    /// Returns the base inode a delta inode was copied from, or `None` when
    /// the entity was created in the delta.
    pub async fn get_origin(&self, delta_ino: u64) -> FsResult<Option<u64>> {
        let base_ino: Option<i64> =
            sqlx::query_scalar("SELECT base_ino FROM fs_origin WHERE delta_ino = ?")
                .bind(delta_ino as i64)
                .fetch_optional(self.readers())
                .await?;
        Ok(base_ino.map(|ino| ino as u64))
    }

    /// Removes the origin mapping for a delta inode.
    pub async fn delete_origin(&self, delta_ino: u64) -> FsResult<()> {
        sqlx::query("DELETE FROM fs_origin WHERE delta_ino = ?")
            .bind(delta_ino as i64)
            .execute(self.writer())
            .await?;
        Ok(())
    }

    /// Returns true if a delta inode has an origin mapping.
    pub async fn has_origin(&self, delta_ino: u64) -> FsResult<bool> {
        Ok(self.get_origin(delta_ino).await?.is_some())
    }

    /// Returns all origin mappings.
    pub async fn list_origins(&self) -> FsResult<Vec<(u64, u64)>> {
        let rows = sqlx::query("SELECT delta_ino, base_ino FROM fs_origin")
            .fetch_all(self.readers())
            .await?;
        let mut origins = Vec::with_capacity(rows.len());
        for row in rows {
            origins.push((
                row.try_get::<i64, _>("delta_ino")? as u64,
                row.try_get::<i64, _>("base_ino")? as u64,
            ));
        }
        Ok(origins)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
