use sqlx::{Row, SqliteConnection};

use super::{db::now_unix, Store};
use crate::{
    path::{normalize_path, parent_path},
    FsResult,
};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Store {
    /// Records a whiteout for the given path.
    pub async fn create_whiteout(&self, path: &str) -> FsResult<()> {
        let path = normalize_path(path);
        let parent = parent_path(&path);
        sqlx::query(
            "INSERT OR REPLACE INTO fs_whiteout (path, parent_path, created_at) VALUES (?, ?, ?)",
        )
        .bind(&path)
        .bind(&parent)
        .bind(now_unix())
        .execute(self.writer())
        .await?;
        Ok(())
    }

    /// Records a whiteout within a transaction.
    pub async fn create_whiteout_tx(&self, tx: &mut SqliteConnection, path: &str) -> FsResult<()> {
        let path = normalize_path(path);
        let parent = parent_path(&path);
        sqlx::query(
            "INSERT OR REPLACE INTO fs_whiteout (path, parent_path, created_at) VALUES (?, ?, ?)",
        )
        .bind(&path)
        .bind(&parent)
        .bind(now_unix())
        .execute(&mut *tx)
        .await?;
        Ok(())
    }

    /// Removes the whiteout for the given path, if any.
    pub async fn delete_whiteout(&self, path: &str) -> FsResult<()> {
        sqlx::query("DELETE FROM fs_whiteout WHERE path = ?")
            .bind(normalize_path(path))
            .execute(self.writer())
            .await?;
        Ok(())
    }

    /// Removes a whiteout within a transaction.
    pub async fn delete_whiteout_tx(&self, tx: &mut SqliteConnection, path: &str) -> FsResult<()> {
        sqlx::query("DELETE FROM fs_whiteout WHERE path = ?")
            .bind(normalize_path(path))
            .execute(&mut *tx)
            .await?;
        Ok(())
    }

    /// Removes every whiteout at or beneath the given path.
    pub async fn delete_whiteouts_under(&self, path: &str) -> FsResult<()> {
        let path = normalize_path(path);
        sqlx::query("DELETE FROM fs_whiteout WHERE path = ? OR path LIKE ?")
            .bind(&path)
            .bind(format!("{path}/%"))
            .execute(self.writer())
            .await?;
        Ok(())
    }

    /// Returns true if a whiteout exists for the exact path.
    pub async fn has_whiteout(&self, path: &str) -> FsResult<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fs_whiteout WHERE path = ?")
            .bind(normalize_path(path))
            .fetch_one(self.readers())
            .await?;
        Ok(count > 0)
    }

    /// Returns all whiteout paths, ordered by path.
    pub async fn list_whiteouts(&self) -> FsResult<Vec<String>> {
        let rows = sqlx::query("SELECT path FROM fs_whiteout ORDER BY path")
            .fetch_all(self.readers())
            .await?;
        let mut paths = Vec::with_capacity(rows.len());
        for row in rows {
            paths.push(row.try_get("path")?);
        }
        Ok(paths)
    }

    /// Returns the names of direct children whited out under a directory.
    pub async fn child_whiteouts(&self, parent: &str) -> FsResult<Vec<String>> {
        let rows = sqlx::query("SELECT path FROM fs_whiteout WHERE parent_path = ?")
            .bind(normalize_path(parent))
            .fetch_all(self.readers())
            .await?;
        let mut names = Vec::with_capacity(rows.len());
        for row in rows {
            let path: String = row.try_get("path")?;
            if let Some(name) = crate::path::file_name(&path) {
                names.push(name);
            }
        }
        Ok(names)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
