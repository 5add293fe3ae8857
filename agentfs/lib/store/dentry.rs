use sqlx::{Row, SqliteConnection};

use super::Store;
use crate::{
    stats::{S_IFDIR, S_IFMT},
    FsError, FsResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A directory entry: a `(parent inode, name)` to child inode mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dentry {
    /// Inode of the containing directory.
    pub parent_ino: u64,

    /// Entry name.
    pub name: String,

    /// Inode of the entry.
    pub ino: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Store {
    /// Finds a child inode by name in a directory.
    pub async fn lookup(&self, parent_ino: u64, name: &str) -> FsResult<u64> {
        let ino: Option<i64> =
            sqlx::query_scalar("SELECT ino FROM fs_dentry WHERE parent_ino = ? AND name = ?")
                .bind(parent_ino as i64)
                .bind(name)
                .fetch_optional(self.readers())
                .await?;
        ino.map(|ino| ino as u64)
            .ok_or_else(|| FsError::NotFound(format!("dentry ({parent_ino}, {name})")))
    }

    /// Lists all entries in a directory, ordered by name ascending.
    pub async fn list_dir(&self, parent_ino: u64) -> FsResult<Vec<Dentry>> {
        let rows =
            sqlx::query("SELECT name, ino FROM fs_dentry WHERE parent_ino = ? ORDER BY name")
                .bind(parent_ino as i64)
                .fetch_all(self.readers())
                .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(Dentry {
                parent_ino,
                name: row.try_get("name")?,
                ino: row.try_get::<i64, _>("ino")? as u64,
            });
        }
        Ok(entries)
    }

    /// Creates a new directory entry.
    ///
    /// ## Errors
    ///
    /// Returns `AlreadyExists` when `(parent_ino, name)` is already taken.
    pub async fn create_dentry(&self, parent_ino: u64, name: &str, ino: u64) -> FsResult<()> {
        let result = sqlx::query("INSERT INTO fs_dentry (parent_ino, name, ino) VALUES (?, ?, ?)")
            .bind(parent_ino as i64)
            .bind(name)
            .bind(ino as i64)
            .execute(self.writer())
            .await;
        map_dentry_insert(result, parent_ino, name)
    }

    /// Creates a directory entry within a transaction.
    pub async fn create_dentry_tx(
        &self,
        tx: &mut SqliteConnection,
        parent_ino: u64,
        name: &str,
        ino: u64,
    ) -> FsResult<()> {
        let result = sqlx::query("INSERT INTO fs_dentry (parent_ino, name, ino) VALUES (?, ?, ?)")
            .bind(parent_ino as i64)
            .bind(name)
            .bind(ino as i64)
            .execute(&mut *tx)
            .await;
        map_dentry_insert(result, parent_ino, name)
    }

    /// Removes a directory entry.
    pub async fn delete_dentry(&self, parent_ino: u64, name: &str) -> FsResult<()> {
        let result = sqlx::query("DELETE FROM fs_dentry WHERE parent_ino = ? AND name = ?")
            .bind(parent_ino as i64)
            .bind(name)
            .execute(self.writer())
            .await?;
        if result.rows_affected() == 0 {
            return Err(FsError::NotFound(format!("dentry ({parent_ino}, {name})")));
        }
        Ok(())
    }

    /// Removes a directory entry within a transaction.
    pub async fn delete_dentry_tx(
        &self,
        tx: &mut SqliteConnection,
        parent_ino: u64,
        name: &str,
    ) -> FsResult<()> {
        let result = sqlx::query("DELETE FROM fs_dentry WHERE parent_ino = ? AND name = ?")
            .bind(parent_ino as i64)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(FsError::NotFound(format!("dentry ({parent_ino}, {name})")));
        }
        Ok(())
    }

    /// Atomically moves a directory entry, replacing any existing destination.
    ///
    /// A destination directory must be empty (`NotEmpty` otherwise). The
    /// replaced inode's link count is decremented and the inode reaped when it
    /// reaches zero; its data, symlink and origin rows cascade in the same
    /// transaction.
    pub async fn rename(
        &self,
        old_parent_ino: u64,
        new_parent_ino: u64,
        old_name: &str,
        new_name: &str,
    ) -> FsResult<()> {
        let mut tx = self.begin().await?;

        let ino: i64 =
            sqlx::query_scalar("SELECT ino FROM fs_dentry WHERE parent_ino = ? AND name = ?")
                .bind(old_parent_ino as i64)
                .bind(old_name)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| {
                    FsError::NotFound(format!("dentry ({old_parent_ino}, {old_name})"))
                })?;

        let target: Option<i64> =
            sqlx::query_scalar("SELECT ino FROM fs_dentry WHERE parent_ino = ? AND name = ?")
                .bind(new_parent_ino as i64)
                .bind(new_name)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some(target_ino) = target {
            let target_mode: Option<i64> =
                sqlx::query_scalar("SELECT mode FROM fs_inode WHERE ino = ?")
                    .bind(target_ino)
                    .fetch_optional(&mut *tx)
                    .await?;

            if let Some(mode) = target_mode {
                if mode as u32 & S_IFMT == S_IFDIR {
                    let children: i64 =
                        sqlx::query_scalar("SELECT COUNT(*) FROM fs_dentry WHERE parent_ino = ?")
                            .bind(target_ino)
                            .fetch_one(&mut *tx)
                            .await?;
                    if children > 0 {
                        return Err(FsError::NotEmpty(new_name.to_string()));
                    }
                }
            }

            sqlx::query("DELETE FROM fs_dentry WHERE parent_ino = ? AND name = ?")
                .bind(new_parent_ino as i64)
                .bind(new_name)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE fs_inode SET nlink = nlink - 1 WHERE ino = ?")
                .bind(target_ino)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM fs_inode WHERE ino = ? AND nlink = 0")
                .bind(target_ino)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM fs_dentry WHERE parent_ino = ? AND name = ?")
            .bind(old_parent_ino as i64)
            .bind(old_name)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO fs_dentry (parent_ino, name, ino) VALUES (?, ?, ?)")
            .bind(new_parent_ino as i64)
            .bind(new_name)
            .bind(ino)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Returns true if the directory has any entries.
    pub async fn has_children(&self, parent_ino: u64) -> FsResult<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fs_dentry WHERE parent_ino = ?")
            .bind(parent_ino as i64)
            .fetch_one(self.readers())
            .await?;
        Ok(count > 0)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn map_dentry_insert(
    result: Result<sqlx::sqlite::SqliteQueryResult, sqlx::Error>,
    parent_ino: u64,
    name: &str,
) -> FsResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(FsError::AlreadyExists(
            format!("dentry ({parent_ino}, {name})"),
        )),
        Err(err) => Err(err.into()),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
