use sqlx::{Row, SqliteConnection};

use super::Store;
use crate::{FsError, FsResult};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Store {
    /// Reads up to `length` bytes of file data starting at `offset`.
    ///
    /// Range-scans the chunks intersecting the request, slices each to the
    /// intersecting sub-range and overlays them onto a zero-filled buffer, so
    /// absent interior chunks read as zeros. Reads past end-of-file return
    /// short.
    pub async fn read_data(&self, ino: u64, offset: u64, length: u64) -> FsResult<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }

        let size: Option<i64> = sqlx::query_scalar("SELECT size FROM fs_inode WHERE ino = ?")
            .bind(ino as i64)
            .fetch_optional(self.readers())
            .await?;
        let size = size.ok_or_else(|| FsError::NotFound(format!("inode {ino}")))? as u64;

        if offset >= size {
            return Ok(Vec::new());
        }
        let length = length.min(size - offset);

        let chunk_size = self.chunk_size();
        let start_chunk = offset / chunk_size;
        let end_chunk = (offset + length - 1) / chunk_size;

        let rows = sqlx::query(
            "SELECT chunk_index, data FROM fs_data
             WHERE ino = ? AND chunk_index >= ? AND chunk_index <= ?
             ORDER BY chunk_index",
        )
        .bind(ino as i64)
        .bind(start_chunk as i64)
        .bind(end_chunk as i64)
        .fetch_all(self.readers())
        .await?;

        let mut result = vec![0u8; length as usize];
        for row in rows {
            let chunk_index = row.try_get::<i64, _>("chunk_index")? as u64;
            let data: Vec<u8> = row.try_get("data")?;

            let chunk_start = chunk_index * chunk_size;
            let begin = offset.max(chunk_start);
            let end = (offset + length).min(chunk_start + data.len() as u64);
            if end > begin {
                result[(begin - offset) as usize..(end - offset) as usize]
                    .copy_from_slice(&data[(begin - chunk_start) as usize..(end - chunk_start) as usize]);
            }
        }

        Ok(result)
    }

    /// Writes `data` at `offset`, read-modify-writing every intersecting
    /// chunk in one transaction.
    ///
    /// The write does not extend the recorded file size; callers raise it
    /// with [`Store::update_size`] when the write went past end-of-file.
    pub async fn write_data(&self, ino: u64, offset: u64, data: &[u8]) -> FsResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut tx = self.begin().await?;
        self.write_data_tx(&mut tx, ino, offset, data).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Writes data within a transaction.
    pub async fn write_data_tx(
        &self,
        tx: &mut SqliteConnection,
        ino: u64,
        offset: u64,
        data: &[u8],
    ) -> FsResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let chunk_size = self.chunk_size();
        let data_len = data.len() as u64;
        let mut data_offset = 0u64;

        let start_chunk = offset / chunk_size;
        let end_chunk = (offset + data_len - 1) / chunk_size;

        for chunk_index in start_chunk..=end_chunk {
            let chunk_start = chunk_index * chunk_size;
            let write_start = offset.saturating_sub(chunk_start);
            let write_len = (chunk_size - write_start).min(data_len - data_offset);

            // Partial chunk writes keep the bytes around the written range.
            let existing: Option<Vec<u8>> = if write_start > 0 || write_len < chunk_size {
                sqlx::query_scalar("SELECT data FROM fs_data WHERE ino = ? AND chunk_index = ?")
                    .bind(ino as i64)
                    .bind(chunk_index as i64)
                    .fetch_optional(&mut *tx)
                    .await?
            } else {
                None
            };

            let needed = (write_start + write_len) as usize;
            let mut chunk = match existing {
                Some(mut bytes) => {
                    if bytes.len() < needed {
                        bytes.resize(needed, 0);
                    }
                    bytes
                }
                // Zeros ahead of the write position when the chunk is new.
                None => vec![0u8; needed],
            };

            chunk[write_start as usize..needed].copy_from_slice(
                &data[data_offset as usize..(data_offset + write_len) as usize],
            );

            sqlx::query("INSERT OR REPLACE INTO fs_data (ino, chunk_index, data) VALUES (?, ?, ?)")
                .bind(ino as i64)
                .bind(chunk_index as i64)
                .bind(chunk)
                .execute(&mut *tx)
                .await?;

            data_offset += write_len;
        }

        Ok(())
    }

    /// Truncates file data to `size` bytes.
    ///
    /// Chunks wholly past the new size are deleted and the final surviving
    /// chunk is cut to the remainder. Size 0 deletes every chunk.
    pub async fn truncate(&self, ino: u64, size: u64) -> FsResult<()> {
        let mut tx = self.begin().await?;
        self.truncate_tx(&mut tx, ino, size).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Truncates within a transaction.
    pub async fn truncate_tx(
        &self,
        tx: &mut SqliteConnection,
        ino: u64,
        size: u64,
    ) -> FsResult<()> {
        if size == 0 {
            sqlx::query("DELETE FROM fs_data WHERE ino = ?")
                .bind(ino as i64)
                .execute(&mut *tx)
                .await?;
            return Ok(());
        }

        let chunk_size = self.chunk_size();
        let last_chunk = (size - 1) / chunk_size;

        sqlx::query("DELETE FROM fs_data WHERE ino = ? AND chunk_index > ?")
            .bind(ino as i64)
            .bind(last_chunk as i64)
            .execute(&mut *tx)
            .await?;

        let keep = size - last_chunk * chunk_size;
        let existing: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT data FROM fs_data WHERE ino = ? AND chunk_index = ?")
                .bind(ino as i64)
                .bind(last_chunk as i64)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some(data) = existing {
            if data.len() as u64 > keep {
                sqlx::query("UPDATE fs_data SET data = ? WHERE ino = ? AND chunk_index = ?")
                    .bind(&data[..keep as usize])
                    .bind(ino as i64)
                    .bind(last_chunk as i64)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        Ok(())
    }

    /// Deletes all data chunks for an inode.
    pub async fn delete_data(&self, ino: u64) -> FsResult<()> {
        sqlx::query("DELETE FROM fs_data WHERE ino = ?")
            .bind(ino as i64)
            .execute(self.writer())
            .await?;
        Ok(())
    }

    /// Deletes all data chunks within a transaction.
    pub async fn delete_data_tx(&self, tx: &mut SqliteConnection, ino: u64) -> FsResult<()> {
        sqlx::query("DELETE FROM fs_data WHERE ino = ?")
            .bind(ino as i64)
            .execute(&mut *tx)
            .await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::super::{Store, StoreConfig};
    use crate::stats::S_IFREG;
    use tempfile::tempdir;

    async fn open_store_with_chunk(chunk_size: u64) -> (tempfile::TempDir, Store, u64) {
        let dir = tempdir().unwrap();
        let mut config = StoreConfig::new(dir.path().join("delta.db"));
        config.chunk_size = chunk_size;
        let store = Store::open(config).await.unwrap();
        let ino = store.create_inode(S_IFREG | 0o644, 0, 0).await.unwrap();
        (dir, store, ino)
    }

    async fn write_and_size(store: &Store, ino: u64, offset: u64, data: &[u8]) {
        store.write_data(ino, offset, data).await.unwrap();
        let end = offset + data.len() as u64;
        let size = store.get_inode(ino).await.unwrap().size;
        if end > size {
            store.update_size(ino, end).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_data_round_trip_within_one_chunk() {
        let (_dir, store, ino) = open_store_with_chunk(16).await;

        write_and_size(&store, ino, 0, b"hello").await;
        assert_eq!(store.read_data(ino, 0, 5).await.unwrap(), b"hello");
        assert_eq!(store.read_data(ino, 1, 3).await.unwrap(), b"ell");
    }

    #[tokio::test]
    async fn test_data_round_trip_across_chunks() {
        let (_dir, store, ino) = open_store_with_chunk(4).await;

        let payload = b"abcdefghijk"; // spans three 4-byte chunks
        write_and_size(&store, ino, 0, payload).await;
        assert_eq!(store.read_data(ino, 0, 11).await.unwrap(), payload);
        assert_eq!(store.read_data(ino, 3, 5).await.unwrap(), b"defgh");
    }

    #[tokio::test]
    async fn test_data_write_at_unaligned_offset() {
        let (_dir, store, ino) = open_store_with_chunk(4).await;

        write_and_size(&store, ino, 0, b"aaaaaaaa").await;
        write_and_size(&store, ino, 3, b"XY").await;
        assert_eq!(store.read_data(ino, 0, 8).await.unwrap(), b"aaaXYaaa");
    }

    #[tokio::test]
    async fn test_data_sparse_gap_reads_zero() {
        let (_dir, store, ino) = open_store_with_chunk(4).await;

        // Write only the third chunk; the gap before it reads as zeros.
        write_and_size(&store, ino, 8, b"zz").await;
        let read = store.read_data(ino, 0, 10).await.unwrap();
        assert_eq!(&read[..8], &[0u8; 8]);
        assert_eq!(&read[8..], b"zz");
    }

    #[tokio::test]
    async fn test_data_read_past_eof_is_short() {
        let (_dir, store, ino) = open_store_with_chunk(4).await;

        write_and_size(&store, ino, 0, b"abc").await;
        assert_eq!(store.read_data(ino, 0, 100).await.unwrap(), b"abc");
        assert!(store.read_data(ino, 3, 10).await.unwrap().is_empty());
        assert!(store.read_data(ino, 50, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_data_truncate_shrinks_chunks() {
        let (_dir, store, ino) = open_store_with_chunk(4).await;

        write_and_size(&store, ino, 0, b"abcdefghij").await;
        store.truncate(ino, 6).await.unwrap();
        store.update_size(ino, 6).await.unwrap();

        assert_eq!(store.read_data(ino, 0, 10).await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn test_data_truncate_to_zero_deletes_everything() {
        let (_dir, store, ino) = open_store_with_chunk(4).await;

        write_and_size(&store, ino, 0, b"abcdefghij").await;
        store.truncate(ino, 0).await.unwrap();
        store.update_size(ino, 0).await.unwrap();

        assert!(store.read_data(ino, 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_data_size_growth_rule() {
        let (_dir, store, ino) = open_store_with_chunk(8).await;

        write_and_size(&store, ino, 0, b"0123456789").await;
        assert_eq!(store.get_inode(ino).await.unwrap().size, 10);

        // An interior overwrite does not shrink the size.
        write_and_size(&store, ino, 2, b"ab").await;
        assert_eq!(store.get_inode(ino).await.unwrap().size, 10);

        // An extending write raises it to offset + len.
        write_and_size(&store, ino, 9, b"abcd").await;
        assert_eq!(store.get_inode(ino).await.unwrap().size, 13);
    }
}
