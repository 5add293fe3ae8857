use std::{path::PathBuf, time::Duration};

use chrono::Utc;
use sqlx::{
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Pool, Sqlite, Transaction,
};
use tracing::debug;

use crate::{
    defaults::{DEFAULT_BUSY_TIMEOUT, DEFAULT_CHUNK_SIZE},
    stats::S_IFDIR,
    FsResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Migrator for the delta store schema.
pub static STORE_MIGRATOR: Migrator = sqlx::migrate!("lib/store/migrations");

/// The reserved inode number of the root directory.
pub const ROOT_INO: u64 = 1;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Configuration for opening a [`Store`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path of the SQLite database file.
    pub path: PathBuf,

    /// Chunk size for file data, in bytes. Only honored when the store is
    /// first created; subsequent opens read the recorded value.
    pub chunk_size: u64,

    /// How long a connection waits on a locked database before failing.
    pub busy_timeout: Duration,
}

/// The SQLite-backed delta store.
///
/// Writers funnel through a single-connection pool so every mutation is
/// serialized; reads go through a small separate pool and see committed
/// snapshots. The database runs in WAL journal mode with `synchronous=NORMAL`
/// and foreign keys enforced.
pub struct Store {
    writer: Pool<Sqlite>,
    readers: Pool<Sqlite>,
    chunk_size: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl StoreConfig {
    /// Creates a config with default chunk size and busy timeout.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

impl Store {
    /// Opens or creates the delta store at the configured path.
    ///
    /// Runs schema migrations, seeds the singleton config row and the root
    /// inode (ino 1, directory, mode 0755, nlink 2), then reads back the
    /// recorded chunk size so reopens keep the original chunking.
    pub async fn open(config: StoreConfig) -> FsResult<Self> {
        let requested_chunk_size = if config.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            config.chunk_size
        };

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;

        STORE_MIGRATOR.run(&writer).await?;

        sqlx::query("INSERT OR IGNORE INTO fs_config (key, value) VALUES ('chunk_size', ?)")
            .bind(requested_chunk_size.to_string())
            .execute(&writer)
            .await?;

        let now = now_unix();
        sqlx::query(
            "INSERT OR IGNORE INTO fs_inode (ino, mode, nlink, uid, gid, size, atime, mtime, ctime)
             VALUES (?, ?, 2, 0, 0, 0, ?, ?, ?)",
        )
        .bind(ROOT_INO as i64)
        .bind((S_IFDIR | 0o755) as i64)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&writer)
        .await?;

        // The recorded chunk size wins over the requested one on reopen.
        let recorded: String =
            sqlx::query_scalar("SELECT value FROM fs_config WHERE key = 'chunk_size'")
                .fetch_one(&writer)
                .await?;
        let chunk_size = recorded.parse().unwrap_or(DEFAULT_CHUNK_SIZE);

        let readers = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        debug!(path = %config.path.display(), chunk_size, "opened delta store");

        Ok(Self {
            writer,
            readers,
            chunk_size,
        })
    }

    /// Returns the chunk size this store was created with.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Begins a write transaction on the single writer connection.
    pub async fn begin(&self) -> FsResult<Transaction<'static, Sqlite>> {
        Ok(self.writer.begin().await?)
    }

    /// Closes both connection pools.
    pub async fn close(&self) {
        self.writer.close().await;
        self.readers.close().await;
    }

    /// The serialized writer pool. Mutations only.
    pub(crate) fn writer(&self) -> &Pool<Sqlite> {
        &self.writer
    }

    /// The reader pool. Committed snapshots only.
    pub(crate) fn readers(&self) -> &Pool<Sqlite> {
        &self.readers
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The current time as a Unix timestamp in seconds.
pub(crate) fn now_unix() -> i64 {
    Utc::now().timestamp()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
