//! SQLite-backed [`KvStore`].
//!
//! All entries live in one table keyed by `(namespace, key)`. The connection is
//! opened in WAL mode with `synchronous = FULL` so a committed `set` survives a
//! power loss, which is what the queue's "durable before returning" contract
//! requires.

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::kv::{
    run_blocking, KeyNamespace, KvError, KvKey, KvStore, StorageErrorCode, MAX_VALUE_SIZE,
};
use crate::model::UnixTimeMs;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS kv_entries (
    namespace  TEXT    NOT NULL,
    key        TEXT    NOT NULL,
    value      BLOB    NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (namespace, key)
);
";

impl From<rusqlite::Error> for KvError {
    fn from(e: rusqlite::Error) -> Self {
        let code = match &e {
            rusqlite::Error::SqliteFailure(err, _) => match err.code {
                ErrorCode::DatabaseBusy => StorageErrorCode::Busy,
                ErrorCode::DatabaseLocked => StorageErrorCode::Locked,
                ErrorCode::DiskFull => StorageErrorCode::DiskFull,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    StorageErrorCode::Corrupted
                }
                ErrorCode::PermissionDenied | ErrorCode::ReadOnly => {
                    StorageErrorCode::PermissionDenied
                }
                ErrorCode::CannotOpen => StorageErrorCode::ConnectionFailed,
                ErrorCode::SystemIoFailure => StorageErrorCode::IoError,
                _ => StorageErrorCode::Unknown,
            },
            _ => StorageErrorCode::Unknown,
        };
        KvError::storage(code, e.to_string())
    }
}

#[derive(Clone)]
pub struct SqliteKv {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteKv").finish_non_exhaustive()
    }
}

impl SqliteKv {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, KvError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, KvError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `work` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, work: F) -> Result<T, KvError>
    where
        F: FnOnce(&Connection) -> Result<T, KvError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        run_blocking(move || {
            let conn = lock(&conn)?;
            work(&conn)
        })
        .await
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, KvError> {
    conn.lock()
        .map_err(|_| KvError::storage(StorageErrorCode::Locked, "sqlite connection lock poisoned"))
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                    params![key.namespace().prefix(), key.key()],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(KvError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            });
        }
        let key = key.clone();
        let value = value.to_vec();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv_entries (namespace, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(namespace, key)
                 DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![
                    key.namespace().prefix(),
                    key.key(),
                    value,
                    UnixTimeMs::now().as_millis() as i64
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let affected = conn.execute(
                "DELETE FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                params![key.namespace().prefix(), key.key()],
            )?;
            Ok(affected > 0)
        })
        .await
    }

    async fn list(&self, namespace: &KeyNamespace) -> Result<Vec<KvKey>, KvError> {
        let prefix = namespace.prefix();
        let names = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT key FROM kv_entries WHERE namespace = ?1 ORDER BY key ASC")?;
                let rows = stmt.query_map(params![prefix], |row| row.get::<_, String>(0))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;
        names
            .into_iter()
            .map(|name| KvKey::new(namespace.clone(), name))
            .collect()
    }
}
