//! SQLite-backed secret backend.
//!
//! Stores one sealed blob per key. Encryption happens above this layer; the
//! table only ever sees ciphertext (or legacy plaintext awaiting migration).

use super::backend::{SecretBackend, WriteStatus};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Secret backend backed by a SQLite file.
///
/// # Schema
/// ```sql
/// CREATE TABLE secrets (
///     key TEXT PRIMARY KEY,
///     ciphertext BLOB NOT NULL,
///     created_at TEXT NOT NULL,   -- ISO 8601 timestamp
///     updated_at TEXT NOT NULL    -- ISO 8601 timestamp
/// );
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in Mutex for safe concurrent access
/// - Queries run on the blocking pool so async callers are not stalled
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Creates or opens a secrets database (`":memory:"` for a private in-memory one).
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS secrets (
                key TEXT PRIMARY KEY,
                ciphertext BLOB NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create secrets table")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Writes raw bytes, replacing any existing value.
    ///
    /// Used to seed records written by older versions (plaintext).
    pub fn insert_raw(&self, key: &str, value: &[u8]) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .execute(
                r#"
                INSERT INTO secrets (key, ciphertext, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    ciphertext = excluded.ciphertext,
                    updated_at = excluded.updated_at
                "#,
                params![key, value, now],
            )
            .context("Failed to insert raw secret")?;
        Ok(())
    }

    /// Lists stored keys in order.
    pub fn keys(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn
            .prepare("SELECT key FROM secrets ORDER BY key")
            .context("Failed to prepare query")?;

        let keys = stmt
            .query_map([], |row| row.get(0))
            .context("Failed to execute query")?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to read results")?;

        Ok(keys)
    }

    /// Runs `op` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            op(&guard)
        })
        .await
        .map_err(|e| anyhow!("SQLite task failed: {}", e))?
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl SecretBackend for SqliteBackend {
    async fn add(&self, key: &str, value: &[u8]) -> Result<WriteStatus> {
        let key = key.to_string();
        let value = value.to_vec();
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            match conn.execute(
                "INSERT INTO secrets (key, ciphertext, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                params![key, value, now],
            ) {
                Ok(_) => Ok(WriteStatus::Written),
                Err(e) if is_constraint_violation(&e) => Ok(WriteStatus::Duplicate),
                Err(e) => Err(e).context("Failed to insert secret"),
            }
        })
        .await
    }

    async fn update(&self, key: &str, value: &[u8]) -> Result<WriteStatus> {
        let key = key.to_string();
        let value = value.to_vec();
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            let rows = conn
                .execute(
                    "UPDATE secrets SET ciphertext = ?2, updated_at = ?3 WHERE key = ?1",
                    params![key, value, now],
                )
                .context("Failed to update secret")?;
            Ok(if rows == 0 {
                WriteStatus::Missing
            } else {
                WriteStatus::Written
            })
        })
        .await
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT ciphertext FROM secrets WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()
            .context("Failed to read secret")
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let rows = conn
                .execute("DELETE FROM secrets WHERE key = ?1", params![key])
                .context("Failed to delete secret")?;
            Ok(rows > 0)
        })
        .await
    }
}
