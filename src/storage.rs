//! SQLite request archive
//!
//! Every captured request ends up here as one row:
//! - method, host, origin-form url and the derived `host + url` path
//! - headers as a JSON array of `[name, value]` pairs, order preserved
//! - raw body bytes
//! - whether the request came out of an intercepted TLS tunnel
//!
//! Writers go through the [`RequestSink`] trait so the data path never
//! depends on SQLite directly.

use crate::capture::{AuditRecord, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination for captured requests
#[async_trait]
pub trait RequestSink: Send + Sync {
    /// Persist one record, returning its id
    async fn save_request(&self, record: &AuditRecord) -> Result<i64, StorageError>;
}

/// A record read back from the archive
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRequest {
    pub id: i64,
    pub record: AuditRecord,
}

/// Request archive with SQLite backend
#[derive(Clone)]
pub struct RequestStore {
    pool: SqlitePool,
}

impl RequestStore {
    /// Open (or create) the archive at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self, StorageError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let pool = SqlitePool::connect(&format!("sqlite://{}?mode=rwc", db_path)).await?;
        info!(db_path = %db_path, "Connected to SQLite database");

        Self::enable_wal(&pool).await?;
        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    async fn enable_wal(pool: &SqlitePool) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(pool)
            .await?;

        debug!("WAL mode enabled");
        Ok(())
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                method TEXT NOT NULL,
                host TEXT NOT NULL,
                url TEXT NOT NULL,
                path TEXT NOT NULL,
                headers TEXT NOT NULL,
                body BLOB NOT NULL,
                is_https BOOLEAN NOT NULL,
                timestamp INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_requests_host ON requests(host)")
            .execute(pool)
            .await?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Fetch one record by id
    pub async fn get_request(&self, id: i64) -> Result<Option<StoredRequest>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, method, host, url, headers, body, is_https, timestamp
            FROM requests
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(stored_from_row).transpose()
    }

    /// Most recent records first
    pub async fn list_requests(&self, limit: i64) -> Result<Vec<StoredRequest>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, method, host, url, headers, body, is_https, timestamp
            FROM requests
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        debug!(count = rows.len(), "Retrieved requests from database");
        rows.iter().map(stored_from_row).collect()
    }

    pub async fn count_requests(&self) -> Result<i64, StorageError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM requests")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub async fn close(self) {
        self.pool.close().await;
        info!("Database connection closed");
    }
}

#[async_trait]
impl RequestSink for RequestStore {
    async fn save_request(&self, record: &AuditRecord) -> Result<i64, StorageError> {
        let headers = serde_json::to_string(record.headers())
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO requests (method, host, url, path, headers, body, is_https, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.method())
        .bind(record.host())
        .bind(record.url())
        .bind(record.path())
        .bind(headers)
        .bind(record.body().as_ref())
        .bind(record.transport().is_https())
        .bind(record.timestamp().timestamp_millis())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(id = id, path = %record.path(), "Request saved to database");
        Ok(id)
    }
}

fn stored_from_row(row: &SqliteRow) -> Result<StoredRequest, StorageError> {
    let headers: String = row.try_get("headers")?;
    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
        .map_err(|e| StorageError::SerializationError(e.to_string()))?;

    let millis: i64 = row.try_get("timestamp")?;
    let timestamp: DateTime<Utc> = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StorageError::SerializationError(format!("invalid timestamp {}", millis)))?;

    let body: Vec<u8> = row.try_get("body")?;

    let record = AuditRecord::with_timestamp(
        row.try_get::<String, _>("method")?,
        row.try_get::<String, _>("host")?,
        row.try_get::<String, _>("url")?,
        headers,
        Bytes::from(body),
        Transport::from_https(row.try_get("is_https")?),
        timestamp,
    );

    Ok(StoredRequest {
        id: row.try_get("id")?,
        record,
    })
}
