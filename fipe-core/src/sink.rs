use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, Row};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::sqlite::configure_connection;

const RECORDS_SCHEMA: &str = include_str!("../sql/records.sql");

/// One leaf's scraped result: the selected labels plus whatever labeled
/// rows the result table carried. No fixed key set; identity for
/// deduplication is full-row equality over the canonical serialization.
pub type ExtractedRecord = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open records database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on records database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("records path not configured")]
    MissingStore,
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("sink task failed: {0}")]
    Task(String),
}

pub type SinkResult<T> = Result<T, SinkError>;

/// Append-and-dedupe accumulation of extracted records. `append` returns
/// `false` when an identical record was already stored.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn append(&self, record: &ExtractedRecord) -> SinkResult<bool>;
    async fn count(&self) -> SinkResult<u64>;
}

/// `BTreeMap` keys serialize in sorted order, so equal rows always produce
/// byte-identical JSON regardless of extraction order.
pub fn canonical_json(record: &ExtractedRecord) -> SinkResult<String> {
    Ok(serde_json::to_string(record)?)
}

pub fn row_hash(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub id: i64,
    pub record: ExtractedRecord,
    pub collected_at: Option<DateTime<Utc>>,
}

impl StoredRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let payload: String = row.get("payload")?;
        let record = serde_json::from_str(&payload).unwrap_or_default();
        let collected_at: Option<String> = row.get("collected_at")?;
        let collected_at = collected_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Ok(Self {
            id: row.get("id")?,
            record,
            collected_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteResultSinkBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteResultSinkBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteResultSinkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> SinkResult<SqliteResultSink> {
        let path = self.path.ok_or(SinkError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteResultSink { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteResultSink {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteResultSink {
    pub fn builder() -> SqliteResultSinkBuilder {
        SqliteResultSinkBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> SinkResult<Self> {
        SqliteResultSinkBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> SinkResult<Connection> {
        let conn =
            Connection::open_with_flags(&self.path, self.flags).map_err(|source| SinkError::Open {
                source,
                path: self.path.clone(),
            })?;
        configure_connection(&conn).map_err(|source| SinkError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> SinkResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = self.open()?;
        conn.execute_batch(RECORDS_SCHEMA)?;
        Ok(())
    }

    pub fn append_blocking(&self, record: &ExtractedRecord) -> SinkResult<bool> {
        let payload = canonical_json(record)?;
        let hash = row_hash(&payload);
        let conn = self.open()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO records (row_hash, payload) VALUES (?1, ?2)",
            params![hash, payload],
        )?;
        Ok(inserted > 0)
    }

    pub fn count_blocking(&self) -> SinkResult<u64> {
        let conn = self.open()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn recent_blocking(&self, limit: usize) -> SinkResult<Vec<StoredRecord>> {
        let conn = self.open()?;
        let mut stmt =
            conn.prepare("SELECT id, payload, collected_at FROM records ORDER BY id DESC LIMIT ?1")?;
        let mut rows = stmt.query([limit as i64])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(StoredRecord::from_row(row)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl RecordSink for SqliteResultSink {
    async fn append(&self, record: &ExtractedRecord) -> SinkResult<bool> {
        let sink = self.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || sink.append_blocking(&record))
            .await
            .map_err(|err| SinkError::Task(err.to_string()))?
    }

    async fn count(&self) -> SinkResult<u64> {
        let sink = self.clone();
        tokio::task::spawn_blocking(move || sink.count_blocking())
            .await
            .map_err(|err| SinkError::Task(err.to_string()))?
    }
}
