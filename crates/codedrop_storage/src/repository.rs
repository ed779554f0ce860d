use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codedrop_transfer::{
    AbuseRecord, AbuseStore, AbuseUpdate, Completion, StoreError, TransferRecord, TransferStatus,
    TransferStore,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tracing::info;

const SCHEMA_SQL: &str = include_str!("sql/schema.sql");

const TRANSFER_COLUMNS: &str = "transfer_id, file_name, content_type, size_bytes, storage_handle, connection_code, status, download_token, token_expires_at, expires_at, uploader_id, downloader_id, created_at";

const ABUSE_COLUMNS: &str =
    "client_id, failed_attempts, last_attempt_at, blocked_until, last_block_secs";

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
    pub busy_timeout: Duration,
}

impl StorageConfig {
    pub fn new(sqlite_path: impl Into<String>) -> Self {
        Self {
            sqlite_path: sqlite_path.into(),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(Debug, FromRow)]
struct TransferRow {
    transfer_id: String,
    file_name: String,
    content_type: String,
    size_bytes: i64,
    storage_handle: String,
    connection_code: String,
    status: String,
    download_token: Option<String>,
    token_expires_at: Option<i64>,
    expires_at: i64,
    uploader_id: String,
    downloader_id: Option<String>,
    created_at: i64,
}

impl TryFrom<TransferRow> for TransferRecord {
    type Error = StoreError;

    fn try_from(row: TransferRow) -> Result<Self, Self::Error> {
        let status = TransferStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "transfer {} has status {:?}",
                row.transfer_id, row.status
            ))
        })?;
        let size_bytes = u64::try_from(row.size_bytes).map_err(|_| {
            StoreError::Corrupt(format!(
                "transfer {} has negative size {}",
                row.transfer_id, row.size_bytes
            ))
        })?;

        Ok(TransferRecord {
            status,
            size_bytes,
            token_expires_at: row.token_expires_at.map(from_millis).transpose()?,
            expires_at: from_millis(row.expires_at)?,
            created_at: from_millis(row.created_at)?,
            transfer_id: row.transfer_id,
            file_name: row.file_name,
            content_type: row.content_type,
            storage_handle: row.storage_handle,
            connection_code: row.connection_code,
            download_token: row.download_token,
            uploader_id: row.uploader_id,
            downloader_id: row.downloader_id,
        })
    }
}

#[derive(Debug, FromRow)]
struct AbuseRow {
    client_id: String,
    failed_attempts: i64,
    last_attempt_at: i64,
    blocked_until: Option<i64>,
    last_block_secs: i64,
}

impl TryFrom<AbuseRow> for AbuseRecord {
    type Error = StoreError;

    fn try_from(row: AbuseRow) -> Result<Self, Self::Error> {
        let failed_attempts = u32::try_from(row.failed_attempts).map_err(|_| {
            StoreError::Corrupt(format!(
                "abuse record {} has failure count {}",
                row.client_id, row.failed_attempts
            ))
        })?;
        let last_block_secs = u64::try_from(row.last_block_secs).map_err(|_| {
            StoreError::Corrupt(format!(
                "abuse record {} has block duration {}",
                row.client_id, row.last_block_secs
            ))
        })?;

        Ok(AbuseRecord {
            failed_attempts,
            last_block_secs,
            last_attempt_at: from_millis(row.last_attempt_at)?,
            blocked_until: row.blocked_until.map(from_millis).transpose()?,
            client_id: row.client_id,
        })
    }
}

impl SqliteStore {
    pub async fn connect(config: &StorageConfig) -> anyhow::Result<Self> {
        let uri = normalize_sqlite_uri(&config.sqlite_path);
        let in_memory = uri.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(&uri)
            .with_context(|| format!("invalid sqlite URI: {}", uri))?
            .create_if_missing(true)
            .busy_timeout(config.busy_timeout);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to `:memory:` opens its own empty database.
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("failed to connect sqlite pool")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        for statement in SCHEMA_SQL.split(';') {
            let sql = statement.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("migration failed for statement: {sql}"))?;
        }
        info!("codedrop sqlite schema ready");
        Ok(())
    }

    async fn fetch_transfer(
        &self,
        column: &str,
        value: &str,
    ) -> Result<Option<TransferRecord>, StoreError> {
        let sql = format!("SELECT {TRANSFER_COLUMNS} FROM transfers WHERE {column} = ?");
        let row = sqlx::query_as::<_, TransferRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("query transfer by {column}"))?;
        row.map(TransferRecord::try_from).transpose()
    }
}

#[async_trait]
impl TransferStore for SqliteStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("ping sqlite")?;
        Ok(())
    }

    async fn insert_transfer(&self, record: &TransferRecord) -> Result<(), StoreError> {
        let size_bytes = i64::try_from(record.size_bytes)
            .with_context(|| format!("size of transfer {} out of range", record.transfer_id))?;

        let result = sqlx::query(
            "INSERT INTO transfers(transfer_id, file_name, content_type, size_bytes, storage_handle, connection_code, status, download_token, token_expires_at, expires_at, uploader_id, downloader_id, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.transfer_id)
        .bind(&record.file_name)
        .bind(&record.content_type)
        .bind(size_bytes)
        .bind(&record.storage_handle)
        .bind(&record.connection_code)
        .bind(record.status.as_str())
        .bind(&record.download_token)
        .bind(record.token_expires_at.map(to_millis))
        .bind(to_millis(record.expires_at))
        .bind(&record.uploader_id)
        .bind(&record.downloader_id)
        .bind(to_millis(record.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) if is_unique_violation(&error) => {
                Err(StoreError::Conflict(conflicting_column(&error)))
            }
            Err(error) => Err(anyhow::Error::new(error)
                .context(format!("insert transfer {}", record.transfer_id))
                .into()),
        }
    }

    async fn get_transfer(&self, transfer_id: &str) -> Result<Option<TransferRecord>, StoreError> {
        self.fetch_transfer("transfer_id", transfer_id).await
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<TransferRecord>, StoreError> {
        self.fetch_transfer("connection_code", code).await
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<TransferRecord>, StoreError> {
        self.fetch_transfer("download_token", token).await
    }

    async fn count_active(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM transfers WHERE status = ? AND expires_at > ?",
        )
        .bind(TransferStatus::Waiting.as_str())
        .bind(to_millis(now))
        .fetch_one(&self.pool)
        .await
        .context("count active transfers")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn attach_token(
        &self,
        transfer_id: &str,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE transfers SET download_token = ?, token_expires_at = ? WHERE transfer_id = ? AND status = ?",
        )
        .bind(token)
        .bind(to_millis(expires_at))
        .bind(transfer_id)
        .bind(TransferStatus::Waiting.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("attach download token to {transfer_id}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_downloaded(
        &self,
        transfer_id: &str,
        downloader_id: &str,
    ) -> Result<Option<Completion>, StoreError> {
        let result = sqlx::query(
            "UPDATE transfers SET status = ?, downloader_id = ? WHERE transfer_id = ? AND status = ?",
        )
        .bind(TransferStatus::Downloaded.as_str())
        .bind(downloader_id)
        .bind(transfer_id)
        .bind(TransferStatus::Waiting.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("mark transfer {transfer_id} downloaded"))?;

        if result.rows_affected() > 0 {
            return Ok(Some(Completion::Completed));
        }

        let exists = sqlx::query_scalar::<_, i64>("SELECT 1 FROM transfers WHERE transfer_id = ?")
            .bind(transfer_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("query transfer {transfer_id}"))?;
        Ok(exists.map(|_| Completion::AlreadyDownloaded))
    }
}

#[async_trait]
impl AbuseStore for SqliteStore {
    async fn get_abuse_record(&self, client_id: &str) -> Result<Option<AbuseRecord>, StoreError> {
        let sql = format!("SELECT {ABUSE_COLUMNS} FROM abuse_records WHERE client_id = ?");
        let row = sqlx::query_as::<_, AbuseRow>(&sql)
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("query abuse record {client_id}"))?;
        row.map(AbuseRecord::try_from).transpose()
    }

    async fn update_abuse_record(
        &self,
        client_id: &str,
        now: DateTime<Utc>,
        update: &AbuseUpdate,
    ) -> Result<AbuseRecord, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin abuse record transaction")?;

        // Writing first takes the database write lock before the read, so two
        // writers never both hold a read snapshot they then try to upgrade.
        sqlx::query(
            "INSERT INTO abuse_records(client_id, failed_attempts, last_attempt_at, blocked_until, last_block_secs) VALUES (?, 0, ?, NULL, 0) ON CONFLICT(client_id) DO NOTHING",
        )
        .bind(client_id)
        .bind(to_millis(now))
        .execute(&mut *tx)
        .await
        .with_context(|| format!("seed abuse record {client_id}"))?;

        let sql = format!("SELECT {ABUSE_COLUMNS} FROM abuse_records WHERE client_id = ?");
        let row = sqlx::query_as::<_, AbuseRow>(&sql)
            .bind(client_id)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("load abuse record {client_id}"))?;

        let mut record = AbuseRecord::try_from(row)?;
        update(&mut record);
        let last_block_secs = i64::try_from(record.last_block_secs).unwrap_or(i64::MAX);

        sqlx::query(
            "UPDATE abuse_records SET failed_attempts = ?, last_attempt_at = ?, blocked_until = ?, last_block_secs = ? WHERE client_id = ?",
        )
        .bind(i64::from(record.failed_attempts))
        .bind(to_millis(record.last_attempt_at))
        .bind(record.blocked_until.map(to_millis))
        .bind(last_block_secs)
        .bind(client_id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("store abuse record {client_id}"))?;

        tx.commit()
            .await
            .with_context(|| format!("commit abuse record {client_id}"))?;
        Ok(record)
    }

    async fn clear_abuse_record(&self, client_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE abuse_records SET failed_attempts = 0, blocked_until = NULL, last_block_secs = 0 WHERE client_id = ?",
        )
        .bind(client_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("clear abuse record {client_id}"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_expired_block(
        &self,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE abuse_records SET failed_attempts = 0, blocked_until = NULL, last_block_secs = 0 WHERE client_id = ? AND blocked_until IS NOT NULL AND blocked_until <= ?",
        )
        .bind(client_id)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await
        .with_context(|| format!("release block of {client_id}"))?;
        Ok(result.rows_affected() > 0)
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {millis} out of range")))
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            db.is_unique_violation() || db.message().contains("UNIQUE constraint failed")
        }
        _ => false,
    }
}

fn conflicting_column(error: &sqlx::Error) -> &'static str {
    match error {
        sqlx::Error::Database(db) if db.message().contains("connection_code") => {
            "connection_code"
        }
        _ => "transfer_id",
    }
}

fn normalize_sqlite_uri(raw: &str) -> String {
    if raw.starts_with("sqlite:") {
        raw.to_string()
    } else {
        format!("sqlite://{raw}")
    }
}
