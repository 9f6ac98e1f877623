//! SQLite local storage for tablesync.
//!
//! One database holds, per synchronized table `t`:
//! - `t`: the application rows (`key TEXT PRIMARY KEY, payload BLOB`)
//! - `__tablesync_changes_t`: one change record per key (pending state,
//!   local and synced versions, write sequence)
//! - `__tablesync_meta_t`: a single metadata row (lastSyncTimestamp,
//!   activeKeyVersion) with a format marker and checksum
//!
//! plus one `__tablesync_system` table for identity, key and device
//! bookkeeping. Every metadata and system row carries a SHA-256 checksum so
//! corruption is detected on read instead of being trusted.

use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use std::str::FromStr;
use tablesync_core::{is_valid_table_name, RESERVED_PREFIX};
use tablesync_types::{ErrorKind, KeyVersion, Timestamp};
use thiserror::Error;

/// Format marker written into every metadata row.
const META_FORMAT: &str = "tablesync-meta-v1";

const SYSTEM_TABLE: &str = "__tablesync_system";

/// Storage layer errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A table's metadata row is missing or fails its integrity check.
    #[error("corrupted metadata for table {table}: {reason}")]
    CorruptedMetadata {
        /// Affected table.
        table: String,
        /// What failed.
        reason: String,
    },

    /// The system table holds a row that fails its integrity check.
    #[error("corrupted system table: {reason}")]
    CorruptedSystemTable {
        /// What failed.
        reason: String,
    },

    /// Writing a remote change into the local table failed.
    #[error("failed to apply remote change to {table}/{key}: {source}")]
    LocalApplyFailed {
        /// Affected table.
        table: String,
        /// Affected key.
        key: String,
        /// Underlying database error.
        source: sqlx::Error,
    },

    /// An incoming entry is malformed; its whole batch was rejected.
    #[error("invalid entry {table}/{key}: {reason}")]
    InvalidEntry {
        /// Affected table.
        table: String,
        /// Affected key.
        key: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Table name is not usable.
    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),

    /// Table was never registered.
    #[error("table not registered: {0}")]
    UnknownTable(String),

    /// System row body could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Failure classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::CorruptedMetadata { .. } | StoreError::CorruptedSystemTable { .. } => {
                ErrorKind::LocalCorruption
            }
            StoreError::Database(_) | StoreError::LocalApplyFailed { .. } => {
                ErrorKind::LocalStorage
            }
            StoreError::InvalidEntry { .. }
            | StoreError::InvalidTableName(_)
            | StoreError::UnknownTable(_) => ErrorKind::Input,
            StoreError::Serialization(_) => ErrorKind::Internal,
        }
    }
}

/// Persisted per-table sync metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    /// Table the metadata belongs to.
    pub table: String,
    /// Upload timestamp of the newest remote change applied locally.
    pub last_sync: Timestamp,
    /// Key version used for uploads.
    pub active_key_version: KeyVersion,
}

impl TableMetadata {
    fn fresh(table: &str) -> Self {
        Self {
            table: table.to_string(),
            last_sync: Timestamp::zero(),
            active_key_version: KeyVersion::NONE,
        }
    }

    fn checksum(&self) -> String {
        checksum(&[
            META_FORMAT.as_bytes(),
            self.table.as_bytes(),
            &self.last_sync.value().to_be_bytes(),
            &self.active_key_version.value().to_be_bytes(),
        ])
    }
}

fn checksum(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

pub(crate) fn changes_table(table: &str) -> String {
    format!("{}_changes_{}", RESERVED_PREFIX, table)
}

fn meta_table(table: &str) -> String {
    format!("{}_meta_{}", RESERVED_PREFIX, table)
}

#[derive(sqlx::FromRow)]
struct MetaRow {
    format: String,
    last_sync: i64,
    active_key_version: i64,
    checksum: String,
}

#[derive(sqlx::FromRow)]
struct SystemRow {
    name: String,
    version: i64,
    body: String,
    checksum: String,
}

/// SQLite-backed local store.
///
/// Uses WAL mode for file databases. Cloning shares the pool.
#[derive(Clone, Debug)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    /// Open (or create) a database file.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        tracing::debug!("opened local store at {}", path.display());
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(":memory:")?;

        // Every connection to :memory: is its own database, so keep exactly one alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                kind TEXT NOT NULL,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                body TEXT NOT NULL,
                checksum TEXT NOT NULL,
                PRIMARY KEY (kind, name, version)
            )
            "#,
            SYSTEM_TABLE
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a local transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    // ===== Table Registration =====

    /// Create the data, change and metadata tables for `table` if missing.
    ///
    /// Existing rows in the data table are seeded as pending changes so data
    /// written before registration is uploaded too.
    pub async fn ensure_table(&self, table: &str) -> Result<(), StoreError> {
        if !is_valid_table_name(table) {
            return Err(StoreError::InvalidTableName(table.to_string()));
        }
        let changes = changes_table(table);
        let meta = meta_table(table);
        let now = tablesync_types::now_millis() as i64;

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{}" (
                key TEXT PRIMARY KEY NOT NULL,
                payload BLOB NOT NULL
            )"#,
            table
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{}" (
                key TEXT PRIMARY KEY NOT NULL,
                version INTEGER NOT NULL,
                synced_version INTEGER NOT NULL DEFAULT 0,
                pending INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0,
                payload BLOB,
                local_ts INTEGER NOT NULL,
                seq INTEGER NOT NULL DEFAULT 0
            )"#,
            changes
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            r#"CREATE INDEX IF NOT EXISTS "{0}_pending" ON "{0}" (pending, seq)"#,
            changes
        ))
        .execute(&mut *tx)
        .await?;

        // Rows that predate registration become pending changes
        seed_pending(&mut tx, table, now).await?;

        let meta_exists: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
        )
        .bind(&meta)
        .fetch_optional(&mut *tx)
        .await?;
        if meta_exists.is_none() {
            create_meta_table(&mut tx, &TableMetadata::fresh(table)).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // ===== Metadata =====

    /// Read and verify a table's metadata.
    ///
    /// Any read failure, missing row, unknown format or checksum mismatch
    /// is reported as [`StoreError::CorruptedMetadata`].
    pub async fn load_metadata(&self, table: &str) -> Result<TableMetadata, StoreError> {
        let corrupted = |reason: String| StoreError::CorruptedMetadata {
            table: table.to_string(),
            reason,
        };

        let row = sqlx::query_as::<_, MetaRow>(&format!(
            r#"SELECT format, last_sync, active_key_version, checksum FROM "{}" WHERE id = 1"#,
            meta_table(table)
        ))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| corrupted(e.to_string()))?
        .ok_or_else(|| corrupted("metadata row missing".into()))?;

        if row.format != META_FORMAT {
            return Err(corrupted(format!("unknown format {:?}", row.format)));
        }
        if row.last_sync < 0 || row.active_key_version < 0 || row.active_key_version > u32::MAX as i64
        {
            return Err(corrupted("negative or out-of-range field".into()));
        }
        let meta = TableMetadata {
            table: table.to_string(),
            last_sync: Timestamp::new(row.last_sync as u64),
            active_key_version: KeyVersion::new(row.active_key_version as u32),
        };
        if meta.checksum() != row.checksum {
            return Err(corrupted("checksum mismatch".into()));
        }
        Ok(meta)
    }

    /// Persist a table's metadata.
    pub async fn save_metadata(&self, meta: &TableMetadata) -> Result<(), StoreError> {
        let result = sqlx::query(&format!(
            r#"UPDATE "{}" SET format = ?1, last_sync = ?2, active_key_version = ?3, checksum = ?4 WHERE id = 1"#,
            meta_table(&meta.table)
        ))
        .bind(META_FORMAT)
        .bind(meta.last_sync.value() as i64)
        .bind(meta.active_key_version.value() as i64)
        .bind(meta.checksum())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::CorruptedMetadata {
                table: meta.table.clone(),
                reason: "metadata row missing".into(),
            });
        }
        Ok(())
    }

    /// Rebuild a table's metadata from scratch, forcing a full download.
    ///
    /// Only the metadata table is touched; pending changes and the per-key
    /// synced versions survive.
    pub async fn reset_metadata(
        &self,
        table: &str,
        active_key_version: KeyVersion,
    ) -> Result<TableMetadata, StoreError> {
        let meta = TableMetadata {
            active_key_version,
            ..TableMetadata::fresh(table)
        };
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{}""#, meta_table(table)))
            .execute(&mut *tx)
            .await?;
        create_meta_table(&mut tx, &meta).await?;
        tx.commit().await?;
        tracing::warn!("reset metadata for table {}", table);
        Ok(meta)
    }

    /// Forget everything `table` ever synchronized, for joining another account.
    ///
    /// The change log and metadata start over. With `keep_rows` the current
    /// rows are seeded as pending so they upload again; otherwise they are
    /// deleted.
    pub async fn reset_table(&self, table: &str, keep_rows: bool) -> Result<(), StoreError> {
        let now = tablesync_types::now_millis() as i64;
        let mut tx = self.pool.begin().await?;
        if !keep_rows {
            sqlx::query(&format!(r#"DELETE FROM "{}""#, table))
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(&format!(r#"DELETE FROM "{}""#, changes_table(table)))
            .execute(&mut *tx)
            .await?;
        seed_pending(&mut tx, table, now).await?;
        sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{}""#, meta_table(table)))
            .execute(&mut *tx)
            .await?;
        create_meta_table(&mut tx, &TableMetadata::fresh(table)).await?;
        tx.commit().await?;
        tracing::info!(
            "reset table {} ({})",
            table,
            if keep_rows { "rows kept" } else { "rows deleted" }
        );
        Ok(())
    }

    /// Tables that have a metadata table, whatever the system table says.
    pub async fn tables_on_disk(&self) -> Result<Vec<String>, StoreError> {
        let prefix = format!("{}_meta_", RESERVED_PREFIX);
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND substr(name, 1, length(?1)) = ?1 ORDER BY name",
        )
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(names
            .into_iter()
            .filter_map(|name| name.strip_prefix(&prefix).map(str::to_string))
            .filter(|table| is_valid_table_name(table))
            .collect())
    }

    // ===== System Table =====

    /// Insert or replace a system row.
    pub async fn put_system<T: Serialize>(
        &self,
        kind: &str,
        name: &str,
        version: u32,
        value: &T,
    ) -> Result<(), StoreError> {
        let body =
            serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let sum = system_checksum(kind, name, version, &body);
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {} (kind, name, version, body, checksum) VALUES (?1, ?2, ?3, ?4, ?5)",
            SYSTEM_TABLE
        ))
        .bind(kind)
        .bind(name)
        .bind(version as i64)
        .bind(body)
        .bind(sum)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Read one system row.
    pub async fn get_system<T: DeserializeOwned>(
        &self,
        kind: &str,
        name: &str,
        version: u32,
    ) -> Result<Option<T>, StoreError> {
        let row = sqlx::query_as::<_, SystemRow>(&format!(
            "SELECT name, version, body, checksum FROM {} WHERE kind = ?1 AND name = ?2 AND version = ?3",
            SYSTEM_TABLE
        ))
        .bind(kind)
        .bind(name)
        .bind(version as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::CorruptedSystemTable {
            reason: e.to_string(),
        })?;
        row.map(|row| decode_system(kind, row).map(|(_, _, value)| value))
            .transpose()
    }

    /// Read every system row of `kind`, optionally restricted to `name`.
    pub async fn list_system<T: DeserializeOwned>(
        &self,
        kind: &str,
        name: Option<&str>,
    ) -> Result<Vec<(String, u32, T)>, StoreError> {
        let rows = sqlx::query_as::<_, SystemRow>(&format!(
            "SELECT name, version, body, checksum FROM {} WHERE kind = ?1 AND (?2 IS NULL OR name = ?2) ORDER BY name, version",
            SYSTEM_TABLE
        ))
        .bind(kind)
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::CorruptedSystemTable {
            reason: e.to_string(),
        })?;
        rows.into_iter().map(|row| decode_system(kind, row)).collect()
    }

    /// Delete system rows of `kind`, optionally restricted to `name`.
    pub async fn delete_system(&self, kind: &str, name: Option<&str>) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE kind = ?1 AND (?2 IS NULL OR name = ?2)",
            SYSTEM_TABLE
        ))
        .bind(kind)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

async fn seed_pending(
    tx: &mut Transaction<'static, Sqlite>,
    table: &str,
    now: i64,
) -> Result<(), StoreError> {
    sqlx::query(&format!(
        r#"INSERT OR IGNORE INTO "{changes}" (key, version, pending, deleted, payload, local_ts, seq)
           SELECT key, 1, 1, 0, payload, ?1, rowid FROM "{table}""#,
        changes = changes_table(table),
        table = table
    ))
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn create_meta_table(
    tx: &mut Transaction<'static, Sqlite>,
    meta: &TableMetadata,
) -> Result<(), StoreError> {
    let name = meta_table(&meta.table);
    sqlx::query(&format!(
        r#"CREATE TABLE IF NOT EXISTS "{}" (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            format TEXT NOT NULL,
            last_sync INTEGER NOT NULL,
            active_key_version INTEGER NOT NULL,
            checksum TEXT NOT NULL
        )"#,
        name
    ))
    .execute(&mut **tx)
    .await?;
    sqlx::query(&format!(
        r#"INSERT OR REPLACE INTO "{}" (id, format, last_sync, active_key_version, checksum) VALUES (1, ?1, ?2, ?3, ?4)"#,
        name
    ))
    .bind(META_FORMAT)
    .bind(meta.last_sync.value() as i64)
    .bind(meta.active_key_version.value() as i64)
    .bind(meta.checksum())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn system_checksum(kind: &str, name: &str, version: u32, body: &str) -> String {
    checksum(&[
        kind.as_bytes(),
        name.as_bytes(),
        &version.to_be_bytes(),
        body.as_bytes(),
    ])
}

fn decode_system<T: DeserializeOwned>(
    kind: &str,
    row: SystemRow,
) -> Result<(String, u32, T), StoreError> {
    let corrupted = |reason: String| StoreError::CorruptedSystemTable {
        reason: format!("{}/{}: {}", kind, row.name, reason),
    };
    let version = u32::try_from(row.version).map_err(|_| corrupted("bad version".into()))?;
    if system_checksum(kind, &row.name, version, &row.body) != row.checksum {
        return Err(corrupted("checksum mismatch".into()));
    }
    let value = serde_json::from_str(&row.body).map_err(|e| corrupted(e.to_string()))?;
    Ok((row.name.clone(), version, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registration_creates_fresh_metadata() {
        let store = LocalStore::in_memory().await.unwrap();
        store.ensure_table("notes").await.unwrap();

        let meta = store.load_metadata("notes").await.unwrap();
        assert_eq!(meta.last_sync, Timestamp::zero());
        assert_eq!(meta.active_key_version, KeyVersion::NONE);

        // Registering again keeps existing metadata
        let updated = TableMetadata {
            last_sync: Timestamp::new(17),
            ..meta
        };
        store.save_metadata(&updated).await.unwrap();
        store.ensure_table("notes").await.unwrap();
        assert_eq!(store.load_metadata("notes").await.unwrap(), updated);
    }

    #[tokio::test]
    async fn invalid_table_names_are_rejected() {
        let store = LocalStore::in_memory().await.unwrap();
        assert!(matches!(
            store.ensure_table("bad name").await,
            Err(StoreError::InvalidTableName(_))
        ));
    }

    #[tokio::test]
    async fn tampered_metadata_is_detected() {
        let store = LocalStore::in_memory().await.unwrap();
        store.ensure_table("notes").await.unwrap();

        sqlx::query(r#"UPDATE "__tablesync_meta_notes" SET last_sync = 999"#)
            .execute(store.pool())
            .await
            .unwrap();

        assert!(matches!(
            store.load_metadata("notes").await,
            Err(StoreError::CorruptedMetadata { .. })
        ));
    }

    #[tokio::test]
    async fn missing_metadata_table_is_corruption() {
        let store = LocalStore::in_memory().await.unwrap();
        store.ensure_table("notes").await.unwrap();
        sqlx::query(r#"DROP TABLE "__tablesync_meta_notes""#)
            .execute(store.pool())
            .await
            .unwrap();

        assert!(matches!(
            store.load_metadata("notes").await,
            Err(StoreError::CorruptedMetadata { .. })
        ));
    }

    #[tokio::test]
    async fn reset_restores_readable_metadata() {
        let store = LocalStore::in_memory().await.unwrap();
        store.ensure_table("notes").await.unwrap();
        sqlx::query(r#"UPDATE "__tablesync_meta_notes" SET format = 'garbage'"#)
            .execute(store.pool())
            .await
            .unwrap();

        let meta = store.reset_metadata("notes", KeyVersion::new(2)).await.unwrap();
        assert_eq!(meta.last_sync, Timestamp::zero());
        assert_eq!(store.load_metadata("notes").await.unwrap(), meta);
    }

    #[tokio::test]
    async fn existing_rows_are_seeded_as_pending() {
        let store = LocalStore::in_memory().await.unwrap();
        sqlx::query(r#"CREATE TABLE "notes" (key TEXT PRIMARY KEY NOT NULL, payload BLOB NOT NULL)"#)
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query(r#"INSERT INTO "notes" (key, payload) VALUES ('old', x'01')"#)
            .execute(store.pool())
            .await
            .unwrap();

        store.ensure_table("notes").await.unwrap();

        let pending: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM "__tablesync_changes_notes" WHERE pending = 1"#,
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(pending, 1);
    }

    #[tokio::test]
    async fn reset_table_optionally_keeps_rows() {
        let store = LocalStore::in_memory().await.unwrap();
        store.ensure_table("notes").await.unwrap();
        sqlx::query(r#"INSERT INTO "notes" (key, payload) VALUES ('a', x'01'), ('b', x'02')"#)
            .execute(store.pool())
            .await
            .unwrap();
        let meta = store.load_metadata("notes").await.unwrap();
        store
            .save_metadata(&TableMetadata {
                last_sync: Timestamp::new(40),
                ..meta
            })
            .await
            .unwrap();

        let pending = |store: LocalStore| async move {
            sqlx::query_scalar::<_, i64>(
                r#"SELECT COUNT(*) FROM "__tablesync_changes_notes" WHERE pending = 1"#,
            )
            .fetch_one(store.pool())
            .await
            .unwrap()
        };

        store.reset_table("notes", true).await.unwrap();
        assert_eq!(pending(store.clone()).await, 2);
        assert_eq!(
            store.load_metadata("notes").await.unwrap().last_sync,
            Timestamp::zero()
        );

        store.reset_table("notes", false).await.unwrap();
        assert_eq!(pending(store.clone()).await, 0);
        let rows: i64 = sqlx::query_scalar(r#"SELECT COUNT(*) FROM "notes""#)
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn tables_on_disk_follow_metadata_tables() {
        let store = LocalStore::in_memory().await.unwrap();
        store.ensure_table("notes").await.unwrap();
        store.ensure_table("tasks").await.unwrap();
        assert_eq!(
            store.tables_on_disk().await.unwrap(),
            vec!["notes".to_string(), "tasks".to_string()]
        );
    }

    #[tokio::test]
    async fn system_rows_roundtrip_and_detect_tampering() {
        let store = LocalStore::in_memory().await.unwrap();
        store
            .put_system("active", "notes", 0, &KeyVersion::new(3))
            .await
            .unwrap();
        let value: Option<KeyVersion> = store.get_system("active", "notes", 0).await.unwrap();
        assert_eq!(value, Some(KeyVersion::new(3)));

        let listed: Vec<(String, u32, KeyVersion)> =
            store.list_system("active", None).await.unwrap();
        assert_eq!(listed, vec![("notes".to_string(), 0, KeyVersion::new(3))]);

        sqlx::query("UPDATE __tablesync_system SET body = '9' WHERE kind = 'active'")
            .execute(store.pool())
            .await
            .unwrap();
        let result: Result<Option<KeyVersion>, _> = store.get_system("active", "notes", 0).await;
        assert!(matches!(result, Err(StoreError::CorruptedSystemTable { .. })));

        assert_eq!(store.delete_system("active", Some("notes")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.db");
        {
            let store = LocalStore::open(&path).await.unwrap();
            store.ensure_table("notes").await.unwrap();
            let meta = store.load_metadata("notes").await.unwrap();
            store
                .save_metadata(&TableMetadata {
                    last_sync: Timestamp::new(5),
                    ..meta
                })
                .await
                .unwrap();
            store.pool().close().await;
        }
        let store = LocalStore::open(&path).await.unwrap();
        assert_eq!(
            store.load_metadata("notes").await.unwrap().last_sync,
            Timestamp::new(5)
        );
    }
}
