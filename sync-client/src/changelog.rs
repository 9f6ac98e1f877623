//! Local change tracking.
//!
//! Every local insert, update and delete is recorded as a pending
//! [`ChangeEntry`] in the same SQLite transaction as the data mutation, so a
//! committed write can never miss its change record. Remote changes are
//! applied back through [`ChangeLog::apply_remote_changes`], one transaction
//! per batch.

use sqlx::{Sqlite, Transaction};
use tablesync_core::{is_valid_table_name, next_local_version, resolve, LocalKeyState, Resolution};
use tablesync_types::{now_millis, ChangeEntry, UploadReceipt};
use tokio::sync::mpsc;

use crate::store::{changes_table, LocalStore, StoreError};

/// Notification that a table has new pending changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    /// Table that changed.
    pub table: String,
}

/// Counts reported by [`ChangeLog::apply_remote_changes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyResult {
    /// Entries written to the local table.
    pub applied: usize,
    /// Entries already known locally.
    pub skipped: usize,
    /// Pending local changes overwritten by a remote entry.
    pub discarded_local: usize,
    /// Applied entries that were deletions.
    pub deleted: usize,
}

#[derive(sqlx::FromRow)]
struct ChangeRow {
    key: String,
    version: i64,
    deleted: bool,
    payload: Option<Vec<u8>>,
    local_ts: i64,
}

#[derive(sqlx::FromRow)]
struct StateRow {
    version: i64,
    synced_version: i64,
    pending: bool,
}

impl StateRow {
    fn local_state(&self) -> LocalKeyState {
        LocalKeyState {
            synced_version: self.synced_version as u64,
            pending_version: self.pending.then_some(self.version as u64),
        }
    }
}

/// Pending-change log over a [`LocalStore`].
#[derive(Clone, Debug)]
pub struct ChangeLog {
    store: LocalStore,
    notices: Option<mpsc::Sender<ChangeNotice>>,
}

impl ChangeLog {
    /// Create a change log without a notice queue.
    pub fn new(store: LocalStore) -> Self {
        Self {
            store,
            notices: None,
        }
    }

    /// Create a change log that pushes a [`ChangeNotice`] after every write.
    pub fn with_notices(store: LocalStore, notices: mpsc::Sender<ChangeNotice>) -> Self {
        Self {
            store,
            notices: Some(notices),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Start tracking `table`.
    pub async fn register_table(&self, table: &str) -> Result<(), StoreError> {
        self.store.ensure_table(table).await
    }

    /// Record a local mutation inside the caller's transaction.
    ///
    /// Overwrites any pending entry for the same key. `None` records a
    /// deletion. Returns the new local version. Call [`ChangeLog::notify`]
    /// after committing.
    pub async fn record_local_change(
        &self,
        tx: &mut Transaction<'static, Sqlite>,
        table: &str,
        key: &str,
        payload: Option<&[u8]>,
    ) -> Result<u64, StoreError> {
        check_table(table)?;
        let changes = changes_table(table);

        let current = sqlx::query_as::<_, StateRow>(&format!(
            r#"SELECT version, synced_version, pending FROM "{}" WHERE key = ?1"#,
            changes
        ))
        .bind(key)
        .fetch_optional(&mut **tx)
        .await?;
        let version = next_local_version(current.as_ref().map(StateRow::local_state).as_ref());

        sqlx::query(&format!(
            r#"INSERT INTO "{0}" (key, version, synced_version, pending, deleted, payload, local_ts, seq)
               VALUES (?1, ?2, 0, 1, ?3, ?4, ?5, (SELECT COALESCE(MAX(seq), 0) + 1 FROM "{0}"))
               ON CONFLICT(key) DO UPDATE SET
                   version = excluded.version,
                   pending = 1,
                   deleted = excluded.deleted,
                   payload = excluded.payload,
                   local_ts = excluded.local_ts,
                   seq = excluded.seq"#,
            changes
        ))
        .bind(key)
        .bind(version as i64)
        .bind(payload.is_none())
        .bind(payload)
        .bind(now_millis() as i64)
        .execute(&mut **tx)
        .await?;

        Ok(version)
    }

    /// Push a change notice for `table`.
    ///
    /// A full queue drops the notice; the pending entries are durable and
    /// are picked up by the next pass.
    pub fn notify(&self, table: &str) {
        if let Some(notices) = &self.notices {
            if notices
                .try_send(ChangeNotice {
                    table: table.to_string(),
                })
                .is_err()
            {
                tracing::debug!("change queue full or closed, dropping notice for {}", table);
            }
        }
    }

    /// Insert or replace a row and record the change.
    pub async fn write(&self, table: &str, key: &str, payload: &[u8]) -> Result<u64, StoreError> {
        check_table(table)?;
        check_key(table, key)?;
        let mut tx = self.store.begin().await?;
        sqlx::query(&format!(
            r#"INSERT OR REPLACE INTO "{}" (key, payload) VALUES (?1, ?2)"#,
            table
        ))
        .bind(key)
        .bind(payload)
        .execute(&mut *tx)
        .await?;
        let version = self
            .record_local_change(&mut tx, table, key, Some(payload))
            .await?;
        tx.commit().await?;
        self.notify(table);
        Ok(version)
    }

    /// Delete a row and record a tombstone.
    pub async fn delete(&self, table: &str, key: &str) -> Result<u64, StoreError> {
        check_table(table)?;
        check_key(table, key)?;
        let mut tx = self.store.begin().await?;
        sqlx::query(&format!(r#"DELETE FROM "{}" WHERE key = ?1"#, table))
            .bind(key)
            .execute(&mut *tx)
            .await?;
        let version = self.record_local_change(&mut tx, table, key, None).await?;
        tx.commit().await?;
        self.notify(table);
        Ok(version)
    }

    /// Read a row from the local table.
    pub async fn read(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        check_table(table)?;
        let payload = sqlx::query_scalar::<_, Vec<u8>>(&format!(
            r#"SELECT payload FROM "{}" WHERE key = ?1"#,
            table
        ))
        .bind(key)
        .fetch_optional(self.store.pool())
        .await?;
        Ok(payload)
    }

    /// Oldest-first pending entries, without removing them.
    pub async fn next_pending_batch(
        &self,
        table: &str,
        max_count: usize,
    ) -> Result<Vec<ChangeEntry>, StoreError> {
        check_table(table)?;
        let rows = sqlx::query_as::<_, ChangeRow>(&format!(
            r#"SELECT key, version, deleted, payload, local_ts FROM "{}"
               WHERE pending = 1 ORDER BY seq LIMIT ?1"#,
            changes_table(table)
        ))
        .bind(max_count as i64)
        .fetch_all(self.store.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                let payload = match (row.deleted, row.payload) {
                    (true, _) => None,
                    (false, Some(payload)) => Some(payload),
                    (false, None) => {
                        return Err(StoreError::InvalidEntry {
                            table: table.to_string(),
                            key: row.key,
                            reason: "pending upsert has no payload".into(),
                        })
                    }
                };
                Ok(ChangeEntry {
                    table: table.to_string(),
                    key: row.key,
                    version: row.version as u64,
                    payload,
                    local_timestamp: row.local_ts as u64,
                })
            })
            .collect()
    }

    /// Number of entries waiting for upload.
    pub async fn pending_count(&self, table: &str) -> Result<u64, StoreError> {
        check_table(table)?;
        let count: i64 = sqlx::query_scalar(&format!(
            r#"SELECT COUNT(*) FROM "{}" WHERE pending = 1"#,
            changes_table(table)
        ))
        .fetch_one(self.store.pool())
        .await?;
        Ok(count as u64)
    }

    /// What the log knows about one key.
    pub async fn local_state(
        &self,
        table: &str,
        key: &str,
    ) -> Result<Option<LocalKeyState>, StoreError> {
        check_table(table)?;
        let row = sqlx::query_as::<_, StateRow>(&format!(
            r#"SELECT version, synced_version, pending FROM "{}" WHERE key = ?1"#,
            changes_table(table)
        ))
        .bind(key)
        .fetch_optional(self.store.pool())
        .await?;
        Ok(row.as_ref().map(StateRow::local_state))
    }

    /// Apply a batch of decrypted remote changes in one transaction.
    ///
    /// The whole batch is validated first; one malformed entry rejects it.
    /// Entries not newer than the last synced version are skipped, so
    /// applying the same batch twice changes nothing.
    pub async fn apply_remote_changes(
        &self,
        table: &str,
        entries: &[ChangeEntry],
    ) -> Result<ApplyResult, StoreError> {
        check_table(table)?;
        for entry in entries {
            let reason = if entry.table != table {
                Some(format!("entry belongs to table {}", entry.table))
            } else if entry.key.is_empty() {
                Some("empty key".to_string())
            } else if entry.version == 0 {
                Some("version 0 is never assigned".to_string())
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(StoreError::InvalidEntry {
                    table: table.to_string(),
                    key: entry.key.clone(),
                    reason,
                });
            }
        }

        let changes = changes_table(table);
        let mut result = ApplyResult::default();
        let mut tx = self.store.begin().await?;

        for entry in entries {
            let current = sqlx::query_as::<_, StateRow>(&format!(
                r#"SELECT version, synced_version, pending FROM "{}" WHERE key = ?1"#,
                changes
            ))
            .bind(&entry.key)
            .fetch_optional(&mut *tx)
            .await?;

            let discard_local = match resolve(
                current.as_ref().map(StateRow::local_state).as_ref(),
                entry.version,
            ) {
                Resolution::Skip => {
                    result.skipped += 1;
                    continue;
                }
                Resolution::ApplyRemote { discard_local } => discard_local,
            };

            let data_write = match &entry.payload {
                Some(payload) => {
                    sqlx::query(&format!(
                        r#"INSERT OR REPLACE INTO "{}" (key, payload) VALUES (?1, ?2)"#,
                        table
                    ))
                    .bind(&entry.key)
                    .bind(payload)
                    .execute(&mut *tx)
                    .await
                }
                None => {
                    sqlx::query(&format!(r#"DELETE FROM "{}" WHERE key = ?1"#, table))
                        .bind(&entry.key)
                        .execute(&mut *tx)
                        .await
                }
            };
            data_write.map_err(|source| StoreError::LocalApplyFailed {
                table: table.to_string(),
                key: entry.key.clone(),
                source,
            })?;

            sqlx::query(&format!(
                r#"INSERT INTO "{}" (key, version, synced_version, pending, deleted, payload, local_ts, seq)
                   VALUES (?1, ?2, ?2, 0, ?3, NULL, ?4, 0)
                   ON CONFLICT(key) DO UPDATE SET
                       version = excluded.version,
                       synced_version = excluded.synced_version,
                       pending = 0,
                       deleted = excluded.deleted,
                       payload = NULL"#,
                changes
            ))
            .bind(&entry.key)
            .bind(entry.version as i64)
            .bind(entry.is_deletion())
            .bind(entry.local_timestamp as i64)
            .execute(&mut *tx)
            .await?;

            result.applied += 1;
            if entry.is_deletion() {
                result.deleted += 1;
            }
            if discard_local {
                result.discarded_local += 1;
                tracing::debug!("remote version {} replaced pending change to {}/{}", entry.version, table, entry.key);
            }
        }

        tx.commit().await?;
        Ok(result)
    }

    /// Trim uploaded entries and record their server-assigned versions.
    ///
    /// An entry rewritten while its upload was in flight stays pending,
    /// with its local version moved above the newly synced version.
    /// Returns the number of entries trimmed.
    pub async fn mark_uploaded(
        &self,
        table: &str,
        receipts: &[(String, UploadReceipt)],
    ) -> Result<usize, StoreError> {
        check_table(table)?;
        let changes = changes_table(table);
        let mut trimmed = 0;
        let mut tx = self.store.begin().await?;

        for (key, receipt) in receipts {
            let Some(current) = sqlx::query_as::<_, StateRow>(&format!(
                r#"SELECT version, synced_version, pending FROM "{}" WHERE key = ?1"#,
                changes
            ))
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?
            else {
                continue;
            };

            let assigned = receipt.assigned_version as i64;
            if current.pending && current.version == receipt.local_version as i64 {
                sqlx::query(&format!(
                    r#"UPDATE "{}" SET pending = 0, version = ?2, synced_version = ?2, payload = NULL WHERE key = ?1"#,
                    changes
                ))
                .bind(key)
                .bind(assigned)
                .execute(&mut *tx)
                .await?;
                trimmed += 1;
            } else {
                let synced = current.synced_version.max(assigned);
                let version = if current.pending {
                    current.version.max(synced + 1)
                } else {
                    current.version.max(synced)
                };
                sqlx::query(&format!(
                    r#"UPDATE "{}" SET version = ?2, synced_version = ?3 WHERE key = ?1"#,
                    changes
                ))
                .bind(key)
                .bind(version)
                .bind(synced)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(trimmed)
    }
}

fn check_table(table: &str) -> Result<(), StoreError> {
    if is_valid_table_name(table) {
        Ok(())
    } else {
        Err(StoreError::InvalidTableName(table.to_string()))
    }
}

fn check_key(table: &str, key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidEntry {
            table: table.to_string(),
            key: String::new(),
            reason: "empty key".into(),
        });
    }
    Ok(())
}
