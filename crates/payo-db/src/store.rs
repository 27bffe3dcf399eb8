use async_trait::async_trait;
use sqlx::SqlitePool;

use chrono::{DateTime, Utc};

use payo_lock::{LockRecord, LockStore, PaymentSchedule, ScheduleStore, StoreError};
use payo_schemas::{CommandKind, DeviceRegistration};
use payo_transport::{OfflineQueue, QueueError, QueueItem, Queued};

use crate::ledger::{CommandLedger, LedgerError};

/// SQLite-backed implementation of the agent's storage traits.
///
/// Cheap to clone; all clones share the pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Lock record
// ---------------------------------------------------------------------------

#[async_trait]
impl LockStore for SqliteStore {
    async fn load(&self) -> Result<Option<LockRecord>, StoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("select record_json from lock_state where id = 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError(format!("load lock_state: {e}")))?;
        match row {
            None => Ok(None),
            Some((json,)) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError(format!("decode lock_state: {e}"))),
        }
    }

    async fn save(&self, record: &LockRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record)
            .map_err(|e| StoreError(format!("encode lock_state: {e}")))?;
        sqlx::query(
            r#"
            insert into lock_state (id, state, seq, record_json, updated_at_ms)
            values (1, ?1, ?2, ?3, ?4)
            on conflict (id) do update set
              state         = excluded.state,
              seq           = excluded.seq,
              record_json   = excluded.record_json,
              updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(record.state.as_str())
        .bind(record.seq as i64)
        .bind(&json)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError(format!("save lock_state: {e}")))?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query("delete from lock_state")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError(format!("clear lock_state: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Payment schedule
// ---------------------------------------------------------------------------

#[async_trait]
impl ScheduleStore for SqliteStore {
    async fn load_schedule(&self) -> Result<Option<PaymentSchedule>, StoreError> {
        let row: Option<(String, Option<String>, i64)> = sqlx::query_as(
            "select due_at, code_hash, code_used from payment_schedule where id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError(format!("load payment_schedule: {e}")))?;

        let Some((due_at, code_hash, code_used)) = row else {
            return Ok(None);
        };
        let due = DateTime::parse_from_rfc3339(&due_at)
            .map_err(|e| StoreError(format!("decode payment_schedule.due_at: {e}")))?
            .with_timezone(&Utc);
        Ok(Some(PaymentSchedule {
            due,
            code_hash,
            code_used: code_used != 0,
        }))
    }

    async fn save_schedule(&self, schedule: &PaymentSchedule) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            insert into payment_schedule (id, due_at, code_hash, code_used, updated_at_ms)
            values (1, ?1, ?2, ?3, ?4)
            on conflict (id) do update set
              due_at        = excluded.due_at,
              code_hash     = excluded.code_hash,
              code_used     = excluded.code_used,
              updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(schedule.due.to_rfc3339())
        .bind(schedule.code_hash.as_deref())
        .bind(schedule.code_used as i64)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError(format!("save payment_schedule: {e}")))?;
        Ok(())
    }

    async fn clear_schedule(&self) -> Result<(), StoreError> {
        sqlx::query("delete from payment_schedule")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError(format!("clear payment_schedule: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

#[async_trait]
impl<T: QueueItem> OfflineQueue<T> for SqliteStore {
    async fn push(&self, item: &T) -> Result<i64, QueueError> {
        let payload = serde_json::to_string(item)
            .map_err(|e| QueueError(format!("encode {}: {e}", T::KIND)))?;
        let res = sqlx::query(
            "insert into outbox (kind, timestamp_ms, payload_json, created_at_ms) values (?1, ?2, ?3, ?4)",
        )
        .bind(T::KIND)
        .bind(item.timestamp_ms())
        .bind(&payload)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(|e| QueueError(format!("push {}: {e}", T::KIND)))?;
        Ok(res.last_insert_rowid())
    }

    async fn oldest(&self) -> Result<Option<Queued<T>>, QueueError> {
        let row: Option<(i64, String)> = sqlx::query_as(
            r#"
            select id, payload_json
            from outbox
            where kind = ?1
            order by timestamp_ms asc, id asc
            limit 1
            "#,
        )
        .bind(T::KIND)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| QueueError(format!("oldest {}: {e}", T::KIND)))?;

        match row {
            None => Ok(None),
            Some((id, payload)) => {
                let item = serde_json::from_str(&payload)
                    .map_err(|e| QueueError(format!("decode {} id={id}: {e}", T::KIND)))?;
                Ok(Some(Queued { id, item }))
            }
        }
    }

    async fn remove(&self, id: i64) -> Result<(), QueueError> {
        sqlx::query("delete from outbox where id = ?1 and kind = ?2")
            .bind(id)
            .bind(T::KIND)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError(format!("remove {} id={id}: {e}", T::KIND)))?;
        Ok(())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let (n,): (i64,) = sqlx::query_as("select count(*) from outbox where kind = ?1")
            .bind(T::KIND)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError(format!("len {}: {e}", T::KIND)))?;
        Ok(n.max(0) as usize)
    }

    async fn clear(&self) -> Result<(), QueueError> {
        sqlx::query("delete from outbox where kind = ?1")
            .bind(T::KIND)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError(format!("clear {}: {e}", T::KIND)))?;
        Ok(())
    }

    async fn max_timestamp_ms(&self) -> Result<Option<i64>, QueueError> {
        let (ts,): (Option<i64>,) =
            sqlx::query_as("select max(timestamp_ms) from outbox where kind = ?1")
                .bind(T::KIND)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| QueueError(format!("max_ts {}: {e}", T::KIND)))?;
        Ok(ts)
    }
}

// ---------------------------------------------------------------------------
// Command ledger
// ---------------------------------------------------------------------------

#[async_trait]
impl CommandLedger for SqliteStore {
    async fn is_processed(&self, command_id: &str) -> Result<bool, LedgerError> {
        let (n,): (i64,) =
            sqlx::query_as("select count(*) from processed_commands where command_id = ?1")
                .bind(command_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| LedgerError(format!("is_processed: {e}")))?;
        Ok(n > 0)
    }

    async fn record(
        &self,
        command_id: &str,
        kind: CommandKind,
        outcome: &str,
    ) -> Result<bool, LedgerError> {
        let res = sqlx::query(
            r#"
            insert into processed_commands (command_id, kind, outcome, processed_at_ms, acked)
            values (?1, ?2, ?3, ?4, 0)
            on conflict (command_id) do nothing
            "#,
        )
        .bind(command_id)
        .bind(kind.as_str())
        .bind(outcome)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .map_err(|e| LedgerError(format!("record: {e}")))?;
        Ok(res.rows_affected() == 1)
    }

    async fn unacked(&self) -> Result<Vec<String>, LedgerError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "select command_id from processed_commands where acked = 0 order by processed_at_ms asc, rowid asc",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LedgerError(format!("unacked: {e}")))?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn mark_acked(&self, command_ids: &[String]) -> Result<(), LedgerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LedgerError(format!("mark_acked begin: {e}")))?;
        for id in command_ids {
            sqlx::query("update processed_commands set acked = 1 where command_id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| LedgerError(format!("mark_acked {id}: {e}")))?;
        }
        tx.commit()
            .await
            .map_err(|e| LedgerError(format!("mark_acked commit: {e}")))?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), LedgerError> {
        sqlx::query("delete from processed_commands")
            .execute(&self.pool)
            .await
            .map_err(|e| LedgerError(format!("clear: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Read and teardown access to the registration row.
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    async fn registration(&self) -> anyhow::Result<Option<DeviceRegistration>>;
    async fn clear_registration(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl RegistrationStore for SqliteStore {
    async fn registration(&self) -> anyhow::Result<Option<DeviceRegistration>> {
        crate::load_registration(&self.pool).await
    }

    async fn clear_registration(&self) -> anyhow::Result<()> {
        crate::clear_registration(&self.pool).await
    }
}

#[derive(Debug, Default)]
pub struct MemoryRegistrationStore {
    row: std::sync::Mutex<Option<DeviceRegistration>>,
}

impl MemoryRegistrationStore {
    pub fn new(row: Option<DeviceRegistration>) -> Self {
        Self {
            row: std::sync::Mutex::new(row),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<DeviceRegistration>> {
        self.row.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RegistrationStore for MemoryRegistrationStore {
    async fn registration(&self) -> anyhow::Result<Option<DeviceRegistration>> {
        Ok(self.lock().clone())
    }

    async fn clear_registration(&self) -> anyhow::Result<()> {
        *self.lock() = None;
        Ok(())
    }
}
