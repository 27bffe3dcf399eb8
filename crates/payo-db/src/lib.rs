//! payo-db
//!
//! On-device SQLite store for the agent: lock record, payment schedule,
//! registration, offline outbox, processed-command ledger and heartbeat
//! history.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use payo_schemas::DeviceRegistration;

mod ledger;
mod store;

pub use ledger::{CommandLedger, LedgerError, MemoryCommandLedger};
pub use store::{MemoryRegistrationStore, RegistrationStore, SqliteStore};

pub const ENV_DB_PATH: &str = "PAYO_DB_PATH";

/// Open (creating if missing) the agent database file.
pub async fn connect(path: &str) -> Result<SqlitePool> {
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(opts)
        .await
        .with_context(|| format!("failed to open sqlite db at {path}"))?;
    Ok(pool)
}

/// Single-connection in-memory database. Every connection to `:memory:` is
/// a fresh database, so the pool is capped at one.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .context("failed to open in-memory sqlite")?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbStatus {
    pub ok: bool,
    pub has_lock_table: bool,
    pub queued_heartbeats: i64,
    pub queued_reports: i64,
    pub processed_commands: i64,
}

/// Connectivity, schema presence and row counts.
pub async fn status(pool: &SqlitePool) -> Result<DbStatus> {
    let (one,): (i64,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (tables,): (i64,) = sqlx::query_as(
        "select count(*) from sqlite_master where type = 'table' and name = 'lock_state'",
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    if tables == 0 {
        return Ok(DbStatus {
            ok: one == 1,
            has_lock_table: false,
            queued_heartbeats: 0,
            queued_reports: 0,
            processed_commands: 0,
        });
    }

    let count_kind = |kind: &'static str| async move {
        sqlx::query_as::<_, (i64,)>("select count(*) from outbox where kind = ?1")
            .bind(kind)
            .fetch_one(pool)
            .await
            .map(|(n,)| n)
            .with_context(|| format!("status outbox count failed kind={kind}"))
    };
    let queued_heartbeats = count_kind("heartbeat").await?;
    let queued_reports = count_kind("tamper_report").await?;
    let (processed_commands,): (i64,) = sqlx::query_as("select count(*) from processed_commands")
        .fetch_one(pool)
        .await
        .context("status command count failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_lock_table: true,
        queued_heartbeats,
        queued_reports,
        processed_commands,
    })
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct NewRegistration {
    pub device_id: String,
    pub serial_number: Option<String>,
    pub sim_serials: Vec<String>,
    pub loan_number: Option<String>,
}

/// Create the registration row, or update it on re-registration.
/// `registered_at` is kept from the first registration.
pub async fn upsert_registration(
    pool: &SqlitePool,
    reg: &NewRegistration,
    now: DateTime<Utc>,
) -> Result<DeviceRegistration> {
    anyhow::ensure!(
        !reg.device_id.trim().is_empty(),
        "REGISTRATION_INVALID: device_id is empty"
    );
    let sims = serde_json::to_string(&reg.sim_serials).context("encode sim serials")?;
    let now_s = now.to_rfc3339();

    sqlx::query(
        r#"
        insert into device_registration (
          id, device_id, registered_at, updated_at, serial_number, sim_serials_json, loan_number
        ) values (1, ?1, ?2, ?2, ?3, ?4, ?5)
        on conflict (id) do update set
          device_id        = excluded.device_id,
          updated_at       = excluded.updated_at,
          serial_number    = excluded.serial_number,
          sim_serials_json = excluded.sim_serials_json,
          loan_number      = excluded.loan_number
        "#,
    )
    .bind(&reg.device_id)
    .bind(&now_s)
    .bind(&reg.serial_number)
    .bind(&sims)
    .bind(&reg.loan_number)
    .execute(pool)
    .await
    .context("upsert_registration failed")?;

    load_registration(pool)
        .await?
        .context("registration missing after upsert")
}

type RegistrationRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
);

pub async fn load_registration(pool: &SqlitePool) -> Result<Option<DeviceRegistration>> {
    let row: Option<RegistrationRow> = sqlx::query_as(
        r#"
        select device_id, registered_at, updated_at, serial_number, sim_serials_json, loan_number
        from device_registration
        where id = 1
        "#,
    )
    .fetch_optional(pool)
    .await
    .context("load_registration failed")?;

    let Some((device_id, registered_at, updated_at, serial_number, sims, loan_number)) = row else {
        return Ok(None);
    };

    Ok(Some(DeviceRegistration {
        device_id,
        registered_at: parse_ts(&registered_at)?,
        updated_at: parse_ts(&updated_at)?,
        serial_number,
        sim_serials: serde_json::from_str(&sims).context("decode sim serials")?,
        loan_number,
    }))
}

pub async fn clear_registration(pool: &SqlitePool) -> Result<()> {
    sqlx::query("delete from device_registration")
        .execute(pool)
        .await
        .context("clear_registration failed")?;
    Ok(())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp in db: {s}"))?
        .with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Heartbeat history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatHistoryRow {
    pub timestamp_ms: i64,
    pub delivered: bool,
    pub lock_state: String,
    pub detail: Option<String>,
}

pub async fn record_heartbeat(pool: &SqlitePool, row: &HeartbeatHistoryRow) -> Result<()> {
    sqlx::query(
        "insert into heartbeat_history (timestamp_ms, delivered, lock_state, detail) values (?1, ?2, ?3, ?4)",
    )
    .bind(row.timestamp_ms)
    .bind(i64::from(row.delivered))
    .bind(&row.lock_state)
    .bind(&row.detail)
    .execute(pool)
    .await
    .context("record_heartbeat failed")?;
    Ok(())
}

/// Most recent first.
pub async fn recent_heartbeats(pool: &SqlitePool, limit: i64) -> Result<Vec<HeartbeatHistoryRow>> {
    let rows: Vec<(i64, i64, String, Option<String>)> = sqlx::query_as(
        r#"
        select timestamp_ms, delivered, lock_state, detail
        from heartbeat_history
        order by timestamp_ms desc, id desc
        limit ?1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("recent_heartbeats failed")?;

    Ok(rows
        .into_iter()
        .map(|(timestamp_ms, delivered, lock_state, detail)| HeartbeatHistoryRow {
            timestamp_ms,
            delivered: delivered != 0,
            lock_state,
            detail,
        })
        .collect())
}

/// Keep only the newest `keep` history rows.
pub async fn prune_heartbeat_history(pool: &SqlitePool, keep: i64) -> Result<u64> {
    let res = sqlx::query(
        r#"
        delete from heartbeat_history
        where id not in (
          select id from heartbeat_history order by timestamp_ms desc, id desc limit ?1
        )
        "#,
    )
    .bind(keep)
    .execute(pool)
    .await
    .context("prune_heartbeat_history failed")?;
    Ok(res.rows_affected())
}
