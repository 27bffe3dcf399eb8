//! Device-side inspection and provisioning against the agent database.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use payo_db::{NewRegistration, SqliteStore};
use payo_lock::LockStore;

use super::ms_to_rfc3339;

/// Create or update the registration row.
pub async fn register(
    pool: &SqlitePool,
    device_id: String,
    serial_number: Option<String>,
    sim_serials: Vec<String>,
    loan_number: Option<String>,
) -> Result<()> {
    let reg = payo_db::upsert_registration(
        pool,
        &NewRegistration {
            device_id,
            serial_number,
            sim_serials,
            loan_number,
        },
        Utc::now(),
    )
    .await?;
    println!("registered=true device_id={}", reg.device_id);
    println!("registered_at_utc={}", reg.registered_at.to_rfc3339());
    println!("updated_at_utc={}", reg.updated_at.to_rfc3339());
    println!("sim_serials={}", reg.sim_serials.join(","));
    Ok(())
}

/// Print the persisted lock record, or the unlocked default when none exists.
pub async fn lock_show(pool: &SqlitePool) -> Result<()> {
    let store = SqliteStore::new(pool.clone());
    let record = store.load().await.context("load lock record")?;
    let persisted = record.is_some();
    let record = record.unwrap_or_else(payo_lock::LockRecord::initial);

    println!("persisted={}", persisted);
    println!("state={}", record.state.as_str());
    println!(
        "reason={}",
        serde_json::to_value(record.reason.category)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    );
    println!("severity={}", record.reason.severity.as_str());
    println!("message={}", record.reason.message);
    println!("source={}", record.source.as_str());
    println!("seq={}", record.seq);
    println!("changed_at_utc={}", ms_to_rfc3339(record.changed_at_ms));
    Ok(())
}

pub async fn queue_stats(pool: &SqlitePool) -> Result<()> {
    let s = payo_db::status(pool).await?;
    if !s.has_lock_table {
        anyhow::bail!("schema missing; run `payo db migrate` first");
    }
    println!("queued_heartbeats={}", s.queued_heartbeats);
    println!("queued_reports={}", s.queued_reports);
    println!("processed_commands={}", s.processed_commands);
    Ok(())
}

pub async fn recent_heartbeats(pool: &SqlitePool, limit: i64) -> Result<()> {
    let rows = payo_db::recent_heartbeats(pool, limit).await?;
    for r in rows {
        println!(
            "ts={} delivered={} lock_state={} detail={}",
            ms_to_rfc3339(r.timestamp_ms),
            r.delivered,
            r.lock_state,
            r.detail.unwrap_or_default()
        );
    }
    Ok(())
}
