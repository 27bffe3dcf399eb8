//! Provisioning and inspection commands against a scratch database file.

use predicates::str::contains;

use payo_db::SqliteStore;
use payo_lock::{
    LockReason, LockRecord, LockState, LockStore, ReasonCategory, Severity, TransitionSource,
};

fn payo(dir: &tempfile::TempDir, db: &std::path::Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("payo").unwrap();
    cmd.current_dir(dir.path()).env(payo_db::ENV_DB_PATH, db);
    cmd
}

#[test]
fn migrate_register_then_show_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("agent.sqlite");

    payo(&dir, &db)
        .args(["db", "migrate"])
        .assert()
        .success()
        .stdout(contains("migrations_applied=true"));

    payo(&dir, &db)
        .args([
            "register",
            "--device-id",
            "dev-9",
            "--sim",
            "8901",
            "--sim",
            "8902",
            "--loan-number",
            "LN-7",
        ])
        .assert()
        .success()
        .stdout(contains("registered=true device_id=dev-9"))
        .stdout(contains("sim_serials=8901,8902"));

    payo(&dir, &db)
        .args(["lock", "show"])
        .assert()
        .success()
        .stdout(contains("persisted=false"))
        .stdout(contains("state=NONE"));

    payo(&dir, &db)
        .args(["queue", "stats"])
        .assert()
        .success()
        .stdout(contains("queued_heartbeats=0"))
        .stdout(contains("processed_commands=0"));
}

#[tokio::test]
async fn lock_show_prints_persisted_record() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("agent.sqlite");

    let pool = payo_db::connect(db.to_str().unwrap()).await.unwrap();
    payo_db::migrate(&pool).await.unwrap();
    SqliteStore::new(pool.clone())
        .save(&LockRecord {
            state: LockState::HardLocked,
            reason: LockReason::new(ReasonCategory::PaymentOverdue, Severity::High),
            source: TransitionSource::PaymentSchedule,
            changed_at_ms: 1_700_000_000_000,
            seq: 3,
        })
        .await
        .unwrap();
    pool.close().await;

    payo(&dir, &db)
        .args(["lock", "show"])
        .assert()
        .success()
        .stdout(contains("persisted=true"))
        .stdout(contains("state=HARD_LOCKED"))
        .stdout(contains("reason=PAYMENT_OVERDUE"))
        .stdout(contains("seq=3"));
}

#[test]
fn strict_config_hash_rejects_unread_keys() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("agent.sqlite");
    let cfg = dir.path().join("agent.yaml");
    std::fs::write(&cfg, "heartbeat:\n  interval_secs: 30\nmystery:\n  knob: 1\n").unwrap();

    payo(&dir, &db)
        .args(["config-hash", cfg.to_str().unwrap()])
        .assert()
        .success()
        .stdout(contains("config_hash="))
        .stderr(contains("unused_key=/mystery/knob"));

    payo(&dir, &db)
        .args(["config-hash", "--strict", cfg.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(contains("CONFIG_UNUSED_KEYS"));
}
