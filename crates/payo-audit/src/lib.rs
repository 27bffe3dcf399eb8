//! payo-audit
//!
//! Append-only tamper log. JSON Lines, one entry per line, each entry
//! hash-chained to the previous one (`hash_prev` + `hash_self`), so an edit
//! or deletion anywhere in the file is detectable by [`verify_hash_chain`].

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use payo_tamper::TamperEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TamperLogEntry {
    pub seq: u64,
    pub ts_utc: DateTime<Utc>,
    pub event: TamperEvent,
    /// Lock state in force after the event was handled.
    pub lock_state: String,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

/// Append-only writer. Resumes the chain of an existing file on open.
pub struct TamperLog {
    path: PathBuf,
    last_hash: Option<String>,
    seq: u64,
}

impl TamperLog {
    /// Open (or create) the log at `path`.
    ///
    /// An existing file with an intact chain is resumed. A broken one is moved
    /// aside to `<path>.broken.<unix_ms>` and a fresh chain is started; the
    /// broken file is kept for inspection.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create_dir_all {:?}", parent))?;
            }
        }

        let mut log = Self {
            path: path.clone(),
            last_hash: None,
            seq: 0,
        };

        if !path.exists() {
            return Ok(log);
        }

        let content =
            fs::read_to_string(&path).with_context(|| format!("read tamper log {:?}", path))?;
        match verify_hash_chain_str(&content) {
            Ok(VerifyResult::Valid { .. }) => {
                if let Some(last) = last_entry(&content)? {
                    log.seq = last.seq + 1;
                    log.last_hash = last.hash_self;
                }
            }
            Ok(VerifyResult::Broken { line, reason }) => {
                set_aside(&path)?;
                tracing::error!(line, reason = %reason, "tamper log chain broken; started new log");
            }
            Err(e) => {
                set_aside(&path)?;
                tracing::error!(error = %e, "tamper log unreadable; started new log");
            }
        }
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_hash(&self) -> Option<String> {
        self.last_hash.clone()
    }

    /// Sequence number the next entry will get.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn append(&mut self, event: &TamperEvent, lock_state: &str) -> Result<TamperLogEntry> {
        let mut entry = TamperLogEntry {
            seq: self.seq,
            ts_utc: Utc::now(),
            event: event.clone(),
            lock_state: lock_state.to_string(),
            hash_prev: self.last_hash.clone(),
            hash_self: None,
        };
        let self_hash = compute_entry_hash(&entry)?;
        entry.hash_self = Some(self_hash.clone());

        let line = canonical_json_line(&entry)?;
        append_line(&self.path, &line)?;

        self.last_hash = Some(self_hash);
        self.seq += 1;
        Ok(entry)
    }
}

fn set_aside(path: &Path) -> Result<()> {
    let mut target = path.as_os_str().to_owned();
    target.push(format!(".broken.{}", Utc::now().timestamp_millis()));
    fs::rename(path, &target).with_context(|| format!("rename broken tamper log {:?}", path))
}

fn last_entry(content: &str) -> Result<Option<TamperLogEntry>> {
    match content.lines().rev().find(|l| !l.trim().is_empty()) {
        None => Ok(None),
        Some(line) => Ok(Some(
            serde_json::from_str(line.trim()).context("parse last tamper log entry")?,
        )),
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open tamper log {:?}", path))?;
    f.write_all(line.as_bytes())
        .context("write tamper log line failed")?;
    f.write_all(b"\n").context("write newline failed")?;
    f.sync_data().context("fsync tamper log failed")?;
    Ok(())
}

/// Sort keys recursively and emit compact JSON.
fn canonical_json_line<T: Serialize>(v: &T) -> Result<String> {
    let raw = serde_json::to_value(v).context("serialize tamper log entry failed")?;
    serde_json::to_string(&sort_keys(&raw)).context("json stringify failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

/// Hash of the canonical entry with `hash_self` removed.
pub fn compute_entry_hash(entry: &TamperLogEntry) -> Result<String> {
    let mut clone = entry.clone();
    clone.hash_self = None;
    let canonical = canonical_json_line(&clone)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

pub fn verify_hash_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read tamper log {:?}", path.as_ref()))?;
    verify_hash_chain_str(&content)
}

/// Check linkage, self hashes and sequence continuity of JSONL content.
pub fn verify_hash_chain_str(content: &str) -> Result<VerifyResult> {
    let mut prev_hash: Option<String> = None;
    let mut expected_seq: Option<u64> = None;
    let mut line_count = 0usize;

    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let entry: TamperLogEntry = serde_json::from_str(trimmed)
            .with_context(|| format!("parse tamper log entry at line {}", i + 1))?;
        line_count += 1;

        if entry.hash_prev != prev_hash {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!(
                    "hash_prev mismatch: expected {:?}, got {:?}",
                    prev_hash, entry.hash_prev
                ),
            });
        }

        if let Some(want) = expected_seq {
            if entry.seq != want {
                return Ok(VerifyResult::Broken {
                    line: i + 1,
                    reason: format!("seq gap: expected {want}, got {}", entry.seq),
                });
            }
        }

        let Some(claimed) = entry.hash_self.clone() else {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: "missing hash_self".to_string(),
            });
        };
        let recomputed = compute_entry_hash(&entry)?;
        if claimed != recomputed {
            return Ok(VerifyResult::Broken {
                line: i + 1,
                reason: format!("hash_self mismatch: claimed {claimed}, recomputed {recomputed}"),
            });
        }

        prev_hash = Some(claimed);
        expected_seq = Some(entry.seq + 1);
    }

    Ok(VerifyResult::Valid { lines: line_count })
}

/// Read every entry without verifying. For display; verify separately.
pub fn read_entries(path: impl AsRef<Path>) -> Result<Vec<TamperLogEntry>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("read tamper log {:?}", path.as_ref()))?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, l)| {
            serde_json::from_str(l.trim())
                .with_context(|| format!("parse tamper log entry {}", i + 1))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { lines: usize },
    Broken { line: usize, reason: String },
}
