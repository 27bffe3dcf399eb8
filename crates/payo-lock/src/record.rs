use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::reason::LockReason;
use crate::state::{LockState, TransitionSource};

/// The persisted lock state. One row per device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub state: LockState,
    pub reason: LockReason,
    pub source: TransitionSource,
    pub changed_at_ms: i64,
    /// Bumped on every applied transition.
    pub seq: u64,
}

impl LockRecord {
    /// Starting record when nothing has been persisted.
    pub fn initial() -> Self {
        Self {
            state: LockState::None,
            reason: LockReason::unlocked(),
            source: TransitionSource::Boot,
            changed_at_ms: 0,
            seq: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("lock store: {0}")]
pub struct StoreError(pub String);

/// Durable home of the [`LockRecord`].
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn load(&self) -> Result<Option<LockRecord>, StoreError>;
    /// Must be durable when it returns `Ok`.
    async fn save(&self, record: &LockRecord) -> Result<(), StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
}

/// In-process store with a switch for failing writes.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    record: Option<LockRecord>,
    fail_saves: bool,
    saves: u64,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: LockRecord) -> Self {
        let s = Self::default();
        s.lock().record = Some(record);
        s
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.lock().fail_saves = fail;
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> u64 {
        self.lock().saves
    }

    pub fn snapshot(&self) -> Option<LockRecord> {
        self.lock().record.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn load(&self) -> Result<Option<LockRecord>, StoreError> {
        Ok(self.lock().record.clone())
    }

    async fn save(&self, record: &LockRecord) -> Result<(), StoreError> {
        let mut g = self.lock();
        if g.fail_saves {
            return Err(StoreError("injected save failure".to_string()));
        }
        g.record = Some(record.clone());
        g.saves += 1;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.lock().record = None;
        Ok(())
    }
}
