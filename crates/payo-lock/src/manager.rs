//! The single writer of [`LockState`].
//!
//! # Invariants
//!
//! - **Single writer**: the record is private; `request_transition`,
//!   `boot` and `clear_for_deactivation` are the only mutators.
//! - **Durable before visible**: a transition is saved with one
//!   `LockStore::save` before memory, snapshot or listeners see it. A failed
//!   save leaves every observer on the old state.
//! - **Serialized**: one async mutex spans decide, persist and broadcast, so
//!   listeners observe transitions in `seq` order.
//! - **Boot heals**: the restored record is re-broadcast so enforcement
//!   re-applies itself after a restart.

use std::sync::{Arc, RwLock};

use tokio::sync::{watch, Mutex};

use crate::policy::{self, Decision, TransitionRejected};
use crate::reason::LockReason;
use crate::record::{LockRecord, LockStore, StoreError};
use crate::state::{LockState, TransitionSource};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("transition rejected: {0}")]
    Rejected(#[from] TransitionRejected),
    #[error("lock state not persisted: {0}")]
    Storage(#[from] StoreError),
}

/// Delivered to listeners after a transition is durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockChange {
    pub previous: LockState,
    pub record: LockRecord,
    /// `true` for the boot-time re-broadcast.
    pub restored: bool,
}

/// Synchronous observer. Runs inside the manager's critical section, so it
/// must not call back into the manager.
pub trait LockListener: Send + Sync {
    fn on_lock_changed(&self, change: &LockChange);
}

pub struct LockStateManager {
    record: Mutex<LockRecord>,
    store: Arc<dyn LockStore>,
    listeners: RwLock<Vec<Arc<dyn LockListener>>>,
    snapshot: watch::Sender<LockRecord>,
}

impl LockStateManager {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        let (snapshot, _) = watch::channel(LockRecord::initial());
        Self {
            record: Mutex::new(LockRecord::initial()),
            store,
            listeners: RwLock::new(Vec::new()),
            snapshot,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn LockListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Restore the persisted record (or `None`) and re-broadcast it.
    ///
    /// A returned record in `Deactivating` means a deactivation was
    /// interrupted and must be resumed by the caller.
    pub async fn boot(&self) -> Result<LockRecord, LockError> {
        let mut guard = self.record.lock().await;
        let restored = self.store.load().await?.unwrap_or_else(LockRecord::initial);
        tracing::info!(
            state = %restored.state,
            seq = restored.seq,
            "lock state restored"
        );
        *guard = restored.clone();
        self.snapshot.send_replace(restored.clone());
        self.broadcast(&LockChange {
            previous: restored.state,
            record: restored.clone(),
            restored: true,
        });
        Ok(restored)
    }

    /// Request a move to `target`. Returns the state in force afterwards.
    pub async fn request_transition(
        &self,
        target: LockState,
        reason: LockReason,
        source: TransitionSource,
    ) -> Result<LockState, LockError> {
        let mut guard = self.record.lock().await;

        match policy::decide(&guard, target, source) {
            Ok(Decision::NoChange) => return Ok(guard.state),
            Ok(Decision::Apply) => {}
            Err(rejected) => {
                tracing::info!(
                    current = %guard.state,
                    target = %target,
                    source = %source,
                    reason = %rejected,
                    "lock transition rejected"
                );
                return Err(rejected.into());
            }
        }

        let next = LockRecord {
            state: target,
            reason,
            source,
            changed_at_ms: chrono::Utc::now().timestamp_millis(),
            seq: guard.seq + 1,
        };

        if let Err(e) = self.store.save(&next).await {
            tracing::error!(target = %target, error = %e, "lock transition not persisted");
            return Err(e.into());
        }

        let previous = guard.state;
        *guard = next.clone();
        self.snapshot.send_replace(next.clone());
        tracing::warn!(
            from = %previous,
            to = %target,
            source = %source,
            category = ?next.reason.category,
            seq = next.seq,
            "lock state changed"
        );
        self.broadcast(&LockChange {
            previous,
            record: next,
            restored: false,
        });
        Ok(target)
    }

    /// Wipe the persisted record as part of deactivation.
    ///
    /// Listeners are not notified: enforcement has already been torn down and
    /// must not re-apply the baseline for `None`.
    pub async fn clear_for_deactivation(&self) -> Result<(), LockError> {
        let mut guard = self.record.lock().await;
        self.store.clear().await?;
        let cleared = LockRecord {
            state: LockState::None,
            reason: LockReason::unlocked(),
            source: TransitionSource::DeactivationSequencer,
            changed_at_ms: chrono::Utc::now().timestamp_millis(),
            seq: guard.seq + 1,
        };
        *guard = cleared.clone();
        self.snapshot.send_replace(cleared);
        tracing::info!("lock state cleared for deactivation");
        Ok(())
    }

    /// Run `f` on the committed record under the writer lock. No transition
    /// or listener can interleave with `f`; keep it short and synchronous.
    pub async fn with_record<R>(&self, f: impl FnOnce(&LockRecord) -> R) -> R {
        let guard = self.record.lock().await;
        f(&guard)
    }

    /// Last committed record, without waiting on in-flight transitions.
    pub fn record(&self) -> LockRecord {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> LockState {
        self.snapshot.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<LockRecord> {
        self.snapshot.subscribe()
    }

    fn broadcast(&self, change: &LockChange) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for l in listeners {
            l.on_lock_changed(change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reason::{ReasonCategory, Severity};
    use crate::record::MemoryLockStore;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder(StdMutex<Vec<LockChange>>);

    impl LockListener for Recorder {
        fn on_lock_changed(&self, change: &LockChange) {
            self.0.lock().unwrap().push(change.clone());
        }
    }

    fn reason(c: ReasonCategory) -> LockReason {
        LockReason::new(c, Severity::High)
    }

    async fn manager() -> (Arc<MemoryLockStore>, Arc<Recorder>, LockStateManager) {
        let store = Arc::new(MemoryLockStore::new());
        let rec = Arc::new(Recorder::default());
        let mgr = LockStateManager::new(store.clone());
        mgr.add_listener(rec.clone());
        mgr.boot().await.unwrap();
        (store, rec, mgr)
    }

    #[tokio::test]
    async fn applied_transition_is_saved_then_broadcast() {
        let (store, rec, mgr) = manager().await;
        let got = mgr
            .request_transition(
                LockState::HardLocked,
                reason(ReasonCategory::DeviceTampering),
                TransitionSource::TamperCollector,
            )
            .await
            .unwrap();
        assert_eq!(got, LockState::HardLocked);
        assert_eq!(store.snapshot().unwrap().state, LockState::HardLocked);
        let changes = rec.0.lock().unwrap().clone();
        // boot re-broadcast + one transition
        assert_eq!(changes.len(), 2);
        assert!(changes[0].restored);
        assert_eq!(changes[1].previous, LockState::None);
        assert_eq!(changes[1].record.seq, 1);
    }

    #[tokio::test]
    async fn same_state_does_not_write_or_broadcast() {
        let (store, rec, mgr) = manager().await;
        mgr.request_transition(
            LockState::SoftLocked,
            reason(ReasonCategory::PaymentDueSoon),
            TransitionSource::PaymentSchedule,
        )
        .await
        .unwrap();
        let saves = store.save_count();
        let seen = rec.0.lock().unwrap().len();

        let got = mgr
            .request_transition(
                LockState::SoftLocked,
                reason(ReasonCategory::PaymentDueSoon),
                TransitionSource::PaymentSchedule,
            )
            .await
            .unwrap();
        assert_eq!(got, LockState::SoftLocked);
        assert_eq!(store.save_count(), saves);
        assert_eq!(rec.0.lock().unwrap().len(), seen);
    }

    #[tokio::test]
    async fn failed_save_keeps_old_state() {
        let (store, rec, mgr) = manager().await;
        store.set_fail_saves(true);
        let err = mgr
            .request_transition(
                LockState::PermanentLocked,
                reason(ReasonCategory::SecurityBreach),
                TransitionSource::TamperCollector,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Storage(_)));
        assert_eq!(mgr.state(), LockState::None);
        assert_eq!(rec.0.lock().unwrap().len(), 1, "only the boot broadcast");
    }

    #[tokio::test]
    async fn boot_restores_persisted_record() {
        let persisted = LockRecord {
            state: LockState::PermanentLocked,
            reason: reason(ReasonCategory::LoanDefault),
            source: TransitionSource::ServerCommand,
            changed_at_ms: 42,
            seq: 7,
        };
        let store = Arc::new(MemoryLockStore::with_record(persisted.clone()));
        let rec = Arc::new(Recorder::default());
        let mgr = LockStateManager::new(store);
        mgr.add_listener(rec.clone());

        let restored = mgr.boot().await.unwrap();
        assert_eq!(restored, persisted);
        assert_eq!(mgr.state(), LockState::PermanentLocked);
        let changes = rec.0.lock().unwrap().clone();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].restored);
        assert_eq!(changes[0].record.state, LockState::PermanentLocked);
    }

    #[tokio::test]
    async fn clear_for_deactivation_is_silent() {
        let (store, rec, mgr) = manager().await;
        mgr.request_transition(
            LockState::Deactivating,
            reason(ReasonCategory::AdminAction),
            TransitionSource::ServerDeactivate,
        )
        .await
        .unwrap();
        let seen = rec.0.lock().unwrap().len();

        mgr.clear_for_deactivation().await.unwrap();
        assert!(store.snapshot().is_none());
        assert_eq!(mgr.state(), LockState::None);
        assert_eq!(rec.0.lock().unwrap().len(), seen);
    }

    /// Save blocks until released, so a transition can be held in flight.
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryLockStore,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl LockStore for GatedStore {
        async fn load(&self) -> Result<Option<LockRecord>, StoreError> {
            self.inner.load().await
        }
        async fn save(&self, record: &LockRecord) -> Result<(), StoreError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.save(record).await
        }
        async fn clear(&self) -> Result<(), StoreError> {
            self.inner.clear().await
        }
    }

    #[tokio::test]
    async fn with_record_waits_for_in_flight_transition() {
        let store = Arc::new(GatedStore::default());
        let mgr = Arc::new(LockStateManager::new(store.clone()));
        mgr.boot().await.unwrap();

        let writer = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.request_transition(
                    LockState::HardLocked,
                    reason(ReasonCategory::DeviceTampering),
                    TransitionSource::TamperCollector,
                )
                .await
            })
        };
        store.entered.notified().await;

        // The snapshot still shows the old state while the save is pending.
        assert_eq!(mgr.state(), LockState::None);
        let reader = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.with_record(|r| r.state).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        store.release.notify_one();
        assert_eq!(writer.await.unwrap(), Ok(LockState::HardLocked));
        assert_eq!(reader.await.unwrap(), LockState::HardLocked);
    }
}
