//! Dedupe set for server commands.
//!
//! A command id is recorded once its effect has been applied. Recorded ids
//! stay unacknowledged until a heartbeat carrying them is delivered.

use std::sync::Mutex;

use async_trait::async_trait;
use payo_schemas::CommandKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("command ledger: {0}")]
pub struct LedgerError(pub String);

#[async_trait]
pub trait CommandLedger: Send + Sync {
    async fn is_processed(&self, command_id: &str) -> Result<bool, LedgerError>;

    /// Returns `false` if the id was already present (nothing written).
    async fn record(
        &self,
        command_id: &str,
        kind: CommandKind,
        outcome: &str,
    ) -> Result<bool, LedgerError>;

    /// Processed ids not yet acknowledged, in processing order.
    async fn unacked(&self) -> Result<Vec<String>, LedgerError>;

    async fn mark_acked(&self, command_ids: &[String]) -> Result<(), LedgerError>;

    async fn clear(&self) -> Result<(), LedgerError>;
}

#[derive(Debug, Clone)]
struct Entry {
    command_id: String,
    acked: bool,
}

#[derive(Debug, Default)]
pub struct MemoryCommandLedger {
    entries: Mutex<Vec<Entry>>,
}

impl MemoryCommandLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl CommandLedger for MemoryCommandLedger {
    async fn is_processed(&self, command_id: &str) -> Result<bool, LedgerError> {
        Ok(self.lock().iter().any(|e| e.command_id == command_id))
    }

    async fn record(
        &self,
        command_id: &str,
        _kind: CommandKind,
        _outcome: &str,
    ) -> Result<bool, LedgerError> {
        let mut g = self.lock();
        if g.iter().any(|e| e.command_id == command_id) {
            return Ok(false);
        }
        g.push(Entry {
            command_id: command_id.to_string(),
            acked: false,
        });
        Ok(true)
    }

    async fn unacked(&self) -> Result<Vec<String>, LedgerError> {
        Ok(self
            .lock()
            .iter()
            .filter(|e| !e.acked)
            .map(|e| e.command_id.clone())
            .collect())
    }

    async fn mark_acked(&self, command_ids: &[String]) -> Result<(), LedgerError> {
        for e in self.lock().iter_mut() {
            if command_ids.contains(&e.command_id) {
                e.acked = true;
            }
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), LedgerError> {
        self.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_is_idempotent_and_ack_hides_ids() {
        let l = MemoryCommandLedger::new();
        assert!(l.record("c1", CommandKind::Unlock, "applied").await.unwrap());
        assert!(!l.record("c1", CommandKind::Unlock, "applied").await.unwrap());
        assert!(l.record("c2", CommandKind::Lock, "applied").await.unwrap());
        assert_eq!(l.unacked().await.unwrap(), vec!["c1", "c2"]);

        l.mark_acked(&["c1".to_string()]).await.unwrap();
        assert_eq!(l.unacked().await.unwrap(), vec!["c2"]);
        // acked ids still dedupe
        assert!(l.is_processed("c1").await.unwrap());
    }
}
