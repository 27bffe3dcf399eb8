//! Offline queue for records that could not be delivered.
//!
//! Items are ordered by `(timestamp_ms, id)`; `oldest` always returns the
//! head of that order so flushing preserves the original send order.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use payo_schemas::{HeartbeatRequest, TamperReport};

use crate::error::QueueError;

pub trait QueueItem: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Partition key in shared storage.
    const KIND: &'static str;
    fn timestamp_ms(&self) -> i64;
}

impl QueueItem for HeartbeatRequest {
    const KIND: &'static str = "heartbeat";
    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

impl QueueItem for TamperReport {
    const KIND: &'static str = "tamper_report";
    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queued<T> {
    pub id: i64,
    pub item: T,
}

#[async_trait]
pub trait OfflineQueue<T: QueueItem>: Send + Sync {
    async fn push(&self, item: &T) -> Result<i64, QueueError>;
    async fn oldest(&self) -> Result<Option<Queued<T>>, QueueError>;
    async fn remove(&self, id: i64) -> Result<(), QueueError>;
    async fn len(&self) -> Result<usize, QueueError>;
    async fn clear(&self) -> Result<(), QueueError>;
    /// Largest queued timestamp; used to seed the heartbeat clock on boot.
    async fn max_timestamp_ms(&self) -> Result<Option<i64>, QueueError>;
}

pub struct MemoryQueue<T> {
    inner: Mutex<MemoryInner<T>>,
}

struct MemoryInner<T> {
    next_id: i64,
    items: BTreeMap<(i64, i64), T>,
}

impl<T> Default for MemoryQueue<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                next_id: 1,
                items: BTreeMap::new(),
            }),
        }
    }
}

impl<T> MemoryQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl<T: QueueItem> OfflineQueue<T> for MemoryQueue<T> {
    async fn push(&self, item: &T) -> Result<i64, QueueError> {
        let mut g = self.lock();
        let id = g.next_id;
        g.next_id += 1;
        g.items.insert((item.timestamp_ms(), id), item.clone());
        Ok(id)
    }

    async fn oldest(&self) -> Result<Option<Queued<T>>, QueueError> {
        Ok(self.lock().items.iter().next().map(|((_, id), item)| Queued {
            id: *id,
            item: item.clone(),
        }))
    }

    async fn remove(&self, id: i64) -> Result<(), QueueError> {
        self.lock().items.retain(|(_, i), _| *i != id);
        Ok(())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.lock().items.len())
    }

    async fn clear(&self) -> Result<(), QueueError> {
        self.lock().items.clear();
        Ok(())
    }

    async fn max_timestamp_ms(&self) -> Result<Option<i64>, QueueError> {
        Ok(self.lock().items.keys().map(|(ts, _)| *ts).max())
    }
}
