use std::sync::atomic::{AtomicI64, Ordering};

/// Issues strictly increasing millisecond timestamps for heartbeat records,
/// even if the wall clock stalls or steps backwards.
#[derive(Debug, Default)]
pub struct HeartbeatClock {
    last: AtomicI64,
}

impl HeartbeatClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never issue a value at or below `ts` (e.g. the newest queued record).
    pub fn observe(&self, ts: i64) {
        self.last.fetch_max(ts, Ordering::SeqCst);
    }

    pub fn next(&self) -> i64 {
        self.next_from(chrono::Utc::now().timestamp_millis())
    }

    pub fn next_from(&self, now_ms: i64) -> i64 {
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now_ms.max(prev + 1);
            match self
                .last
                .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}
