use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Run `tick` every `period` until `cancel` fires.
///
/// The first tick runs immediately. Cancellation is observed between ticks;
/// a tick in progress always runs to completion.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(task = name, period_ms = period.as_millis() as u64, "periodic task started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(task = name, "periodic task stopping");
                    break;
                }
                _ = ticker.tick() => tick().await,
            }
        }
    })
}
