//! Periodic background maintenance.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Run `tick` every `period` until `shutdown` is cancelled.
///
/// The first tick fires one period after spawning. Ticks missed while a
/// previous one was running are skipped rather than bursted.
pub fn spawn_periodic<F>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => tick(),
            }
        }

        debug!(task = name, "Maintenance task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let counter = count.clone();
        let handle = spawn_periodic("test", Duration::from_secs(10), token.clone(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
