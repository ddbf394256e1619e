use crate::error::{HttpError, HttpErrorKind, RetryKind, TransportCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Watches a shared byte counter and fails when throughput stays low for too long
#[derive(Debug, Clone)]
pub struct LowSpeedMonitor {
    counter: Arc<AtomicU64>,
    limit: u64,
    time: Duration,
    tick: Duration,
}

impl LowSpeedMonitor {
    /// `limit` bytes per second sustained over `time`; zero for either disables it
    pub fn new(limit: u64, time: Duration) -> Self {
        Self {
            counter: Arc::new(AtomicU64::new(0)),
            limit,
            time,
            tick: Duration::from_secs(1),
        }
    }

    #[cfg(test)]
    fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Counter the transfer adds moved bytes to
    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.counter)
    }

    pub fn is_enabled(&self) -> bool {
        self.limit > 0 && !self.time.is_zero()
    }

    /// Resolves only once the transfer is judged stalled
    pub async fn watch(&self) -> HttpError {
        if !self.is_enabled() {
            return std::future::pending().await;
        }

        let ticks_needed = (self.time.as_millis() / self.tick.as_millis().max(1)).max(1) as u64;
        let per_tick_limit = (self.limit as u128 * self.tick.as_millis() / 1000).max(1) as u64;

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut last = self.counter.load(Ordering::Relaxed);
        let mut slow_ticks = 0u64;
        loop {
            ticker.tick().await;
            let now = self.counter.load(Ordering::Relaxed);
            let moved = now.saturating_sub(last);
            last = now;

            if moved < per_tick_limit {
                slow_ticks += 1;
            } else {
                slow_ticks = 0;
            }

            if slow_ticks >= ticks_needed {
                return HttpError::new(
                    HttpErrorKind::Transport {
                        code: TransportCode::LowSpeed,
                        message: format!(
                            "transfer below {} bytes/s for {:?}",
                            self.limit, self.time
                        ),
                    },
                    RetryKind::Retryable,
                );
            }
        }
    }
}
