use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a countdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownOutcome {
    /// Reached zero; the caller should capture now.
    Expired,
    Cancelled,
    /// Another countdown was already running; this one did nothing.
    AlreadyRunning,
}

/// One-second countdown with a re-entry guard.
///
/// At most one countdown runs at a time per instance, so an overlapping
/// start can never lead to a second capture.
#[derive(Clone, Default)]
pub struct Countdown {
    running: Arc<AtomicBool>,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Countdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Count down from `seconds`, calling `on_tick` with the remaining
    /// seconds once per second (starting immediately with `seconds`).
    /// Expires exactly `seconds` after the call.
    pub async fn run<F>(&self, seconds: u32, cancel: &CancellationToken, mut on_tick: F) -> CountdownOutcome
    where
        F: FnMut(u32),
    {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Countdown already running, ignoring re-entry");
            return CountdownOutcome::AlreadyRunning;
        }
        let _guard = RunningGuard(&self.running);

        let mut remaining = seconds;
        if remaining == 0 {
            return CountdownOutcome::Expired;
        }
        on_tick(remaining);

        let period = Duration::from_secs(1);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while remaining > 0 {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(remaining = remaining, "Countdown cancelled");
                    return CountdownOutcome::Cancelled;
                }
                _ = ticker.tick() => {
                    remaining -= 1;
                    if remaining > 0 {
                        on_tick(remaining);
                    }
                }
            }
        }

        CountdownOutcome::Expired
    }
}
