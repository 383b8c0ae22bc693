//! Cooperative control for market loops.
//!
//! Each market loop owns a [`ControlHandle`] clone. Cross-cutting signals
//! (stop, sell-all) are plain atomic flags; waits between cycles poll them
//! at sub-second granularity so a control signal interrupts the wait
//! without sitting out the full interval. Cancellation is cooperative, not
//! preemptive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

#[derive(Default)]
struct ControlFlags {
    stop: AtomicBool,
    sell_all: AtomicBool,
}

/// Shared control handle for one market loop.
#[derive(Clone, Default)]
pub struct ControlHandle {
    flags: Arc<ControlFlags>,
    notify: Arc<Notify>,
}

impl ControlHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a graceful stop: the loop persists state and exits.
    pub fn request_stop(&self) {
        self.flags.stop.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn stop_requested(&self) -> bool {
        self.flags.stop.load(Ordering::SeqCst)
    }

    /// Request liquidation of every open position on the next cycle.
    pub fn request_sell_all(&self) {
        self.flags.sell_all.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Consume a pending sell-all request.
    pub fn take_sell_all(&self) -> bool {
        self.flags.sell_all.swap(false, Ordering::SeqCst)
    }

    pub fn sell_all_pending(&self) -> bool {
        self.flags.sell_all.load(Ordering::SeqCst)
    }

    /// Sleep up to `duration`, waking early when a control signal arrives.
    /// Returns true when the sleep was interrupted.
    pub async fn interruptible_sleep(&self, duration: Duration) -> bool {
        const CHUNK: Duration = Duration::from_millis(250);

        let mut elapsed = Duration::ZERO;
        while elapsed < duration {
            if self.stop_requested() || self.sell_all_pending() {
                return true;
            }
            let step = CHUNK.min(duration - elapsed);
            tokio::select! {
                _ = self.notify.notified() => return true,
                _ = tokio::time::sleep(step) => {}
            }
            elapsed += step;
        }
        self.stop_requested() || self.sell_all_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_sleep_runs_to_completion() {
        let control = ControlHandle::new();
        let started = Instant::now();
        let interrupted = control.interruptible_sleep(Duration::from_millis(50)).await;
        assert!(!interrupted);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_stop_interrupts_sleep() {
        let control = ControlHandle::new();
        let waker = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waker.request_stop();
        });

        let started = Instant::now();
        let interrupted = control.interruptible_sleep(Duration::from_secs(30)).await;
        assert!(interrupted);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(control.stop_requested());
    }

    #[tokio::test]
    async fn test_sell_all_is_consumed_once() {
        let control = ControlHandle::new();
        control.request_sell_all();
        assert!(control.take_sell_all());
        assert!(!control.take_sell_all());
    }
}
