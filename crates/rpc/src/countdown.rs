//! A reusable countdown latch.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug)]
struct CountdownState {
    count: usize,
    grace: Duration,
    total: usize,
}

/// Counts `check()` calls and releases waiters once `total` have been seen.
///
/// After release, `wait()` sleeps an optional grace period so trailing
/// side-effects of the final event can settle.
#[derive(Debug)]
pub struct Countdown {
    notify: Notify,
    state: Mutex<CountdownState>,
}

impl Countdown {
    /// Creates a latch expecting `total` events, with no grace period.
    #[must_use]
    pub fn new(total: usize) -> Self {
        Self::with_grace(total, Duration::ZERO)
    }

    /// Creates a latch expecting `total` events, sleeping `grace` on release.
    #[must_use]
    pub fn with_grace(total: usize, grace: Duration) -> Self {
        Self {
            notify: Notify::new(),
            state: Mutex::new(CountdownState {
                count: 0,
                grace,
                total,
            }),
        }
    }

    /// Rearms the latch for a new round.
    pub fn reset(&self, total: usize, grace: Duration) {
        let mut state = self.state.lock();
        state.count = 0;
        state.grace = grace;
        state.total = total;
        drop(state);
        // A zero total releases immediately.
        self.notify.notify_waiters();
    }

    /// Records one event.
    pub fn check(&self) {
        let released = {
            let mut state = self.state.lock();
            state.count += 1;
            trace!("countdown {}/{}", state.count, state.total);
            state.count >= state.total
        };

        if released {
            self.notify.notify_waiters();
        }
    }

    /// Events recorded since the last reset.
    #[must_use]
    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    /// Events expected for release.
    #[must_use]
    pub fn total(&self) -> usize {
        self.state.lock().total
    }

    /// Suspends until `count >= total`, then sleeps the grace period.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (released, grace) = {
                let state = self.state.lock();
                (state.count >= state.total, state.grace)
            };

            if released {
                if !grace.is_zero() {
                    tokio::time::sleep(grace).await;
                }
                return;
            }

            notified.await;
        }
    }
}
