//! A single-shot inactivity watchdog.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

/// Default tick interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

type Listener = Arc<dyn Fn() + Send + Sync>;

/// Fires its listener once when no [`check`](Self::check) has been seen for
/// `max` of accumulated ticks. Fired or closed watchers never fire again.
pub struct TimeoutWatcher {
    elapsed: Arc<Mutex<Duration>>,
    fired: Arc<AtomicBool>,
    interval: Duration,
    listener: Listener,
    max: Duration,
    shutdown_token: CancellationToken,
    started: AtomicBool,
    task_tracker: TaskTracker,
}

impl TimeoutWatcher {
    /// Creates a watcher ticking every second.
    pub fn new(max: Duration, listener: impl Fn() + Send + Sync + 'static) -> Self {
        Self::with_interval(DEFAULT_INTERVAL, max, listener)
    }

    /// Creates a watcher with a custom tick interval. Zero falls back to the
    /// default interval.
    pub fn with_interval(
        interval: Duration,
        max: Duration,
        listener: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        let interval = if interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            interval
        };

        Self {
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
            fired: Arc::new(AtomicBool::new(false)),
            interval,
            listener: Arc::new(listener),
            max,
            shutdown_token: CancellationToken::new(),
            started: AtomicBool::new(false),
            task_tracker: TaskTracker::new(),
        }
    }

    /// Starts ticking. Only the first call has an effect.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let elapsed = self.elapsed.clone();
        let fired = self.fired.clone();
        let interval = self.interval;
        let listener = self.listener.clone();
        let max = self.max;
        let token = self.shutdown_token.clone();

        self.task_tracker.spawn(async move {
            while !max.is_zero() {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }

                let total = {
                    let mut elapsed = elapsed.lock();
                    *elapsed += interval;
                    *elapsed
                };
                trace!("watcher tick, {:?} of {:?} idle", total, max);

                if total >= max {
                    if token.is_cancelled() {
                        break;
                    }
                    debug!("watcher fired after {:?} idle", total);
                    fired.store(true, Ordering::SeqCst);
                    listener();
                    break;
                }
            }
        });
        self.task_tracker.close();
    }

    /// Resets the idle counter.
    pub fn check(&self) {
        *self.elapsed.lock() = Duration::ZERO;
    }

    /// Stops the watcher; it will not fire afterwards.
    pub fn close(&self) {
        self.shutdown_token.cancel();
        self.task_tracker.close();
    }

    /// Waits until the tick loop has exited. Returns once closed even if the
    /// watcher never started.
    pub async fn closed(&self) {
        self.task_tracker.wait().await;
    }

    /// Whether the listener has run.
    #[must_use]
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

impl Drop for TimeoutWatcher {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counting_watcher(max: Duration) -> (TimeoutWatcher, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let watcher = TimeoutWatcher::with_interval(Duration::from_millis(10), max, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (watcher, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_idle() {
        let (watcher, calls) = counting_watcher(Duration::from_millis(50));
        watcher.start();

        tokio::time::sleep(Duration::from_millis(200)).await;
        watcher.closed().await;

        assert!(watcher.fired());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_postpones_firing() {
        let (watcher, calls) = counting_watcher(Duration::from_millis(50));
        watcher.start();

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            watcher.check();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_prevents_firing() {
        let (watcher, calls) = counting_watcher(Duration::from_millis(50));
        watcher.start();

        tokio::time::sleep(Duration::from_millis(20)).await;
        watcher.close();
        watcher.closed().await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!watcher.fired());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_closed_returns_for_unstarted_watcher() {
        let (watcher, calls) = counting_watcher(Duration::from_millis(50));
        watcher.close();

        tokio::time::timeout(Duration::from_millis(500), watcher.closed())
            .await
            .expect("closed() should return after close()");

        watcher.start();
        watcher.closed().await;
        assert!(!watcher.fired());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_never_fires() {
        let (watcher, calls) = counting_watcher(Duration::ZERO);
        watcher.start();
        watcher.closed().await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
