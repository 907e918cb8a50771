//! Periodic eviction of expired entries from a shared table.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace};

/// An entry that can expire.
pub trait Timeoutable: Send + Sync + 'static {
    /// Per-entry timeout. Zero defers to the monitor default.
    fn timeout(&self) -> Duration;

    /// Time of the entry's last activity.
    fn timestamp(&self) -> Instant;

    /// Invoked once when the monitor evicts the entry.
    fn raise_timeout(&self);
}

/// Sweeps a shared table on an interval and evicts entries whose last
/// activity is older than their effective timeout.
///
/// An entry with an effective timeout of zero never expires.
pub struct TimeoutMonitor<T: Timeoutable> {
    default_timeout: Duration,
    entries: Arc<DashMap<String, Arc<T>>>,
    interval: Duration,
    monitor_id: String,
    shutdown_token: Mutex<Option<CancellationToken>>,
    task_tracker: TaskTracker,
}

impl<T: Timeoutable> TimeoutMonitor<T> {
    /// Creates a monitor over `entries`. Nothing runs until [`start`](Self::start).
    #[must_use]
    pub fn new(
        entries: Arc<DashMap<String, Arc<T>>>,
        interval: Duration,
        default_timeout: Duration,
    ) -> Self {
        Self {
            default_timeout,
            entries,
            interval,
            monitor_id: uuid::Uuid::new_v4().to_string(),
            shutdown_token: Mutex::new(None),
            task_tracker: TaskTracker::new(),
        }
    }

    /// Sets the id used in log lines.
    #[must_use]
    pub fn with_id(mut self, monitor_id: impl Into<String>) -> Self {
        self.monitor_id = monitor_id.into();
        self
    }

    /// The monitor id.
    #[must_use]
    pub fn monitor_id(&self) -> &str {
        &self.monitor_id
    }

    /// The sweep interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the sweep loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shutdown_token.lock().is_some()
    }

    /// Starts the sweep loop. A zero interval disables the monitor; calling
    /// this while running has no effect.
    pub fn start(&self) {
        if self.interval.is_zero() {
            debug!("monitor[{}] disabled, interval is zero", self.monitor_id);
            return;
        }

        let mut slot = self.shutdown_token.lock();
        if slot.is_some() {
            return;
        }

        let token = CancellationToken::new();
        *slot = Some(token.clone());
        drop(slot);

        debug!(
            "monitor[{}] started, interval {:?}",
            self.monitor_id, self.interval
        );

        let entries = self.entries.clone();
        let default_timeout = self.default_timeout;
        let interval = self.interval;
        let monitor_id = self.monitor_id.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                sweep_entries(&entries, default_timeout, &monitor_id);
            }

            trace!("monitor[{}] loop exited", monitor_id);
        });
    }

    /// Stops the sweep loop and waits for it to exit. Idempotent.
    pub async fn stop(&self) {
        let Some(token) = self.shutdown_token.lock().take() else {
            return;
        };

        token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        self.task_tracker.reopen();

        debug!("monitor[{}] stopped", self.monitor_id);
    }

    /// Runs one sweep immediately and returns the evicted keys.
    pub fn sweep(&self) -> Vec<String> {
        sweep_entries(&self.entries, self.default_timeout, &self.monitor_id)
    }
}

impl<T: Timeoutable> Drop for TimeoutMonitor<T> {
    fn drop(&mut self) {
        if let Some(token) = self.shutdown_token.lock().take() {
            token.cancel();
        }
    }
}

fn effective_timeout(timeout: Duration, default_timeout: Duration) -> Duration {
    if timeout.is_zero() {
        default_timeout
    } else {
        timeout
    }
}

fn is_expired<T: Timeoutable>(entry: &T, default_timeout: Duration, now: Instant) -> bool {
    let timeout = effective_timeout(entry.timeout(), default_timeout);
    !timeout.is_zero() && now.saturating_duration_since(entry.timestamp()) > timeout
}

fn sweep_entries<T: Timeoutable>(
    entries: &DashMap<String, Arc<T>>,
    default_timeout: Duration,
    monitor_id: &str,
) -> Vec<String> {
    if entries.is_empty() {
        return Vec::new();
    }

    let now = Instant::now();
    let keys: Vec<String> = entries.iter().map(|entry| entry.key().clone()).collect();
    let mut evicted = Vec::new();

    trace!("monitor[{}] sweeping {} entries", monitor_id, keys.len());

    for key in keys {
        let Some((key, entry)) =
            entries.remove_if(&key, |_, entry| is_expired(entry.as_ref(), default_timeout, now))
        else {
            continue;
        };

        debug!("monitor[{}] entry {} timed out", monitor_id, key);

        if std::panic::catch_unwind(AssertUnwindSafe(|| entry.raise_timeout())).is_err() {
            error!(
                "monitor[{}] timeout callback for {} panicked",
                monitor_id, key
            );
        }

        evicted.push(key);
    }

    evicted
}
