use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::time::Instant;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Tracks `lastActivityAt` for one session.
///
/// Every input or output event calls [`touch`](Self::touch). The tracker keeps
/// two clocks: a wall-clock timestamp that is persisted with the session
/// record, and a monotonic instant used to wait for inactivity.
///
/// Each activity event increments a monotonic generation counter.
#[derive(Clone)]
pub struct ActivityTracker {
    tx: Arc<watch::Sender<Instant>>,
    wall_ms: Arc<AtomicU64>,
    generation: Arc<AtomicU64>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    /// Create a new tracker seeded with the current time.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Instant::now());
        Self {
            tx: Arc::new(tx),
            wall_ms: Arc::new(AtomicU64::new(now_ms())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record activity. Safe to call from blocking threads.
    pub fn touch(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        self.wall_ms.store(now_ms(), Ordering::Release);
        self.tx.send_replace(Instant::now());
    }

    /// Current generation counter value.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Wall-clock time of the last activity, in epoch milliseconds.
    pub fn last_activity_at(&self) -> u64 {
        self.wall_ms.load(Ordering::Acquire)
    }

    /// Return how long it has been since the last activity.
    pub fn idle_for(&self) -> Duration {
        self.tx.borrow().elapsed()
    }

    /// Wait until `timeout` has elapsed since the last activity.
    ///
    /// Returns the generation counter at the time idle was detected. Returns
    /// immediately when the session is already idle for longer than `timeout`.
    pub async fn wait_for_idle(&self, timeout: Duration) -> u64 {
        let mut rx = self.tx.subscribe();

        loop {
            let last = *rx.borrow_and_update();
            let elapsed = last.elapsed();
            if elapsed >= timeout {
                return self.generation.load(Ordering::Acquire);
            }
            let remaining = timeout - elapsed;
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {
                    // A touch may have landed between the sleep completing
                    // and this branch running.
                    let last = *rx.borrow_and_update();
                    if last.elapsed() >= timeout {
                        return self.generation.load(Ordering::Acquire);
                    }
                }
                res = rx.changed() => {
                    if res.is_err() {
                        return self.generation.load(Ordering::Acquire);
                    }
                }
            }
        }
    }
}
