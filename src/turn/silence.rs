//! Silence window tracking with epoch-based invalidation.
//!
//! A silence window opens every time the STT stream finalizes and closes as
//! soon as new user audio arrives. Each window carries an [`Epoch`] token;
//! downstream work (timers, pre-replies, TTS jobs) binds the epoch it was
//! computed under and is dropped the moment the live epoch moves past it.
//! There are no cancellation tokens handed downstream — the epoch comparison
//! is the only cancellation signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Opaque token identifying one silence window.
///
/// Minted from a process-wide monotonic counter, so any new user audio
/// strictly increases the live epoch and every stale token compares unequal
/// forever after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Epoch(u64);

impl Epoch {
    /// Raw counter value, for logging.
    pub fn value(self) -> u64 {
        self.0
    }
}

struct Shared {
    epoch: AtomicU64,
    silence_ms: AtomicU64,
    auto_grow: AtomicBool,
    /// True while STT is producing audio (between the first partial of a
    /// burst and the next finalization).
    speaking: AtomicBool,
}

/// Tracks the current silence window and mints epochs.
///
/// Cheap to clone; all clones observe the same window.
#[derive(Clone)]
pub struct SilenceTracker {
    shared: Arc<Shared>,
    tick: Duration,
}

impl SilenceTracker {
    /// Create a tracker with the given auto-grow update interval.
    pub fn new(tick_ms: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                epoch: AtomicU64::new(0),
                silence_ms: AtomicU64::new(0),
                auto_grow: AtomicBool::new(false),
                speaking: AtomicBool::new(false),
            }),
            tick: Duration::from_millis(tick_ms.max(1)),
        }
    }

    /// The live epoch.
    pub fn epoch(&self) -> Epoch {
        Epoch(self.shared.epoch.load(Ordering::SeqCst))
    }

    /// Milliseconds since the last STT finalization (zero while speaking).
    pub fn silence_ms(&self) -> u64 {
        self.shared.silence_ms.load(Ordering::SeqCst)
    }

    /// Whether the auto-grow task is currently counting.
    pub fn is_growing(&self) -> bool {
        self.shared.auto_grow.load(Ordering::SeqCst)
    }

    /// Record a partial transcript: close the current silence window.
    ///
    /// The first partial of a burst mints a new epoch (invalidating every
    /// timer bound to the old one) and returns the silence duration observed
    /// at that moment — the actual speaking gap, fed back into the latest
    /// turn judgement. Subsequent partials in the same burst return `None`.
    pub fn on_partial(&self) -> Option<u64> {
        if self
            .shared
            .speaking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        let gap = self.shared.silence_ms.swap(0, Ordering::SeqCst);
        self.shared.auto_grow.store(false, Ordering::SeqCst);
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(epoch, gap_ms = gap, "silence window closed by partial");
        Some(gap)
    }

    /// Open a fresh silence window, seeded with `seed_ms` already elapsed.
    ///
    /// Called on every STT finalization. Mints a new epoch and starts the
    /// auto-grow task, which counts wall time from the seed until the window
    /// closes again.
    pub fn restart(&self, seed_ms: u64) -> Epoch {
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.speaking.store(false, Ordering::SeqCst);
        self.shared.silence_ms.store(seed_ms, Ordering::SeqCst);
        self.shared.auto_grow.store(true, Ordering::SeqCst);
        debug!(epoch, seed_ms, "silence window opened");

        let shared = Arc::clone(&self.shared);
        let tick = self.tick;
        tokio::spawn(async move {
            let started = Instant::now();
            loop {
                tokio::time::sleep(tick).await;
                if !shared.auto_grow.load(Ordering::SeqCst)
                    || shared.epoch.load(Ordering::SeqCst) != epoch
                {
                    break;
                }
                let elapsed = seed_ms + started.elapsed().as_millis() as u64;
                shared.silence_ms.store(elapsed, Ordering::SeqCst);
            }
        });
        Epoch(epoch)
    }

    /// Idempotent variant of [`restart`](Self::restart) used by the
    /// peer-reported silence event: a no-op when a window is already open.
    pub fn begin_silence(&self, seed_ms: u64) -> bool {
        if self.shared.auto_grow.load(Ordering::SeqCst) {
            return false;
        }
        self.restart(seed_ms);
        true
    }

    /// Stop the auto-grow task and zero the counter without minting an
    /// epoch. Used when the FSM enters the Silence state: the assistant
    /// must not answer, but already-dead timers stay dead for the same
    /// reason they always do.
    pub fn halt_growth(&self) {
        self.shared.auto_grow.store(false, Ordering::SeqCst);
        self.shared.silence_ms.store(0, Ordering::SeqCst);
    }

    /// Hard invalidation (INTERRUPT control message): mint a new epoch and
    /// reset the window entirely.
    pub fn interrupt(&self) -> Epoch {
        self.shared.auto_grow.store(false, Ordering::SeqCst);
        self.shared.speaking.store(false, Ordering::SeqCst);
        self.shared.silence_ms.store(0, Ordering::SeqCst);
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(epoch, "silence window invalidated");
        Epoch(epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Epoch minting ─────────────────────────────────────────

    #[tokio::test]
    async fn partial_strictly_increases_epoch() {
        let tracker = SilenceTracker::new(3);
        let mut last = tracker.epoch();
        for _ in 0..5 {
            tracker.restart(0);
            let opened = tracker.epoch();
            assert!(opened.value() > last.value());
            tracker.on_partial();
            let closed = tracker.epoch();
            assert!(closed.value() > opened.value());
            last = closed;
        }
    }

    #[tokio::test]
    async fn only_first_partial_of_burst_mints() {
        let tracker = SilenceTracker::new(3);
        tracker.restart(0);
        assert!(tracker.on_partial().is_some());
        let after_first = tracker.epoch();
        assert!(tracker.on_partial().is_none());
        assert!(tracker.on_partial().is_none());
        assert_eq!(tracker.epoch(), after_first);
    }

    #[tokio::test]
    async fn restart_invalidates_previous_window() {
        let tracker = SilenceTracker::new(3);
        let first = tracker.restart(0);
        let second = tracker.restart(0);
        assert_ne!(first, second);
        assert_eq!(tracker.epoch(), second);
    }

    // ── Auto-grow ─────────────────────────────────────────────

    #[tokio::test]
    async fn auto_grow_counts_wall_time() {
        let tracker = SilenceTracker::new(1);
        tracker.restart(0);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(tracker.silence_ms() >= 20, "counter should have advanced");
    }

    #[tokio::test]
    async fn seed_offsets_the_counter() {
        let tracker = SilenceTracker::new(1);
        tracker.begin_silence(500);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(tracker.silence_ms() >= 500);
    }

    #[tokio::test]
    async fn begin_silence_is_idempotent() {
        let tracker = SilenceTracker::new(3);
        assert!(tracker.begin_silence(0));
        let epoch = tracker.epoch();
        assert!(!tracker.begin_silence(0));
        assert_eq!(tracker.epoch(), epoch);
    }

    #[tokio::test]
    async fn partial_zeroes_counter_and_returns_gap() {
        let tracker = SilenceTracker::new(1);
        tracker.restart(0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let gap = tracker.on_partial().expect("first partial mints");
        assert!(gap > 0, "gap should reflect elapsed silence");
        assert_eq!(tracker.silence_ms(), 0);
        assert!(!tracker.is_growing());
    }

    #[tokio::test]
    async fn stale_grower_stops_after_new_window() {
        let tracker = SilenceTracker::new(1);
        tracker.restart(0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // A fresh window resets the counter; the stale grower must not
        // keep writing its larger elapsed values.
        tracker.restart(0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(tracker.silence_ms() < 40);
    }

    #[tokio::test]
    async fn interrupt_mints_and_resets() {
        let tracker = SilenceTracker::new(3);
        let opened = tracker.restart(0);
        let interrupted = tracker.interrupt();
        assert!(interrupted.value() > opened.value());
        assert_eq!(tracker.silence_ms(), 0);
        assert!(!tracker.is_growing());
    }

    #[tokio::test]
    async fn halt_growth_keeps_epoch() {
        let tracker = SilenceTracker::new(3);
        let epoch = tracker.restart(0);
        tracker.halt_growth();
        assert_eq!(tracker.epoch(), epoch);
        assert!(!tracker.is_growing());
        assert_eq!(tracker.silence_ms(), 0);
    }
}
