//! Cooldown timer bound to a silence epoch.
//!
//! One timer exists per turn-detection pass. It is the single point where
//! "may the assistant speak?" is answered, and the answer can be re-checked
//! at any granularity: once per utterance before the pre-reply, once per
//! sentence before TTS, once per emission before the egress write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use crate::detect::state_machine::TurnState;
use crate::turn::{Epoch, SilenceTracker, Turn};

/// Deep snapshot of the mutable conversation state at timer creation,
/// sufficient to roll the turn back if it is cancelled after commit.
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    /// Buffered turns at creation time.
    pub turns: Vec<Turn>,
    /// History length at creation time.
    pub history_len: usize,
}

/// Cooldown timer created by turn detection and carried by every
/// downstream artifact of the turn.
pub struct Timer {
    started: Instant,
    timeout: Duration,
    state: TurnState,
    bound_epoch: Epoch,
    silence: SilenceTracker,
    saved: ContextSnapshot,
    tick: Duration,
    fired: AtomicBool,
}

/// Extra poll iterations past the nominal timeout before giving up.
const GRACE_TICKS: u64 = 150;

impl Timer {
    /// Create a timer bound to the current silence epoch. The clock starts
    /// immediately.
    pub fn new(
        timeout_ms: u64,
        state: TurnState,
        silence: &SilenceTracker,
        saved: ContextSnapshot,
        tick_ms: u64,
    ) -> Self {
        Self::bound(
            timeout_ms,
            state,
            silence,
            silence.epoch(),
            Instant::now(),
            saved,
            tick_ms,
        )
    }

    /// Create a timer whose clock and epoch binding were captured earlier —
    /// turn detection binds both before the classifier round-trips, so a
    /// partial arriving mid-classification leaves the timer born dead.
    pub(crate) fn bound(
        timeout_ms: u64,
        state: TurnState,
        silence: &SilenceTracker,
        bound_epoch: Epoch,
        started: Instant,
        saved: ContextSnapshot,
        tick_ms: u64,
    ) -> Self {
        Self {
            started,
            timeout: Duration::from_millis(timeout_ms),
            state,
            bound_epoch,
            silence: silence.clone(),
            saved,
            tick: Duration::from_millis(tick_ms.max(1)),
            fired: AtomicBool::new(false),
        }
    }

    /// The FSM state this timer was created under.
    pub fn state(&self) -> TurnState {
        self.state
    }

    /// The silence epoch this timer is bound to.
    pub fn bound_epoch(&self) -> Epoch {
        self.bound_epoch
    }

    /// The context snapshot captured at creation.
    pub fn saved(&self) -> &ContextSnapshot {
        &self.saved
    }

    /// Synchronous point check: has the user stayed quiet since this timer
    /// was created? Once the bound epoch is superseded this returns `false`
    /// forever.
    pub fn assure_no_interruption(&self) -> bool {
        self.silence.epoch() == self.bound_epoch
    }

    /// Cooperatively wait for the cooldown to elapse.
    ///
    /// Polls every tick, checking both elapsed time and epoch validity.
    /// Returns `true` iff the timeout elapsed without the epoch changing.
    /// In the Silence state the assistant must not speak, so this returns
    /// `false` immediately; a zero timeout (AnswerOnce) passes on the first
    /// check.
    pub async fn wait_for_timeout(&self) -> bool {
        if self.fired.load(Ordering::Acquire) {
            return true;
        }
        if self.state == TurnState::Silence {
            return false;
        }

        let max_ticks =
            self.timeout.as_millis() as u64 / self.tick.as_millis().max(1) as u64 + GRACE_TICKS;
        for _ in 0..max_ticks {
            if !self.assure_no_interruption() {
                return false;
            }
            if self.started.elapsed() >= self.timeout {
                self.fired.store(true, Ordering::Release);
                return true;
            }
            tokio::time::sleep(self.tick).await;
        }

        warn!(
            timeout_ms = self.timeout.as_millis() as u64,
            "timer poll budget exhausted before timeout"
        );
        false
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("timeout", &self.timeout)
            .field("state", &self.state)
            .field("bound_epoch", &self.bound_epoch)
            .finish_non_exhaustive()
    }
}
