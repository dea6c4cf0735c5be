//! Debounced condition watcher.
//!
//! A `SettleDetector` is owned by an event loop. Activity calls [`touch`],
//! pushing the deadline a full window out. When the deadline passes the loop
//! calls [`check`] with the current condition. The detector fires only when
//! the condition holds at both ends of a quiet window: a condition seen
//! false at the previous deadline, or reported false through [`observe`]
//! since the last touch, has to hold for one more full window.
//!
//! [`touch`]: SettleDetector::touch
//! [`check`]: SettleDetector::check
//! [`observe`]: SettleDetector::observe

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettleState {
    Idle,
    /// `held` is whether the condition held when this window started
    Armed { at: Instant, held: bool },
    Cancelled,
}

#[derive(Debug)]
pub struct SettleDetector {
    window: Duration,
    state: SettleState,
}

impl SettleDetector {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: SettleState::Idle,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record activity: (re)arm for a full window from now.
    ///
    /// The window counts as starting with the condition satisfied unless
    /// [`observe`](Self::observe) says otherwise.
    pub fn touch(&mut self) {
        if self.state != SettleState::Cancelled {
            self.arm(true);
        }
    }

    /// Push the deadline out only if already armed.
    pub fn postpone(&mut self) {
        if let SettleState::Armed { held, .. } = self.state {
            self.arm(held);
        }
    }

    /// Report the condition as it stands now. An unsatisfied report makes
    /// the current window start over as unsatisfied.
    pub fn observe(&mut self, satisfied: bool) {
        if let SettleState::Armed { held, .. } = &mut self.state {
            *held &= satisfied;
        }
    }

    /// Instant the owning loop should wake up at, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            SettleState::Armed { at, .. } => Some(at),
            _ => None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.deadline().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == SettleState::Cancelled
    }

    /// Evaluate the condition once the deadline has elapsed.
    ///
    /// Returns `true` exactly when the detector fires; it is then idle until
    /// touched again. Calls before the deadline, or while idle or cancelled,
    /// never fire.
    pub fn check<F: FnOnce() -> bool>(&mut self, condition: F) -> bool {
        let SettleState::Armed { at, held } = self.state else {
            return false;
        };
        if Instant::now() < at {
            return false;
        }
        match (condition(), held) {
            (true, true) => {
                self.state = SettleState::Idle;
                true
            }
            (satisfied, _) => {
                self.arm(satisfied);
                false
            }
        }
    }

    /// Disarm for good. A cancelled detector never fires.
    pub fn cancel(&mut self) {
        self.state = SettleState::Cancelled;
    }

    fn arm(&mut self, held: bool) {
        self.state = SettleState::Armed {
            at: Instant::now() + self.window,
            held,
        };
    }
}

/// Sleep until `deadline`, or forever when there is none.
///
/// Meant as a `tokio::select!` branch next to the loop's other inputs.
pub async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
