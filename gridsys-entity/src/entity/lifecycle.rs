// Layer 1: Standard library imports
use std::time::Duration;

// Layer 2: Third-party crate imports
use rand::Rng;
use tokio_util::sync::CancellationToken;

// Layer 3: Internal module imports
// (none)

/// Entity lifecycle status, tracked by the owning shard per child.
///
/// ```text
/// Starting --(on_initialize ok)--> Running <--> Suspended
///     |                               |
///     v (on_initialize err)           v
///   (die)                          Stopping --> (die)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    /// Restoring and initializing; messages buffer.
    Starting,
    /// Accepting messages.
    Running,
    /// Delivery gated for a bulk operation; messages buffer.
    Suspended,
    /// Shutdown underway; messages buffer and may be dropped.
    Stopping,
}

impl EntityStatus {
    /// Whether an envelope should be delivered now rather than buffered.
    ///
    /// Reply-like messages punch through `Starting` and `Stopping`;
    /// `Suspended` buffers everything.
    pub fn accepts(&self, reply_like: bool) -> bool {
        match self {
            EntityStatus::Running => true,
            EntityStatus::Starting | EntityStatus::Stopping => reply_like,
            EntityStatus::Suspended => false,
        }
    }
}

/// How an entity's task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Ordinary shutdown (requested, auto-shutdown, or shard drain).
    Shutdown,
    /// Restore or `on_initialize` failed; the entity never ran.
    InitializeFailed {
        /// Failure description.
        message: String,
    },
    /// A handler failed with a non-refusal error.
    UnexpectedError {
        /// Failure description.
        message: String,
    },
    /// The entity task panicked.
    Panicked {
        /// Unwrapped panic message.
        message: String,
    },
}

impl TerminationReason {
    /// Expected terminations are accounted silently; everything else is
    /// logged as a crash by the supervising shard.
    pub fn is_expected(&self) -> bool {
        matches!(self, TerminationReason::Shutdown)
    }

    /// Short description for logs and buffered-ask failures.
    pub fn message(&self) -> &str {
        match self {
            TerminationReason::Shutdown => "shutdown",
            TerminationReason::InitializeFailed { message }
            | TerminationReason::UnexpectedError { message }
            | TerminationReason::Panicked { message } => message,
        }
    }
}

/// Idle-shutdown policy of an entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoShutdownPolicy {
    /// Stay resident until shut down explicitly.
    Never,
    /// Shut down after a jittered idle period with no subscribers.
    NoSubscribersAfter {
        /// Wait after the last subscriber is lost.
        linger: Duration,
        /// Wait after spawn before the first check.
        initial: Duration,
    },
}

/// Which wait is being armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitKind {
    /// First wait after spawn.
    Initial,
    /// Wait after losing the last subscriber.
    Linger,
}

/// Smoothing jitter spreading de-synchronized shutdowns: a uniformly random
/// extension of up to half the base wait, so the observed delay lies in
/// `[base, 1.5 * base)`.
pub(crate) fn smoothed_wait(base: Duration, rng: &mut impl Rng) -> Duration {
    base + base.mul_f64(0.5 * rng.gen::<f64>())
}

/// Runtime state of the auto-shutdown policy for one entity.
#[derive(Debug)]
pub(crate) struct AutoShutdownState {
    policy: AutoShutdownPolicy,
    /// Token of the armed timer, if any. A fired timer keeps its token here
    /// so reconciliation does not re-arm until a subscriber transition
    /// resets it.
    armed: Option<CancellationToken>,
}

impl AutoShutdownState {
    pub fn new(policy: AutoShutdownPolicy) -> Self {
        Self { policy, armed: None }
    }

    /// Whether the policy ever shuts down.
    pub fn enabled(&self) -> bool {
        !matches!(self.policy, AutoShutdownPolicy::Never)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Compute the jittered wait for `kind` and mark the given token armed.
    /// Returns `None` for [`AutoShutdownPolicy::Never`].
    pub fn arm(&mut self, kind: WaitKind, token: CancellationToken, rng: &mut impl Rng) -> Option<Duration> {
        let AutoShutdownPolicy::NoSubscribersAfter { linger, initial } = self.policy else {
            return None;
        };
        let base = match kind {
            WaitKind::Initial => initial,
            WaitKind::Linger => linger,
        };
        self.armed = Some(token);
        Some(smoothed_wait(base, rng))
    }

    /// Cancel the armed timer, if any (a subscriber appeared).
    pub fn cancel(&mut self) {
        if let Some(token) = self.armed.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn test_status_gating() {
        assert!(EntityStatus::Running.accepts(false));
        assert!(EntityStatus::Running.accepts(true));
        assert!(!EntityStatus::Starting.accepts(false));
        assert!(EntityStatus::Starting.accepts(true));
        assert!(!EntityStatus::Suspended.accepts(true));
        assert!(!EntityStatus::Stopping.accepts(false));
        assert!(EntityStatus::Stopping.accepts(true));
    }

    #[test]
    fn test_smoothed_wait_stays_in_half_open_band() {
        let mut rng = SmallRng::seed_from_u64(7);
        let base = Duration::from_secs(60);
        for _ in 0..1000 {
            let wait = smoothed_wait(base, &mut rng);
            assert!(wait >= base, "wait {wait:?} below base");
            assert!(wait < base.mul_f64(1.5), "wait {wait:?} above 1.5x base");
        }
    }

    #[test]
    fn test_smoothed_wait_actually_spreads() {
        let mut rng = SmallRng::seed_from_u64(42);
        let base = Duration::from_secs(60);
        let samples: Vec<Duration> = (0..100).map(|_| smoothed_wait(base, &mut rng)).collect();
        let min = samples.iter().min().copied().unwrap_or(base);
        let max = samples.iter().max().copied().unwrap_or(base);
        // 100 draws across a 30s band should cover a good part of it.
        assert!(max - min > Duration::from_secs(20), "spread {:?} too narrow", max - min);
    }

    #[test]
    fn test_arm_and_cancel() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut state = AutoShutdownState::new(AutoShutdownPolicy::NoSubscribersAfter {
            linger: Duration::from_secs(60),
            initial: Duration::from_secs(30),
        });
        assert!(state.enabled());
        assert!(!state.is_armed());

        let token = CancellationToken::new();
        let wait = state.arm(WaitKind::Initial, token.clone(), &mut rng).unwrap();
        assert!(wait >= Duration::from_secs(30) && wait < Duration::from_secs(45));
        assert!(state.is_armed());

        state.cancel();
        assert!(token.is_cancelled());
        assert!(!state.is_armed());
    }

    #[test]
    fn test_never_policy_arms_nothing() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut state = AutoShutdownState::new(AutoShutdownPolicy::Never);
        assert!(!state.enabled());
        assert!(state.arm(WaitKind::Linger, CancellationToken::new(), &mut rng).is_none());
    }

    #[test]
    fn test_linger_wait_band() {
        let mut rng = SmallRng::seed_from_u64(3);
        let mut state = AutoShutdownState::new(AutoShutdownPolicy::NoSubscribersAfter {
            linger: Duration::from_secs(60),
            initial: Duration::from_secs(30),
        });
        for _ in 0..200 {
            let wait = state.arm(WaitKind::Linger, CancellationToken::new(), &mut rng).unwrap();
            assert!(wait >= Duration::from_secs(60) && wait < Duration::from_secs(90));
        }
    }
}
