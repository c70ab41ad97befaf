//! Convergence primitives.
//!
//! Helpers shared by the device agent's control loops:
//!
//! - **Crash-loop tracking**: deciding whether a supervised process that
//!   exited unexpectedly should be restarted, or left down because it keeps
//!   dying within a short window.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same sequence of exit instants
//! - The consecutive-exit counter only grows while exits stay within the window

use std::time::{Duration, Instant};

use thiserror::Error;

/// Policy validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// A ceiling of zero would never allow a restart.
    #[error("max restarts must be at least 1")]
    ZeroCeiling,

    /// A zero window can never detect two exits as consecutive.
    #[error("crash window must be non-zero")]
    ZeroWindow,
}

/// Crash-loop policy for a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashLoopPolicy {
    /// Consecutive-exit count at which automatic restarts stop.
    pub max_restarts: u32,

    /// Two exits closer together than this are consecutive.
    pub window: Duration,

    /// Delay before an automatic restart.
    pub restart_delay: Duration,
}

impl CrashLoopPolicy {
    /// Build a validated policy.
    pub fn new(
        max_restarts: u32,
        window: Duration,
        restart_delay: Duration,
    ) -> Result<Self, PolicyError> {
        if max_restarts == 0 {
            return Err(PolicyError::ZeroCeiling);
        }
        if window.is_zero() {
            return Err(PolicyError::ZeroWindow);
        }
        Ok(Self {
            max_restarts,
            window,
            restart_delay,
        })
    }
}

impl Default for CrashLoopPolicy {
    fn default() -> Self {
        Self {
            max_restarts: DEFAULT_MAX_CRASH_RESTARTS,
            window: DEFAULT_CRASH_WINDOW,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

/// Outcome of recording an unexpected exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart after `delay`. `consecutive` is the counter after this exit.
    Restart { delay: Duration, consecutive: u32 },

    /// The ceiling was reached; leave the process down.
    GiveUp { consecutive: u32 },
}

/// Tracks consecutive unexpected exits of one process.
#[derive(Debug, Clone)]
pub struct CrashLoopTracker {
    policy: CrashLoopPolicy,

    /// Exits seen within the window of their predecessor.
    consecutive: u32,

    /// When the previous unexpected exit happened.
    last_exit: Option<Instant>,
}

impl CrashLoopTracker {
    /// Create a tracker with no recorded exits.
    pub fn new(policy: CrashLoopPolicy) -> Self {
        Self {
            policy,
            consecutive: 0,
            last_exit: None,
        }
    }

    /// Record an unexpected exit observed at `now`.
    ///
    /// An exit within the window of the previous one increments the counter,
    /// any other exit resets it to zero. Restarts continue while the counter
    /// stays below the ceiling.
    pub fn record_exit(&mut self, now: Instant) -> RestartDecision {
        let within_window = self
            .last_exit
            .map(|last| now.saturating_duration_since(last) < self.policy.window)
            .unwrap_or(false);

        self.consecutive = if within_window {
            self.consecutive.saturating_add(1)
        } else {
            0
        };
        self.last_exit = Some(now);

        if self.consecutive < self.policy.max_restarts {
            RestartDecision::Restart {
                delay: self.policy.restart_delay,
                consecutive: self.consecutive,
            }
        } else {
            RestartDecision::GiveUp {
                consecutive: self.consecutive,
            }
        }
    }

    /// Current consecutive-exit count.
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Default consecutive-exit ceiling.
pub const DEFAULT_MAX_CRASH_RESTARTS: u32 = 5;

/// Default window for treating exits as consecutive.
pub const DEFAULT_CRASH_WINDOW: Duration = Duration::from_secs(5);

/// Default delay before an automatic restart.
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(1);
