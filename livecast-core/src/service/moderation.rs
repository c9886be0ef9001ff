//! Escalating profanity moderation
//!
//! ```text
//! Clean ──violation──▶ Warned(1)
//! Warned(n) ──violation inside window──▶ Warned(n+1)
//! Warned(n) ──violation after window──▶ Warned(1)
//! Warned(n ≥ threshold) ──▶ TimedOut(until)
//! TimedOut ──until elapsed, on next access──▶ Clean
//! ```

use crate::models::WarningStatus;
use crate::service::rate_limit::retry_seconds;
use dashmap::DashMap;
use livecast_sfu::ConnectionId;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationState {
    Clean,
    Warned { count: u32, last_warning_at: Instant },
    TimedOut { until: Instant },
}

/// Outcome of recording a violation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Violation {
    /// Warning count after this violation
    pub warnings: u32,
    /// Set when this violation put the sender in timeout
    pub timed_out_for: Option<Duration>,
}

pub struct ModerationTracker {
    threshold: u32,
    warning_window: Duration,
    timeout: Duration,
    states: DashMap<ConnectionId, ModerationState>,
}

impl ModerationTracker {
    #[must_use]
    pub fn new(threshold: u32, warning_window: Duration, timeout: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            warning_window,
            timeout,
            states: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Current state, with an elapsed timeout or warning window already applied
    #[must_use]
    pub fn state(&self, connection_id: &ConnectionId) -> ModerationState {
        let now = Instant::now();
        let Some(mut state) = self.states.get_mut(connection_id) else {
            return ModerationState::Clean;
        };
        match *state {
            ModerationState::TimedOut { until } if now >= until => {
                *state = ModerationState::Clean;
            }
            ModerationState::Warned {
                last_warning_at, ..
            } if now.duration_since(last_warning_at) >= self.warning_window => {
                *state = ModerationState::Clean;
            }
            _ => {}
        }
        *state
    }

    /// Err with the remaining seconds while the connection is timed out
    pub fn check_timeout(&self, connection_id: &ConnectionId) -> Result<(), u64> {
        match self.state(connection_id) {
            ModerationState::TimedOut { until } => {
                Err(retry_seconds(until.saturating_duration_since(Instant::now())))
            }
            _ => Ok(()),
        }
    }

    /// Record one profanity violation and escalate if the threshold is reached
    pub fn record_violation(&self, connection_id: &ConnectionId) -> Violation {
        let now = Instant::now();
        let previous = self.state(connection_id);

        let warnings = match previous {
            ModerationState::Warned { count, .. } => count + 1,
            ModerationState::Clean => 1,
            // callers reject timed out senders before scanning, so this only
            // happens when a timeout is already in force
            ModerationState::TimedOut { until } => {
                return Violation {
                    warnings: self.threshold,
                    timed_out_for: Some(until.saturating_duration_since(now)),
                };
            }
        };

        let (next, timed_out_for) = if warnings >= self.threshold {
            (
                ModerationState::TimedOut {
                    until: now + self.timeout,
                },
                Some(self.timeout),
            )
        } else {
            (
                ModerationState::Warned {
                    count: warnings,
                    last_warning_at: now,
                },
                None,
            )
        };
        self.states.insert(connection_id.clone(), next);

        Violation {
            warnings,
            timed_out_for,
        }
    }

    #[must_use]
    pub fn status(&self, connection_id: &ConnectionId) -> WarningStatus {
        match self.state(connection_id) {
            ModerationState::Clean => WarningStatus {
                warnings: 0,
                is_timed_out: false,
                remaining_seconds: 0,
            },
            ModerationState::Warned { count, .. } => WarningStatus {
                warnings: count,
                is_timed_out: false,
                remaining_seconds: 0,
            },
            ModerationState::TimedOut { until } => WarningStatus {
                warnings: self.threshold,
                is_timed_out: true,
                remaining_seconds: retry_seconds(until.saturating_duration_since(Instant::now())),
            },
        }
    }

    pub fn clear(&self, connection_id: &ConnectionId) {
        self.states.remove(connection_id);
    }

    /// Forget states that have lapsed back to clean
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.states.len();
        self.states.retain(|_, state| match *state {
            ModerationState::Clean => false,
            ModerationState::Warned {
                last_warning_at, ..
            } => now.duration_since(last_warning_at) < self.warning_window,
            ModerationState::TimedOut { until } => now < until,
        });
        before.saturating_sub(self.states.len())
    }

    #[must_use]
    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}
