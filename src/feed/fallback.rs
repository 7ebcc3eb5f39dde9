//! Push-versus-pull arbitration for one topic.
//!
//! The controller is a pure state machine driven by the topic pipeline: it
//! never sleeps or spawns on its own, it only reports the next deadline and
//! which pulls to issue. Pull results are tagged with a generation so that a
//! result landing after fail-back is recognised as stale.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackConfig {
    pub arm_timeout: Duration,
    pub poll_interval: Duration,
    pub failure_window: u32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            arm_timeout: Duration::from_millis(2_000),
            poll_interval: Duration::from_millis(20_000),
            failure_window: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Armed { deadline: Instant },
    Polling { next_pull: Instant },
    Standby,
}

/// A pull the pipeline must issue now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullTicket {
    pub generation: u64,
    pub attempt: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullVerdict {
    /// Issued before the push channel recovered; drop it.
    Stale,
    Accepted,
    Failed { consecutive: u32, escalate: bool },
}

#[derive(Debug)]
pub struct FallbackController {
    config: FallbackConfig,
    phase: Phase,
    generation: u64,
    attempts: u64,
    consecutive_failures: u32,
    escalated: bool,
}

impl FallbackController {
    pub fn new(config: FallbackConfig) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            generation: 0,
            attempts: 0,
            consecutive_failures: 0,
            escalated: false,
        }
    }

    pub fn arm(&mut self, now: Instant) {
        self.phase = Phase::Armed {
            deadline: now + self.config.arm_timeout,
        };
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, Phase::Polling { .. })
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Armed { deadline } => Some(deadline),
            Phase::Polling { next_pull } => Some(next_pull),
            Phase::Idle | Phase::Standby => None,
        }
    }

    /// Returns a pull to issue when the current deadline has passed.
    pub fn on_deadline(&mut self, now: Instant) -> Option<PullTicket> {
        match self.phase {
            Phase::Armed { deadline } if now >= deadline => {
                self.phase = Phase::Polling {
                    next_pull: now + self.config.poll_interval,
                };
                Some(self.issue())
            }
            Phase::Polling { next_pull } if now >= next_pull => {
                self.phase = Phase::Polling {
                    next_pull: next_pull + self.config.poll_interval,
                };
                Some(self.issue())
            }
            _ => None,
        }
    }

    /// The push channel proved itself. Returns `true` when a fallback was
    /// running, meaning downstream state must be re-baselined.
    pub fn on_live(&mut self) -> bool {
        let was_polling = self.is_active();
        self.phase = Phase::Standby;
        self.generation = self.generation.wrapping_add(1);
        self.consecutive_failures = 0;
        self.escalated = false;
        was_polling
    }

    /// The push channel went quiet again after having been live.
    pub fn on_dead(&mut self, now: Instant) {
        if self.phase == Phase::Standby {
            self.arm(now);
        }
    }

    pub fn on_pull_result(&mut self, ticket: PullTicket, succeeded: bool) -> PullVerdict {
        if ticket.generation != self.generation || !self.is_active() {
            return PullVerdict::Stale;
        }
        if succeeded {
            self.consecutive_failures = 0;
            self.escalated = false;
            return PullVerdict::Accepted;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let escalate =
            !self.escalated && self.consecutive_failures >= self.config.failure_window.max(1);
        if escalate {
            self.escalated = true;
        }
        PullVerdict::Failed {
            consecutive: self.consecutive_failures,
            escalate,
        }
    }

    fn issue(&mut self) -> PullTicket {
        self.attempts = self.attempts.saturating_add(1);
        PullTicket {
            generation: self.generation,
            attempt: self.attempts,
        }
    }
}
