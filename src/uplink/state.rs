//! Connection state machine shared by the two uplink tiers.
//!
//! Both the broker-reachability tier and the MQTT session tier follow the same
//! rule: up to a fixed budget of connect attempts with a fixed backoff between
//! them, then a long-cooldown circuit breaker. The machine is pure; the uplink
//! task supplies the clock and performs the actual connects.

use std::time::{Duration, Instant};

/// Where a connection tier currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    /// Attempting to connect; `attempts` counts consecutive failures so far.
    Connecting { attempts: u8 },
    Connected,
    /// Circuit broken until the deadline; no attempts are made before it.
    GivenUp { until: Instant },
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Wait this long, then try again.
    Retry(Duration),
    /// Budget exhausted; the machine entered `GivenUp`.
    GaveUp,
}

/// Fixed retry schedule for one tier.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before giving up.
    pub budget: u8,
    /// Wait between attempts.
    pub backoff: Duration,
    /// How long a broken circuit stays open.
    pub cooldown: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_BUDGET: u8 = 10;

    pub fn new(backoff: Duration, cooldown: Duration) -> Self {
        Self {
            budget: Self::DEFAULT_BUDGET,
            backoff,
            cooldown,
        }
    }
}

/// One connection tier: current state plus its retry schedule.
#[derive(Debug)]
pub struct ConnMachine {
    name: &'static str,
    state: ConnState,
    policy: RetryPolicy,
}

impl ConnMachine {
    pub fn new(name: &'static str, policy: RetryPolicy) -> Self {
        Self {
            name,
            state: ConnState::Disconnected,
            policy,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnState::Connected
    }

    pub fn is_given_up(&self) -> bool {
        matches!(self.state, ConnState::GivenUp { .. })
    }

    /// An attempt succeeded. Clears the failure count wherever it stood.
    pub fn connected(&mut self) {
        self.state = ConnState::Connected;
    }

    /// An attempt failed. Either schedules a retry or breaks the circuit once
    /// the budget is exhausted.
    pub fn attempt_failed(&mut self, now: Instant) -> FailureOutcome {
        let attempts = match self.state {
            ConnState::Connecting { attempts } => attempts + 1,
            _ => 1,
        };
        if attempts >= self.policy.budget {
            self.state = ConnState::GivenUp {
                until: now + self.policy.cooldown,
            };
            FailureOutcome::GaveUp
        } else {
            self.state = ConnState::Connecting { attempts };
            FailureOutcome::Retry(self.policy.backoff)
        }
    }

    /// An established connection dropped; the next attempt starts a fresh
    /// failure count.
    pub fn connection_lost(&mut self) {
        self.state = ConnState::Connecting { attempts: 0 };
    }

    /// Check the circuit-breaker deadline. Once it has passed the machine
    /// re-enters `Connecting` and attempts resume. Returns true on re-entry.
    pub fn cooldown_over(&mut self, now: Instant) -> bool {
        if let ConnState::GivenUp { until } = self.state {
            if now >= until {
                self.state = ConnState::Connecting { attempts: 0 };
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(3600))
    }

    #[test]
    fn gives_up_after_budget_exhausted() {
        let mut m = ConnMachine::new("link", policy());
        let now = Instant::now();
        for i in 1..RetryPolicy::DEFAULT_BUDGET {
            assert_eq!(
                m.attempt_failed(now),
                FailureOutcome::Retry(Duration::from_millis(500)),
                "attempt {} should retry",
                i
            );
        }
        assert_eq!(m.attempt_failed(now), FailureOutcome::GaveUp);
        assert!(m.is_given_up());
    }

    #[test]
    fn no_reentry_before_cooldown_deadline() {
        let mut m = ConnMachine::new("session", policy());
        let now = Instant::now();
        for _ in 0..RetryPolicy::DEFAULT_BUDGET {
            m.attempt_failed(now);
        }
        assert!(!m.cooldown_over(now + Duration::from_secs(1800)));
        assert!(m.is_given_up());
        assert!(m.cooldown_over(now + Duration::from_secs(3600)));
        assert_eq!(m.state(), ConnState::Connecting { attempts: 0 });
    }

    #[test]
    fn success_resets_failure_count() {
        let mut m = ConnMachine::new("session", policy());
        let now = Instant::now();
        for _ in 0..9 {
            m.attempt_failed(now);
        }
        m.connected();
        assert!(m.is_connected());

        // After a drop, the budget starts over: nine old failures are gone.
        m.connection_lost();
        assert_eq!(
            m.attempt_failed(now),
            FailureOutcome::Retry(Duration::from_millis(500))
        );
        assert_eq!(m.state(), ConnState::Connecting { attempts: 1 });
    }

    #[test]
    fn lost_connection_reenters_connecting() {
        let mut m = ConnMachine::new("link", policy());
        m.connected();
        m.connection_lost();
        assert_eq!(m.state(), ConnState::Connecting { attempts: 0 });
    }
}
