//! Resilience Layer
//!
//! One consolidated set of reconnection policies: exponential backoff, a
//! circuit breaker, and session continuity for the relayed connection. All
//! parameters come from [`crate::config`]; nothing here reads the clock,
//! every decision takes `now` explicitly.

use core::time::Duration;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::config::{BackoffPolicy, CircuitBreakerConfig, SessionContinuityConfig};
use crate::routing::RelayHealth;
use crate::types::{RoomId, Timestamp};

// ----------------------------------------------------------------------------
// Backoff
// ----------------------------------------------------------------------------

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero-based), capped
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = self.base.as_millis() as f64 * factor;
        let cap = self.cap.as_millis() as f64;
        Duration::from_millis(millis.min(cap).max(0.0) as u64)
    }

    /// Delay for `attempt` if it is still within the retry budget
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then(|| self.delay(attempt))
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

// ----------------------------------------------------------------------------
// Circuit Breaker
// ----------------------------------------------------------------------------

/// Breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    /// Attempts allowed
    Closed,
    /// Attempts refused until the cooldown ends
    Open { until: Timestamp },
    /// One trial attempt allowed
    HalfOpen,
}

/// Stops reconnection attempts after repeated failures
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: BreakerState,
    failures: VecDeque<Timestamp>,
    cooldown: Duration,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let cooldown = config.cooldown;
        Self {
            config,
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            cooldown,
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Cooldown the next trip will use
    pub fn current_cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Whether an attempt may start now; moves open to half-open once the
    /// cooldown has elapsed
    pub fn allow_attempt(&mut self, now: Timestamp) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open { until } => {
                if now >= until {
                    debug!("Circuit breaker half-open");
                    self.state = BreakerState::HalfOpen;
                    self.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Time until the breaker lets a trial through
    pub fn retry_in(&self, now: Timestamp) -> Duration {
        match self.state {
            BreakerState::Open { until } => until - now,
            _ => Duration::ZERO,
        }
    }

    pub fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            debug!("Circuit breaker closed");
        }
        self.state = BreakerState::Closed;
        self.failures.clear();
        self.cooldown = self.config.cooldown;
        self.trial_in_flight = false;
    }

    pub fn record_failure(&mut self, now: Timestamp) {
        match self.state {
            BreakerState::HalfOpen => {
                self.cooldown = (self.cooldown * 2).min(self.config.max_cooldown);
                self.trial_in_flight = false;
                self.state = BreakerState::Open {
                    until: now + self.cooldown,
                };
                warn!("Circuit breaker trial failed, reopening for {:?}", self.cooldown);
            }
            BreakerState::Open { .. } => {}
            BreakerState::Closed => {
                let window_start = now.saturating_sub(self.config.failure_window);
                self.failures.push_back(now);
                while self
                    .failures
                    .front()
                    .is_some_and(|failed_at| *failed_at < window_start)
                {
                    self.failures.pop_front();
                }
                if self.failures.len() as u32 >= self.config.failure_threshold {
                    self.failures.clear();
                    self.state = BreakerState::Open {
                        until: now + self.cooldown,
                    };
                    warn!("Circuit breaker opened for {:?}", self.cooldown);
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Session Continuity
// ----------------------------------------------------------------------------

/// What to do with the remembered session after the relay comes back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resume {
    /// Rejoin transparently with the remembered identity
    Rejoin { room_id: RoomId, display_name: String },
    /// Gap too long; the user must re-confirm before rejoining
    Reconfirm {
        room_id: RoomId,
        display_name: String,
        gap: Duration,
    },
    /// No session to resume
    Nothing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Session {
    room_id: RoomId,
    display_name: String,
    last_connected: Timestamp,
}

/// Remembers the joined room so a reconnect can resume it
#[derive(Debug, Clone)]
pub struct SessionContinuity {
    config: SessionContinuityConfig,
    session: Option<Session>,
}

impl SessionContinuity {
    pub fn new(config: SessionContinuityConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    /// Record a successful join
    pub fn remember(&mut self, room_id: RoomId, display_name: String, now: Timestamp) {
        self.session = Some(Session {
            room_id,
            display_name,
            last_connected: now,
        });
    }

    /// Refresh the last moment the relayed connection was known good
    pub fn mark_connected(&mut self, now: Timestamp) {
        if let Some(session) = self.session.as_mut() {
            session.last_connected = now;
        }
    }

    /// User left the room on purpose
    pub fn forget(&mut self) {
        self.session = None;
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.session.as_ref().map(|session| &session.room_id)
    }

    pub fn display_name(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.display_name.as_str())
    }

    /// Decide how to resume after reconnecting at `now`
    pub fn resume(&self, now: Timestamp) -> Resume {
        let Some(session) = self.session.as_ref() else {
            return Resume::Nothing;
        };
        let gap = now - session.last_connected;
        if gap <= self.config.freshness_threshold {
            Resume::Rejoin {
                room_id: session.room_id.clone(),
                display_name: session.display_name.clone(),
            }
        } else {
            Resume::Reconfirm {
                room_id: session.room_id.clone(),
                display_name: session.display_name.clone(),
                gap,
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Relay Health
// ----------------------------------------------------------------------------

/// Classifies our relayed channel from health-ping round trips
#[derive(Debug, Clone)]
pub struct RelayMonitor {
    degraded_rtt: Duration,
    connected: bool,
    last_rtt: Option<Duration>,
    consecutive_misses: u32,
}

impl RelayMonitor {
    pub fn new(degraded_rtt: Duration) -> Self {
        Self {
            degraded_rtt,
            connected: false,
            last_rtt: None,
            consecutive_misses: 0,
        }
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
        if !connected {
            self.last_rtt = None;
        }
        self.consecutive_misses = 0;
    }

    pub fn record_pong(&mut self, rtt: Duration) {
        self.last_rtt = Some(rtt);
        self.consecutive_misses = 0;
    }

    pub fn record_missed(&mut self) {
        self.consecutive_misses += 1;
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    pub fn health(&self) -> RelayHealth {
        if !self.connected {
            RelayHealth::Down
        } else if self.consecutive_misses > 0
            || self.last_rtt.is_some_and(|rtt| rtt > self.degraded_rtt)
        {
            RelayHealth::Degraded
        } else {
            RelayHealth::Healthy
        }
    }

    /// Self-reported 0-100 quality for presence beacons
    pub fn quality_score(&self) -> u8 {
        match self.health() {
            RelayHealth::Down => 0,
            RelayHealth::Degraded => 30,
            RelayHealth::Healthy => match self.last_rtt {
                Some(rtt) if rtt.as_millis() > 500 => 70,
                Some(rtt) if rtt.as_millis() > 150 => 85,
                _ => 100,
            },
        }
    }
}

// ----------------------------------------------------------------------------
// Health Signal
// ----------------------------------------------------------------------------

/// Coarse status for the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthSignal {
    Connected,
    Degraded,
    /// Recovering from timeouts or unreachable peers
    Searching,
    Reconnecting,
    Offline,
}

/// Inputs the health signal is derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthInputs {
    pub relay: RelayHealth,
    pub reconnecting: bool,
    pub coordinator_exhausted: bool,
    pub searching: bool,
    pub direct_links: usize,
}

impl HealthSignal {
    pub fn derive(inputs: HealthInputs) -> Self {
        match inputs.relay {
            RelayHealth::Down if inputs.coordinator_exhausted && inputs.direct_links == 0 => {
                HealthSignal::Offline
            }
            RelayHealth::Down if inputs.reconnecting => HealthSignal::Reconnecting,
            RelayHealth::Down => HealthSignal::Degraded,
            RelayHealth::Degraded => HealthSignal::Degraded,
            RelayHealth::Healthy if inputs.searching => HealthSignal::Searching,
            RelayHealth::Healthy => HealthSignal::Connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_secs(30),
            cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(20),
        })
    }

    #[test]
    fn test_backoff_is_capped_and_budgeted() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            cap: Duration::from_millis(700),
            max_attempts: 5,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(700));
        assert_eq!(policy.delay(60), Duration::from_millis(700));
        assert_eq!(policy.next_delay(4), Some(Duration::from_millis(700)));
        assert_eq!(policy.next_delay(5), None);
        assert!(policy.is_exhausted(5));
    }

    #[test]
    fn test_breaker_trips_after_threshold() {
        let mut breaker = breaker();
        let now = Timestamp::new(1_000_000);
        breaker.record_failure(now);
        breaker.record_failure(now);
        assert!(breaker.allow_attempt(now));
        breaker.record_failure(now);
        assert_eq!(
            breaker.state(),
            BreakerState::Open {
                until: now + Duration::from_secs(5)
            }
        );
        assert!(!breaker.allow_attempt(now + Duration::from_secs(1)));
        assert_eq!(breaker.retry_in(now + Duration::from_secs(1)), Duration::from_secs(4));
    }

    #[test]
    fn test_failures_outside_window_do_not_trip() {
        let mut breaker = breaker();
        let mut now = Timestamp::new(1_000_000);
        for _ in 0..5 {
            breaker.record_failure(now);
            now = now + Duration::from_secs(31);
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_allows_single_trial() {
        let mut breaker = breaker();
        let now = Timestamp::new(1_000_000);
        for _ in 0..3 {
            breaker.record_failure(now);
        }
        let later = now + Duration::from_secs(5);
        assert!(breaker.allow_attempt(later));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(!breaker.allow_attempt(later));

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.current_cooldown(), Duration::from_secs(5));
    }

    #[test]
    fn test_failed_trial_doubles_cooldown_up_to_max() {
        let mut breaker = breaker();
        let mut now = Timestamp::new(1_000_000);
        for _ in 0..3 {
            breaker.record_failure(now);
        }
        let mut cooldowns = Vec::new();
        for _ in 0..4 {
            now = now + breaker.retry_in(now);
            assert!(breaker.allow_attempt(now));
            breaker.record_failure(now);
            cooldowns.push(breaker.current_cooldown());
        }
        assert_eq!(
            cooldowns,
            vec![
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(20),
                Duration::from_secs(20),
            ]
        );
    }

    #[test]
    fn test_session_rejoin_versus_reconfirm() {
        let mut session = SessionContinuity::new(SessionContinuityConfig::default());
        let start = Timestamp::new(1_000_000);
        assert_eq!(session.resume(start), Resume::Nothing);

        let room = RoomId::new("lobby").unwrap();
        session.remember(room.clone(), "ann".into(), start);
        assert_eq!(
            session.resume(start + Duration::from_secs(90)),
            Resume::Rejoin {
                room_id: room.clone(),
                display_name: "ann".into()
            }
        );
        assert!(matches!(
            session.resume(start + Duration::from_secs(301)),
            Resume::Reconfirm { .. }
        ));

        session.mark_connected(start + Duration::from_secs(300));
        assert!(matches!(
            session.resume(start + Duration::from_secs(400)),
            Resume::Rejoin { .. }
        ));
        session.forget();
        assert_eq!(session.resume(start), Resume::Nothing);
    }

    #[test]
    fn test_relay_monitor_classification() {
        let mut monitor = RelayMonitor::new(Duration::from_millis(1500));
        assert_eq!(monitor.health(), RelayHealth::Down);
        monitor.set_connected(true);
        assert_eq!(monitor.health(), RelayHealth::Healthy);
        monitor.record_pong(Duration::from_millis(2000));
        assert_eq!(monitor.health(), RelayHealth::Degraded);
        monitor.record_pong(Duration::from_millis(20));
        monitor.record_missed();
        assert_eq!(monitor.health(), RelayHealth::Degraded);
        monitor.record_pong(Duration::from_millis(20));
        assert_eq!(monitor.health(), RelayHealth::Healthy);
        assert_eq!(monitor.quality_score(), 100);
    }

    #[test]
    fn test_health_signal_derivation() {
        let base = HealthInputs {
            relay: RelayHealth::Healthy,
            reconnecting: false,
            coordinator_exhausted: false,
            searching: false,
            direct_links: 0,
        };
        assert_eq!(HealthSignal::derive(base), HealthSignal::Connected);
        assert_eq!(
            HealthSignal::derive(HealthInputs { searching: true, ..base }),
            HealthSignal::Searching
        );
        assert_eq!(
            HealthSignal::derive(HealthInputs {
                relay: RelayHealth::Down,
                reconnecting: true,
                ..base
            }),
            HealthSignal::Reconnecting
        );
        assert_eq!(
            HealthSignal::derive(HealthInputs {
                relay: RelayHealth::Down,
                coordinator_exhausted: true,
                ..base
            }),
            HealthSignal::Offline
        );
    }
}
