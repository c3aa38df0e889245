//! Centralized Configuration Management
//!
//! Every policy knob of the connection core lives here as a named parameter:
//! retry budgets, backoff curves, staleness thresholds, caps. Components take
//! the relevant section by value and never hard-code their own constants.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, RoomlinkError};

// ----------------------------------------------------------------------------
// Coordinator Configuration
// ----------------------------------------------------------------------------

/// Limits enforced by the Room Coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Maximum display name length in characters
    pub max_display_name_len: usize,
    /// Maximum chat message content length in characters
    pub max_message_len: usize,
    /// Maximum participants admitted to one room
    pub max_room_participants: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_display_name_len: 64,
            max_message_len: 4096,
            max_room_participants: 64,
        }
    }
}

// ----------------------------------------------------------------------------
// Health Monitor Configuration
// ----------------------------------------------------------------------------

/// Liveness policy for relayed connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMonitorConfig {
    /// Interval between sweeps over all relayed connections
    pub check_interval: Duration,
    /// Inactivity after which a liveness probe is sent
    pub stale_after: Duration,
    /// Time allowed for the probe reply before the connection is closed
    pub probe_timeout: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(15),
            stale_after: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(15),
        }
    }
}

impl HealthMonitorConfig {
    pub fn testing() -> Self {
        Self {
            check_interval: Duration::from_millis(50),
            stale_after: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(200),
        }
    }
}

// ----------------------------------------------------------------------------
// Discovery Configuration
// ----------------------------------------------------------------------------

/// Peer discovery and presence policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Presence records older than this are never trusted
    pub presence_ttl: Duration,
    /// Maximum upgrade candidates returned per discovery round
    pub max_candidates: usize,
    /// Quality weight assigned to coordinator-sourced entries
    pub coordinator_quality: u8,
    /// Delay between sequential upgrade attempts
    pub inter_attempt_delay: Duration,
    /// Interval between discovery rounds
    pub discovery_interval: Duration,
    /// Interval between own presence broadcasts
    pub presence_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            presence_ttl: Duration::from_secs(30),
            max_candidates: 3,
            coordinator_quality: 100,
            inter_attempt_delay: Duration::from_millis(500),
            discovery_interval: Duration::from_secs(10),
            presence_interval: Duration::from_secs(10),
        }
    }
}

impl DiscoveryConfig {
    pub fn testing() -> Self {
        Self {
            presence_ttl: Duration::from_secs(5),
            max_candidates: 3,
            coordinator_quality: 100,
            inter_attempt_delay: Duration::from_millis(10),
            discovery_interval: Duration::from_millis(200),
            presence_interval: Duration::from_millis(200),
        }
    }
}

// ----------------------------------------------------------------------------
// Backoff and Circuit Breaker
// ----------------------------------------------------------------------------

/// Exponential backoff policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Growth factor between consecutive retries
    pub multiplier: f64,
    /// Upper bound for any single delay
    pub cap: Duration,
    /// Retry budget; zero means no retries
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            multiplier: 2.0,
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures inside `failure_window` that trip the breaker
    pub failure_threshold: u32,
    /// Sliding window for counting failures
    pub failure_window: Duration,
    /// Initial open-state cooldown
    pub cooldown: Duration,
    /// Upper bound for the doubled cooldown after failed trials
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(30),
            cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(120),
        }
    }
}

/// Session continuity policy for the relayed connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionContinuityConfig {
    /// Gaps longer than this require identity re-confirmation
    pub freshness_threshold: Duration,
}

impl Default for SessionContinuityConfig {
    fn default() -> Self {
        Self {
            freshness_threshold: Duration::from_secs(300),
        }
    }
}

/// Resilience policy wrapping the relayed connection
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResilienceConfig {
    /// Backoff for relayed-connection reconnection; `max_attempts` is the
    /// budget after which the coordinator is reported unreachable
    pub relay_backoff: BackoffPolicy,
    /// Breaker guarding reconnection attempts
    pub breaker: CircuitBreakerConfig,
    /// Rejoin freshness policy
    pub session: SessionContinuityConfig,
}

// ----------------------------------------------------------------------------
// Mesh Configuration
// ----------------------------------------------------------------------------

/// Direct-link upgrade policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Simultaneous pending attempts per client
    pub max_pending_attempts: usize,
    /// Bound on negotiation + dial for one attempt
    pub attempt_timeout: Duration,
    /// Links open at least this long are retried after they drop
    pub min_stable_duration: Duration,
    /// Backoff for reconnecting previously-stable links; `max_attempts` is
    /// the per-target reconnection budget
    pub reconnect_backoff: BackoffPolicy,
    /// Upper bound on simultaneously open direct links
    pub max_direct_links: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_pending_attempts: 2,
            attempt_timeout: Duration::from_secs(5),
            min_stable_duration: Duration::from_secs(10),
            reconnect_backoff: BackoffPolicy {
                base: Duration::from_secs(1),
                multiplier: 2.0,
                cap: Duration::from_secs(16),
                max_attempts: 3,
            },
            max_direct_links: 8,
        }
    }
}

impl MeshConfig {
    pub fn testing() -> Self {
        Self {
            max_pending_attempts: 2,
            attempt_timeout: Duration::from_millis(500),
            min_stable_duration: Duration::from_millis(200),
            reconnect_backoff: BackoffPolicy {
                base: Duration::from_millis(20),
                multiplier: 2.0,
                cap: Duration::from_millis(200),
                max_attempts: 3,
            },
            max_direct_links: 8,
        }
    }
}

// ----------------------------------------------------------------------------
// Link Quality Configuration
// ----------------------------------------------------------------------------

/// Probe cadence and quality thresholds for direct links
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Interval between round-trip probes on each link
    pub probe_interval: Duration,
    /// Probe replies arriving later than this count as lost
    pub probe_timeout: Duration,
    /// Score below which a link may be marked degraded
    pub degrade_threshold: u8,
    /// Score at which a degraded link is considered open again
    pub recover_threshold: u8,
    /// A link with a successful probe inside this window is never degraded
    pub success_grace: Duration,
    /// Weight of the newest sample in the moving averages (0..1)
    pub smoothing: f64,
    /// Padding carried by each probe, used for the bandwidth estimate
    pub probe_payload_bytes: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            degrade_threshold: 40,
            recover_threshold: 60,
            success_grace: Duration::from_secs(10),
            smoothing: 0.3,
            probe_payload_bytes: 256,
        }
    }
}

impl QualityConfig {
    pub fn testing() -> Self {
        Self {
            probe_interval: Duration::from_millis(50),
            probe_timeout: Duration::from_millis(100),
            success_grace: Duration::from_millis(150),
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Router Configuration
// ----------------------------------------------------------------------------

/// Path selection and inbound dedup policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Fingerprints remembered per room for inbound dedup
    pub dedup_window: usize,
    /// Interval between relayed-channel health pings
    pub relay_ping_interval: Duration,
    /// Pong later than this counts as missed
    pub relay_pong_timeout: Duration,
    /// Round trip above which the relayed channel is degraded
    pub relay_degraded_rtt: Duration,
    /// Self-reported peer quality below which its relayed path is degraded
    pub peer_relay_quality_threshold: u8,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dedup_window: 512,
            relay_ping_interval: Duration::from_secs(10),
            relay_pong_timeout: Duration::from_secs(5),
            relay_degraded_rtt: Duration::from_millis(1500),
            peer_relay_quality_threshold: 40,
        }
    }
}

impl RouterConfig {
    pub fn testing() -> Self {
        Self {
            relay_ping_interval: Duration::from_millis(100),
            relay_pong_timeout: Duration::from_millis(100),
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Bridge Configuration
// ----------------------------------------------------------------------------

/// Multi-hop relay policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Whether the bridge may be engaged at all
    pub enabled: bool,
    /// Hard cap on relay hops
    pub hop_cap: u8,
    /// Time to wait for a bridge acknowledgement (critical messages)
    pub ack_timeout: Duration,
    /// Bridge nodes tried for a critical message before giving up
    pub critical_max_attempts: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hop_cap: 2,
            ack_timeout: Duration::from_secs(3),
            critical_max_attempts: 3,
        }
    }
}

impl BridgeConfig {
    pub fn testing() -> Self {
        Self {
            ack_timeout: Duration::from_millis(200),
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Queue Configuration
// ----------------------------------------------------------------------------

/// Outbound queue used while no path is viable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum queued messages; the oldest is dropped when full
    pub max_len: usize,
    /// Flush attempts before a queued message is dropped
    pub max_retries: u32,
    /// Age after which a queued message is dropped
    pub max_age: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_len: 256,
            max_retries: 5,
            max_age: Duration::from_secs(120),
        }
    }
}

// ----------------------------------------------------------------------------
// Master Configuration
// ----------------------------------------------------------------------------

/// Master configuration consolidating every Roomlink policy
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RoomlinkConfig {
    pub coordinator: CoordinatorConfig,
    pub health: HealthMonitorConfig,
    pub discovery: DiscoveryConfig,
    pub mesh: MeshConfig,
    pub quality: QualityConfig,
    pub router: RouterConfig,
    pub bridge: BridgeConfig,
    pub resilience: ResilienceConfig,
    pub queue: QueueConfig,
}

impl RoomlinkConfig {
    /// Create new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Short timers for tests and local simulation
    pub fn testing() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            health: HealthMonitorConfig::testing(),
            discovery: DiscoveryConfig::testing(),
            mesh: MeshConfig::testing(),
            quality: QualityConfig::testing(),
            router: RouterConfig::testing(),
            bridge: BridgeConfig::testing(),
            resilience: ResilienceConfig {
                relay_backoff: BackoffPolicy {
                    base: Duration::from_millis(20),
                    multiplier: 2.0,
                    cap: Duration::from_millis(200),
                    max_attempts: 4,
                },
                breaker: CircuitBreakerConfig {
                    failure_threshold: 3,
                    failure_window: Duration::from_secs(5),
                    cooldown: Duration::from_millis(50),
                    max_cooldown: Duration::from_millis(400),
                },
                session: SessionContinuityConfig::default(),
            },
            queue: QueueConfig::default(),
        }
    }

    /// Tolerant thresholds for high-loss networks: slower probes, longer
    /// grace periods and a wider bridge retry window
    pub fn lossy_network() -> Self {
        Self {
            quality: QualityConfig {
                probe_interval: Duration::from_secs(8),
                probe_timeout: Duration::from_secs(5),
                success_grace: Duration::from_secs(20),
                ..QualityConfig::default()
            },
            bridge: BridgeConfig {
                ack_timeout: Duration::from_secs(6),
                critical_max_attempts: 4,
                ..BridgeConfig::default()
            },
            health: HealthMonitorConfig {
                stale_after: Duration::from_secs(45),
                probe_timeout: Duration::from_secs(30),
                ..HealthMonitorConfig::default()
            },
            ..Self::default()
        }
    }

    /// Builder method for customizing mesh configuration
    pub fn with_mesh(mut self, mesh: MeshConfig) -> Self {
        self.mesh = mesh;
        self
    }

    /// Builder method for customizing bridge configuration
    pub fn with_bridge(mut self, bridge: BridgeConfig) -> Self {
        self.bridge = bridge;
        self
    }

    /// Builder method for customizing resilience configuration
    pub fn with_resilience(mut self, resilience: ResilienceConfig) -> Self {
        self.resilience = resilience;
        self
    }

    /// Builder method for customizing health monitor configuration
    pub fn with_health(mut self, health: HealthMonitorConfig) -> Self {
        self.health = health;
        self
    }

    /// Builder method for customizing discovery configuration
    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    /// Validate the configuration for consistency and feasibility
    pub fn validate(&self) -> Result<()> {
        if self.mesh.max_pending_attempts == 0 {
            return Err(RoomlinkError::config_error(
                "max_pending_attempts cannot be zero",
            ));
        }
        if self.mesh.attempt_timeout.is_zero() {
            return Err(RoomlinkError::config_error("attempt_timeout cannot be zero"));
        }
        for (name, policy) in [
            ("mesh.reconnect_backoff", &self.mesh.reconnect_backoff),
            ("resilience.relay_backoff", &self.resilience.relay_backoff),
        ] {
            if policy.multiplier < 1.0 {
                return Err(RoomlinkError::config_error(format!(
                    "{name}: multiplier must be at least 1.0"
                )));
            }
            if policy.base > policy.cap {
                return Err(RoomlinkError::config_error(format!(
                    "{name}: base delay cannot exceed cap"
                )));
            }
        }
        if self.discovery.max_candidates == 0 {
            return Err(RoomlinkError::config_error("max_candidates cannot be zero"));
        }
        if self.router.dedup_window == 0 {
            return Err(RoomlinkError::config_error("dedup_window cannot be zero"));
        }
        if self.quality.degrade_threshold > self.quality.recover_threshold {
            return Err(RoomlinkError::config_error(
                "degrade_threshold cannot exceed recover_threshold",
            ));
        }
        if !(0.0..=1.0).contains(&self.quality.smoothing) || self.quality.smoothing == 0.0 {
            return Err(RoomlinkError::config_error("smoothing must be in (0, 1]"));
        }
        if self.bridge.hop_cap == 0 {
            return Err(RoomlinkError::config_error("hop_cap cannot be zero"));
        }
        if self.resilience.breaker.failure_threshold == 0 {
            return Err(RoomlinkError::config_error(
                "breaker failure_threshold cannot be zero",
            ));
        }
        if self.resilience.breaker.cooldown > self.resilience.breaker.max_cooldown {
            return Err(RoomlinkError::config_error(
                "breaker cooldown cannot exceed max_cooldown",
            ));
        }
        if self.health.probe_timeout.is_zero() || self.health.stale_after.is_zero() {
            return Err(RoomlinkError::config_error(
                "health thresholds cannot be zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        assert!(RoomlinkConfig::default().validate().is_ok());
        assert!(RoomlinkConfig::testing().validate().is_ok());
        assert!(RoomlinkConfig::lossy_network().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_inconsistent_values() {
        let mut config = RoomlinkConfig::default();
        config.quality.degrade_threshold = 90;
        assert!(config.validate().is_err());

        let mut config = RoomlinkConfig::default();
        config.mesh.reconnect_backoff.base = Duration::from_secs(60);
        assert!(config.validate().is_err());

        let mut config = RoomlinkConfig::default();
        config.bridge.hop_cap = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serializes() {
        let config = RoomlinkConfig::testing();
        let json = serde_json::to_string(&config).unwrap();
        let back: RoomlinkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.mesh.max_pending_attempts, config.mesh.max_pending_attempts);
        assert_eq!(back.bridge.hop_cap, 2);
    }
}
