//! Per-recipient path selection and routing statistics

use serde::{Deserialize, Serialize};

use crate::config::{BridgeConfig, RouterConfig};
use crate::link::DirectLinkState;
use crate::quality::{NetworkCondition, QualityTier};
use crate::types::{MessageId, PeerId};

// ----------------------------------------------------------------------------
// Inputs
// ----------------------------------------------------------------------------

/// Health of our own relayed channel, measured from ping round trips
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayHealth {
    Healthy,
    Degraded,
    Down,
}

/// Direct link view handed to the policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectPath {
    /// Open and not degraded
    pub usable: bool,
    /// Open or degraded
    pub established: bool,
    pub condition: NetworkCondition,
}

impl DirectPath {
    pub fn from_state(state: &DirectLinkState, condition: NetworkCondition) -> Self {
        Self {
            usable: state.is_usable(),
            established: state.is_established(),
            condition,
        }
    }

    pub fn tier(&self) -> QualityTier {
        self.condition.tier
    }
}

// ----------------------------------------------------------------------------
// Route Policy
// ----------------------------------------------------------------------------

/// Path chosen for one recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Route {
    Direct,
    Relayed,
    Bridge,
    Queue,
}

/// Stateless path selection rules
#[derive(Debug, Clone)]
pub struct RoutePolicy {
    peer_relay_quality_threshold: u8,
    bridge_enabled: bool,
}

impl RoutePolicy {
    pub fn new(router: &RouterConfig, bridge: &BridgeConfig) -> Self {
        Self {
            peer_relay_quality_threshold: router.peer_relay_quality_threshold,
            bridge_enabled: bridge.enabled,
        }
    }

    /// Whether the relayed path to one recipient is degraded: either our own
    /// relay is, or the recipient reports a poor relayed connection
    pub fn relay_path_degraded(&self, relay: RelayHealth, recipient_relay_quality: Option<u8>) -> bool {
        relay != RelayHealth::Healthy
            || recipient_relay_quality.is_some_and(|q| q < self.peer_relay_quality_threshold)
    }

    /// Pick the path for one recipient
    pub fn select(
        &self,
        direct: Option<DirectPath>,
        relay: RelayHealth,
        recipient_relay_quality: Option<u8>,
    ) -> Route {
        let relay_degraded = self.relay_path_degraded(relay, recipient_relay_quality);

        if let Some(path) = direct {
            if path.usable && path.tier() > QualityTier::Critical {
                // Poor links yield to the bridge once the relayed path is degraded
                if path.tier() >= QualityTier::Good || !relay_degraded {
                    return Route::Direct;
                }
            }
        }

        if !relay_degraded {
            return Route::Relayed;
        }

        let direct_insufficient = direct.map_or(true, |path| {
            !path.usable || path.tier() <= QualityTier::Poor
        });
        if self.bridge_enabled && direct_insufficient {
            return Route::Bridge;
        }

        self.bridge_fallback(direct, relay)
    }

    /// Path to use when the bridge is unavailable or exhausted
    pub fn bridge_fallback(&self, direct: Option<DirectPath>, relay: RelayHealth) -> Route {
        if relay != RelayHealth::Down {
            Route::Relayed
        } else if direct.is_some_and(|path| path.established) {
            Route::Direct
        } else {
            Route::Queue
        }
    }
}

// ----------------------------------------------------------------------------
// Route Report
// ----------------------------------------------------------------------------

/// How one outbound message was dispatched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteReport {
    pub message_id: MessageId,
    /// Path used per recipient
    pub routes: Vec<(PeerId, Route)>,
    /// Whether one copy went to the coordinator for room broadcast
    pub relayed_broadcast: bool,
    /// Whether the message was parked in the outbound queue
    pub queued: bool,
}

impl RouteReport {
    pub fn new(message_id: MessageId) -> Self {
        Self {
            message_id,
            routes: Vec::new(),
            relayed_broadcast: false,
            queued: false,
        }
    }

    pub fn route_for(&self, peer_id: PeerId) -> Option<Route> {
        self.routes
            .iter()
            .find(|(peer, _)| *peer == peer_id)
            .map(|(_, route)| *route)
    }

    pub fn count(&self, route: Route) -> usize {
        self.routes.iter().filter(|(_, r)| *r == route).count()
    }
}

// ----------------------------------------------------------------------------
// Routing Statistics
// ----------------------------------------------------------------------------

/// Path an inbound copy arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InboundPath {
    Direct,
    Relayed,
    Bridge,
}

/// Counters consumed by observability surfaces
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingStats {
    pub sent_direct: u64,
    pub sent_relayed: u64,
    pub sent_bridged: u64,
    pub queued: u64,
    pub dropped_from_queue: u64,
    pub received_direct: u64,
    pub received_relayed: u64,
    pub received_bridged: u64,
    pub duplicates_filtered: u64,
    pub relay_exhausted: u64,
    pub bridged_for_others: u64,
}

impl RoutingStats {
    pub fn record_sent(&mut self, route: Route) {
        match route {
            Route::Direct => self.sent_direct += 1,
            Route::Relayed => self.sent_relayed += 1,
            Route::Bridge => self.sent_bridged += 1,
            Route::Queue => self.queued += 1,
        }
    }

    pub fn record_received(&mut self, path: InboundPath) {
        match path {
            InboundPath::Direct => self.received_direct += 1,
            InboundPath::Relayed => self.received_relayed += 1,
            InboundPath::Bridge => self.received_bridged += 1,
        }
    }

    pub fn total_sent(&self) -> u64 {
        self.sent_direct + self.sent_relayed + self.sent_bridged
    }

    pub fn total_received(&self) -> u64 {
        self.received_direct + self.received_relayed + self.received_bridged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RoutePolicy {
        RoutePolicy::new(&RouterConfig::default(), &BridgeConfig::default())
    }

    fn path(tier: QualityTier, usable: bool) -> Option<DirectPath> {
        Some(DirectPath {
            usable,
            established: true,
            condition: NetworkCondition {
                tier,
                ..NetworkCondition::initial()
            },
        })
    }

    #[test]
    fn test_healthy_direct_link_is_preferred() {
        assert_eq!(
            policy().select(path(QualityTier::Excellent, true), RelayHealth::Healthy, Some(90)),
            Route::Direct
        );
        assert_eq!(
            policy().select(path(QualityTier::Poor, true), RelayHealth::Healthy, None),
            Route::Direct
        );
    }

    #[test]
    fn test_critical_direct_with_healthy_relay_uses_relay() {
        assert_eq!(
            policy().select(path(QualityTier::Critical, true), RelayHealth::Healthy, Some(90)),
            Route::Relayed
        );
        assert_eq!(
            policy().select(path(QualityTier::Good, false), RelayHealth::Healthy, None),
            Route::Relayed
        );
        assert_eq!(policy().select(None, RelayHealth::Healthy, None), Route::Relayed);
    }

    #[test]
    fn test_bridge_only_when_both_paths_insufficient() {
        assert_eq!(
            policy().select(path(QualityTier::Critical, true), RelayHealth::Degraded, None),
            Route::Bridge
        );
        assert_eq!(
            policy().select(path(QualityTier::Poor, true), RelayHealth::Healthy, Some(10)),
            Route::Bridge
        );
        assert_eq!(policy().select(None, RelayHealth::Down, None), Route::Bridge);
        assert_eq!(
            policy().select(path(QualityTier::Good, true), RelayHealth::Degraded, None),
            Route::Direct
        );
    }

    #[test]
    fn test_disabled_bridge_falls_back() {
        let policy = RoutePolicy::new(
            &RouterConfig::default(),
            &BridgeConfig {
                enabled: false,
                ..BridgeConfig::default()
            },
        );
        assert_eq!(
            policy.select(path(QualityTier::Critical, true), RelayHealth::Degraded, None),
            Route::Relayed
        );
        assert_eq!(
            policy.select(path(QualityTier::Critical, false), RelayHealth::Down, None),
            Route::Direct
        );
        assert_eq!(policy.select(None, RelayHealth::Down, None), Route::Queue);
    }

    #[test]
    fn test_stats_counters() {
        let mut stats = RoutingStats::default();
        stats.record_sent(Route::Direct);
        stats.record_sent(Route::Relayed);
        stats.record_sent(Route::Queue);
        stats.record_received(InboundPath::Bridge);
        assert_eq!(stats.total_sent(), 2);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.total_received(), 1);
    }
}
