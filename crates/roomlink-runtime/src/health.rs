//! Connection Health Monitor
//!
//! Periodic sweep over every relayed connection: idle connections get a
//! liveness probe, and connections whose probe went unanswered are closed,
//! which removes their participant and announces the departure.

use roomlink_core::{config::HealthMonitorConfig, protocol::leave_reasons, ConnectionId};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::coordinator::RoomCoordinator;

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSweep {
    pub probed: Vec<ConnectionId>,
    pub closed: Vec<ConnectionId>,
}

/// Closes relayed connections that stop answering
#[derive(Debug)]
pub struct HealthMonitor {
    coordinator: Arc<RoomCoordinator>,
    config: HealthMonitorConfig,
}

impl HealthMonitor {
    pub fn new(coordinator: Arc<RoomCoordinator>, config: HealthMonitorConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    /// One pass over all connections
    pub fn run_once(&self) -> HealthSweep {
        let now = self.coordinator.now();
        let mut sweep = HealthSweep::default();

        for activity in self.coordinator.activity() {
            match activity.probe_sent_at {
                Some(sent_at) => {
                    if now - sent_at > self.config.probe_timeout {
                        info!(
                            "Connection {} missed its liveness probe, closing",
                            activity.connection_id
                        );
                        self.coordinator
                            .force_close(activity.connection_id, leave_reasons::TIMEOUT);
                        sweep.closed.push(activity.connection_id);
                    }
                }
                None => {
                    if now - activity.last_activity > self.config.stale_after
                        && self.coordinator.send_probe(activity.connection_id)
                    {
                        debug!("Probing idle connection {}", activity.connection_id);
                        sweep.probed.push(activity.connection_id);
                    }
                }
            }
        }
        sweep
    }

    /// Sweep every `check_interval` until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "Health monitor started (interval {:?}, stale after {:?})",
            self.config.check_interval, self.config.stale_after
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sweep = self.run_once();
                    if !sweep.closed.is_empty() {
                        debug!("Health sweep closed {} connections", sweep.closed.len());
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Health monitor stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
