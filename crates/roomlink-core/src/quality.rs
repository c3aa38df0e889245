//! Link quality scoring
//!
//! Each direct link is probed on a fixed cadence. Replies feed moving
//! averages of round-trip time, loss, bandwidth and jitter; misses decay
//! them. The resulting [`NetworkCondition`] drives both the degraded flag on
//! the link and the router's path choice.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::config::QualityConfig;
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Quality Tier
// ----------------------------------------------------------------------------

/// Coarse link classification, ordered from worst to best
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityTier {
    Critical,
    Poor,
    Good,
    Excellent,
}

impl QualityTier {
    /// Tier of a self-reported 0-100 score (presence records, link reports)
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => QualityTier::Excellent,
            60..=79 => QualityTier::Good,
            40..=59 => QualityTier::Poor,
            _ => QualityTier::Critical,
        }
    }

    /// Tier from measured link properties
    pub fn from_measurements(latency: Duration, loss: f64, stability: f64) -> Self {
        let latency_ms = latency.as_millis();
        if latency_ms < 100 && loss < 0.01 && stability > 0.9 {
            QualityTier::Excellent
        } else if latency_ms < 300 && loss < 0.05 {
            QualityTier::Good
        } else if latency_ms < 1000 && loss < 0.2 {
            QualityTier::Poor
        } else {
            QualityTier::Critical
        }
    }

    /// Good or better
    pub fn is_healthy(&self) -> bool {
        *self >= QualityTier::Good
    }
}

// ----------------------------------------------------------------------------
// Network Condition
// ----------------------------------------------------------------------------

/// Measured state of one direct link
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkCondition {
    pub tier: QualityTier,
    /// Smoothed round-trip time
    pub latency: Duration,
    /// Estimated loss ratio (0..1)
    pub loss: f64,
    /// Estimated bandwidth in bytes per second
    pub bandwidth_bps: u64,
    /// Rolling stability (0..1), falls with jitter and misses
    pub stability: f64,
    /// Combined 0-100 score
    pub score: u8,
}

impl NetworkCondition {
    /// Assumed condition of a freshly opened link before the first probe
    pub fn initial() -> Self {
        Self {
            tier: QualityTier::Good,
            latency: Duration::ZERO,
            loss: 0.0,
            bandwidth_bps: 0,
            stability: 1.0,
            score: 75,
        }
    }
}

impl Default for NetworkCondition {
    fn default() -> Self {
        Self::initial()
    }
}

fn compute_score(latency: Duration, loss: f64, stability: f64) -> u8 {
    // 100 at 50ms or less, 0 at 2s or more
    let latency_ms = latency.as_millis() as f64;
    let latency_score = (1.0 - ((latency_ms - 50.0).max(0.0) / 1950.0)).clamp(0.0, 1.0);
    // 50% loss is as bad as it gets
    let loss_score = (1.0 - (loss / 0.5)).clamp(0.0, 1.0);
    let stability_score = stability.clamp(0.0, 1.0);

    let combined = 0.3 * latency_score + 0.5 * loss_score + 0.2 * stability_score;
    (combined * 100.0).round() as u8
}

// ----------------------------------------------------------------------------
// Link Quality Tracker
// ----------------------------------------------------------------------------

/// Verdict after a probe outcome has been folded in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityVerdict {
    /// Nothing changed that the link state machine cares about
    Steady,
    /// Score fell below threshold with no recent successful probe
    Degrade,
    /// Score back above the recovery threshold
    Recover,
}

/// Per-link moving averages fed by probe outcomes
#[derive(Debug, Clone)]
pub struct LinkQuality {
    config: QualityConfig,
    rtt_ms: Option<f64>,
    jitter_ms: f64,
    loss: f64,
    bandwidth_bps: f64,
    stability: f64,
    last_success: Option<Timestamp>,
    opened_at: Timestamp,
    samples: u64,
    misses: u64,
    condition: NetworkCondition,
}

impl LinkQuality {
    pub fn new(config: QualityConfig, opened_at: Timestamp) -> Self {
        Self {
            config,
            rtt_ms: None,
            jitter_ms: 0.0,
            loss: 0.0,
            bandwidth_bps: 0.0,
            stability: 1.0,
            last_success: None,
            opened_at,
            samples: 0,
            misses: 0,
            condition: NetworkCondition::initial(),
        }
    }

    pub fn condition(&self) -> NetworkCondition {
        self.condition
    }

    pub fn tier(&self) -> QualityTier {
        self.condition.tier
    }

    pub fn score(&self) -> u8 {
        self.condition.score
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Fold in a probe reply; returns the new tier if it changed
    pub fn record_reply(
        &mut self,
        rtt: Duration,
        payload_bytes: usize,
        now: Timestamp,
    ) -> Option<QualityTier> {
        let alpha = self.config.smoothing;
        let sample_ms = rtt.as_millis() as f64;

        let rtt_ms = match self.rtt_ms {
            Some(previous) => {
                let deviation = (sample_ms - previous).abs();
                self.jitter_ms = (1.0 - alpha) * self.jitter_ms + alpha * deviation;
                (1.0 - alpha) * previous + alpha * sample_ms
            }
            None => sample_ms,
        };
        self.rtt_ms = Some(rtt_ms);
        self.loss *= 1.0 - alpha;

        // One-way transfer of the probe padding
        let one_way_secs = (sample_ms / 2.0).max(1.0) / 1000.0;
        let bandwidth_sample = payload_bytes as f64 / one_way_secs;
        self.bandwidth_bps = if self.samples == 0 {
            bandwidth_sample
        } else {
            (1.0 - alpha) * self.bandwidth_bps + alpha * bandwidth_sample
        };

        let jitter_ratio = if rtt_ms > 0.0 {
            (self.jitter_ms / rtt_ms).min(1.0)
        } else {
            0.0
        };
        self.stability = (1.0 - alpha) * self.stability + alpha * (1.0 - jitter_ratio);

        self.samples += 1;
        self.last_success = Some(now);
        self.recompute()
    }

    /// Fold in a missed probe; returns the new tier if it changed
    pub fn record_miss(&mut self, _now: Timestamp) -> Option<QualityTier> {
        let alpha = self.config.smoothing;
        self.loss = (1.0 - alpha) * self.loss + alpha;
        self.stability *= 1.0 - alpha;
        self.misses += 1;
        self.recompute()
    }

    fn recompute(&mut self) -> Option<QualityTier> {
        let latency = Duration::from_millis(self.rtt_ms.unwrap_or(0.0).round() as u64);
        let tier = QualityTier::from_measurements(latency, self.loss, self.stability);
        let previous = self.condition.tier;
        self.condition = NetworkCondition {
            tier,
            latency,
            loss: self.loss,
            bandwidth_bps: self.bandwidth_bps.round() as u64,
            stability: self.stability,
            score: compute_score(latency, self.loss, self.stability),
        };
        (tier != previous).then_some(tier)
    }

    /// Whether a probe succeeded within the grace window
    pub fn recently_succeeded(&self, now: Timestamp) -> bool {
        let reference = self.last_success.unwrap_or(self.opened_at);
        now - reference <= self.config.success_grace
    }

    /// Decide whether the link should change between open and degraded
    pub fn verdict(&self, currently_degraded: bool, now: Timestamp) -> QualityVerdict {
        let score = self.condition.score;
        if currently_degraded {
            if score >= self.config.recover_threshold {
                QualityVerdict::Recover
            } else {
                QualityVerdict::Steady
            }
        } else if score < self.config.degrade_threshold && !self.recently_succeeded(now) {
            QualityVerdict::Degrade
        } else {
            QualityVerdict::Steady
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> LinkQuality {
        LinkQuality::new(QualityConfig::default(), Timestamp::new(0))
    }

    #[test]
    fn test_tier_from_score_boundaries() {
        assert_eq!(QualityTier::from_score(100), QualityTier::Excellent);
        assert_eq!(QualityTier::from_score(60), QualityTier::Good);
        assert_eq!(QualityTier::from_score(59), QualityTier::Poor);
        assert_eq!(QualityTier::from_score(10), QualityTier::Critical);
        assert!(QualityTier::Good.is_healthy());
        assert!(!QualityTier::Poor.is_healthy());
    }

    #[test]
    fn test_fast_replies_are_excellent() {
        let mut quality = tracker();
        let mut now = Timestamp::new(0);
        for _ in 0..5 {
            now = now + Duration::from_secs(5);
            quality.record_reply(Duration::from_millis(20), 256, now);
        }
        assert_eq!(quality.tier(), QualityTier::Excellent);
        assert!(quality.score() >= 90);
        assert!(quality.condition().bandwidth_bps > 0);
    }

    #[test]
    fn test_slow_link_is_critical() {
        let mut quality = tracker();
        quality.record_reply(Duration::from_millis(1500), 256, Timestamp::new(10));
        assert_eq!(quality.tier(), QualityTier::Critical);
    }

    #[test]
    fn test_misses_degrade_only_after_grace() {
        let mut quality = tracker();
        let start = Timestamp::new(0);
        quality.record_reply(Duration::from_millis(30), 256, start);

        let mut now = start;
        for _ in 0..4 {
            now = now + Duration::from_secs(5);
            quality.record_miss(now);
        }
        assert!(quality.score() < 40);
        // Last success was 20s ago, beyond the 10s grace
        assert_eq!(quality.verdict(false, now), QualityVerdict::Degrade);
        // Inside the grace period the same score does not degrade
        assert_eq!(
            quality.verdict(false, start + Duration::from_secs(5)),
            QualityVerdict::Steady
        );
    }

    #[test]
    fn test_recovery_after_replies() {
        let mut quality = tracker();
        let mut now = Timestamp::new(0);
        for _ in 0..4 {
            now = now + Duration::from_secs(5);
            quality.record_miss(now);
        }
        assert_eq!(quality.verdict(true, now), QualityVerdict::Steady);
        for _ in 0..10 {
            now = now + Duration::from_secs(5);
            quality.record_reply(Duration::from_millis(30), 256, now);
        }
        assert_eq!(quality.verdict(true, now), QualityVerdict::Recover);
    }

    #[test]
    fn test_tier_change_is_reported_once() {
        let mut quality = tracker();
        let now = Timestamp::new(0);
        assert_eq!(
            quality.record_reply(Duration::from_millis(1500), 256, now),
            Some(QualityTier::Critical)
        );
        assert_eq!(quality.record_reply(Duration::from_millis(1500), 256, now), None);
    }
}
