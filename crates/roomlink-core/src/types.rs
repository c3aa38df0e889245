//! Core types for the Roomlink protocol
//!
//! This module defines the fundamental identifiers used throughout the
//! connection core, using newtype patterns for validation and type safety.

use core::fmt;
use core::ops::{Add, Deref, Sub};
use core::str::FromStr;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::RoomlinkError;

// ----------------------------------------------------------------------------
// Peer Identifier
// ----------------------------------------------------------------------------

/// Stable, client-generated peer identifier (8 bytes, hex encoded on the wire)
///
/// A PeerId outlives any single relayed connection: a browser tab refresh
/// produces a new connection but re-uses the same PeerId.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId([u8; 8]);

impl PeerId {
    /// Create a new PeerId from 8 bytes
    pub fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Create PeerId from the first 8 bytes of a longer identifier
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut id = [0u8; 8];
        let len = core::cmp::min(bytes.len(), 8);
        id[..len].copy_from_slice(&bytes[..len]);
        Self(id)
    }

    /// Generate a fresh random PeerId
    pub fn random() -> Self {
        Self::from_bytes(Uuid::new_v4().as_bytes())
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Short form used in log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..3])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for PeerId {
    type Err = RoomlinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean_str = s.strip_prefix("0x").unwrap_or(s);

        let bytes = hex::decode(clean_str)
            .map_err(|_| RoomlinkError::invalid_message("Invalid hex in PeerId"))?;

        if bytes.len() != 8 {
            return Err(RoomlinkError::invalid_message(
                "PeerId must be exactly 8 bytes",
            ));
        }

        Ok(Self::from_bytes(&bytes))
    }
}

impl TryFrom<String> for PeerId {
    type Error = RoomlinkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerId> for String {
    fn from(peer_id: PeerId) -> Self {
        peer_id.to_string()
    }
}

impl Deref for PeerId {
    type Target = [u8; 8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Room Identifier
// ----------------------------------------------------------------------------

/// Maximum accepted room identifier length in characters
pub const MAX_ROOM_ID_LEN: usize = 128;

/// Name of a room; anyone holding it may join
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Validate and wrap a room identifier
    pub fn new<S: Into<String>>(value: S) -> Result<Self, RoomlinkError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(RoomlinkError::invalid_message("Room id cannot be empty"));
        }
        if trimmed.chars().count() > MAX_ROOM_ID_LEN {
            return Err(RoomlinkError::invalid_message("Room id too long"));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(RoomlinkError::invalid_message(
                "Room id contains control characters",
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomId {
    type Err = RoomlinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RoomId {
    type Error = RoomlinkError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoomId> for String {
    fn from(room_id: RoomId) -> Self {
        room_id.0
    }
}

// ----------------------------------------------------------------------------
// Connection Identifier
// ----------------------------------------------------------------------------

/// Coordinator-assigned handle of one relayed connection
///
/// Unlike [`PeerId`] this is transient: every reconnect gets a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Message Identifier
// ----------------------------------------------------------------------------

/// Client-generated message identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(other.as_millis() as u64))
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, other: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Duration elapsed since an earlier timestamp (zero if `earlier` is later)
    pub fn duration_since(&self, earlier: Self) -> Duration {
        *self - earlier
    }

    /// Subtract a duration, saturating at the epoch
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_millis() as u64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Source of wall-clock timestamps
///
/// Components that reason about staleness (presence TTL, activity thresholds,
/// session freshness) take a time source instead of reading the clock
/// directly, so tests can drive time explicitly.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Standard library implementation of TimeSource
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

impl<T: TimeSource + ?Sized> TimeSource for std::sync::Arc<T> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

mod manual {
    use super::{TimeSource, Timestamp};
    use core::time::Duration;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Manually driven time source for deterministic tests
    #[derive(Debug, Clone)]
    pub struct ManualTimeSource {
        current: Arc<AtomicU64>,
    }

    impl ManualTimeSource {
        /// Start at an arbitrary non-zero epoch so `saturating_sub` never clamps
        pub fn new() -> Self {
            Self::starting_at(1_700_000_000_000)
        }

        pub fn starting_at(millis: u64) -> Self {
            Self {
                current: Arc::new(AtomicU64::new(millis)),
            }
        }

        pub fn advance(&self, duration: Duration) {
            self.current
                .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        }

        pub fn set(&self, timestamp: Timestamp) {
            self.current.store(timestamp.as_millis(), Ordering::SeqCst);
        }
    }

    impl Default for ManualTimeSource {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TimeSource for ManualTimeSource {
        fn now(&self) -> Timestamp {
            Timestamp::new(self.current.load(Ordering::SeqCst))
        }
    }
}

pub use manual::ManualTimeSource;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_round_trips_through_hex() {
        let peer_id = PeerId::new([1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(peer_id.to_string(), "0102030405060708");
        assert_eq!("0x0102030405060708".parse::<PeerId>().unwrap(), peer_id);
        assert!("0102".parse::<PeerId>().is_err());
        assert!("zz".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_peer_id_serializes_as_string() {
        let peer_id = PeerId::new([0xab; 8]);
        let json = serde_json::to_string(&peer_id).unwrap();
        assert_eq!(json, "\"abababababababab\"");
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, peer_id);
    }

    #[test]
    fn test_room_id_validation() {
        assert_eq!(RoomId::new("  lobby ").unwrap().as_str(), "lobby");
        assert!(RoomId::new("   ").is_err());
        assert!(RoomId::new("a\u{7}b").is_err());
        assert!(RoomId::new("x".repeat(MAX_ROOM_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_timestamp_arithmetic_saturates() {
        let earlier = Timestamp::new(1_000);
        let later = earlier + Duration::from_millis(500);
        assert_eq!(later.as_millis(), 1_500);
        assert_eq!(later - earlier, Duration::from_millis(500));
        assert_eq!(earlier - later, Duration::ZERO);
        assert_eq!(earlier.saturating_sub(Duration::from_secs(10)).as_millis(), 0);
    }

    #[test]
    fn test_manual_time_source() {
        let clock = ManualTimeSource::starting_at(10);
        clock.advance(Duration::from_millis(5));
        assert_eq!(clock.now().as_millis(), 15);
        let shared = std::sync::Arc::new(clock.clone());
        clock.advance(Duration::from_millis(5));
        assert_eq!(shared.now().as_millis(), 20);
    }
}
