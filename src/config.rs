//! Peer session configuration
//!
//! All timings are in milliseconds. `PeerConfig::default()` carries the
//! production values; a JSON document may override any subset of them.

use serde::{Deserialize, Serialize};

use crate::error::PeerError;

// ============================================================================
// Constants
// ============================================================================

/// Handshake attempts without success before address rediscovery starts
pub const MAX_HANDSHAKE_COUNT: u32 = 2;

/// Initial nominal routing backoff length (1 second)
pub const INITIAL_ROUTING_BACKOFF_LENGTH: u64 = 1_000;

/// How much to multiply by during routing backoff
pub const BACKOFF_MULTIPLIER: u64 = 2;

/// Upper limit on routing backoff (3 hours)
pub const MAX_ROUTING_BACKOFF_LENGTH: u64 = 3 * 60 * 60 * 1_000;

/// Handshake address refresh cooldown (5 minutes)
pub const HANDSHAKE_ADDRESS_REFRESH_INTERVAL: u64 = 5 * 60 * 1_000;

/// Queued bytes after which the packet sender is woken up
pub const WAKE_THRESHOLD_BYTES: usize = 1_024;

/// Maximum outstanding link pings
pub const MAX_PINGS: usize = 5;

// ============================================================================
// Configuration
// ============================================================================

/// Tunable timings and thresholds for one peer session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// A negotiation context unused for this long is no longer live
    pub handshake_timeout: u64,
    /// Normal handshake retry interval (fixed part)
    pub min_handshake_interval: u64,
    /// Normal handshake retry interval (random part)
    pub randomized_handshake_interval: u64,
    /// Interval while our version cannot be classified compatible
    pub min_version_probe_interval: u64,
    pub randomized_version_probe_interval: u64,
    /// Presence-only interval for verified incompatible peers
    pub min_version_send_interval: u64,
    pub randomized_version_send_interval: u64,
    /// Pause between handshake bursts in burst-only mode
    pub min_burst_pause: u64,
    pub randomized_burst_pause: u64,
    /// Burst size is min + random(0..randomized)
    pub min_burst_size: u32,
    pub randomized_burst_size: u32,
    /// Failed attempts before an ARK fetch is started
    pub max_handshake_count: u32,
    /// Handshake candidate refresh cooldown
    pub handshake_address_refresh_interval: u64,
    pub initial_backoff_length: u64,
    pub backoff_multiplier: u64,
    pub max_backoff_length: u64,
    /// Half-life of the backed-off-percent average
    pub backoff_percent_half_life: u64,
    /// Half-life of the overload-rejection probability
    pub rejected_half_life: u64,
    pub wake_threshold_bytes: usize,
    /// Requeues larger than this are rate limited in the log
    pub requeue_log_threshold: usize,
    pub requeue_log_interval: u64,
    pub max_pings: usize,
    pub ping_half_life: u64,
    /// Low-level ping reply timeout
    pub ping_timeout: u64,
    pub sync_send_timeout: u64,
    /// Silence after which the scheduler should call `disconnected()`
    pub max_peer_inactivity: u64,
    /// Routable-connection counters are halved at this many checks
    pub routable_check_cap: u64,
    /// Peer-added time is forgotten after this long
    pub peer_added_expiry: u64,
    /// Delay before a pending ack becomes urgent
    pub ack_delay: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: 5_000,
            min_handshake_interval: 10_000,
            randomized_handshake_interval: 5_000,
            min_version_probe_interval: 20_000,
            randomized_version_probe_interval: 10_000,
            min_version_send_interval: 120_000,
            randomized_version_send_interval: 60_000,
            min_burst_pause: 120_000,
            randomized_burst_pause: 180_000,
            min_burst_size: 1,
            randomized_burst_size: 3,
            max_handshake_count: MAX_HANDSHAKE_COUNT,
            handshake_address_refresh_interval: HANDSHAKE_ADDRESS_REFRESH_INTERVAL,
            initial_backoff_length: INITIAL_ROUTING_BACKOFF_LENGTH,
            backoff_multiplier: BACKOFF_MULTIPLIER,
            max_backoff_length: MAX_ROUTING_BACKOFF_LENGTH,
            backoff_percent_half_life: 180_000,
            rejected_half_life: 600_000,
            wake_threshold_bytes: WAKE_THRESHOLD_BYTES,
            requeue_log_threshold: 15,
            requeue_log_interval: 1_000,
            max_pings: MAX_PINGS,
            ping_half_life: 600_000,
            ping_timeout: 2_000,
            sync_send_timeout: 60_000,
            max_peer_inactivity: 60_000,
            routable_check_cap: 200_000,
            peer_added_expiry: 30 * 24 * 60 * 60 * 1_000,
            ack_delay: 200,
        }
    }
}

impl PeerConfig {
    /// Parse a (possibly partial) JSON override document
    pub fn from_json(json: &str) -> Result<Self, PeerError> {
        let config: PeerConfig =
            serde_json::from_str(json).map_err(|e| PeerError::parse(format!("config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break the schedulers
    pub fn validate(&self) -> Result<(), PeerError> {
        if self.initial_backoff_length == 0 {
            return Err(PeerError::parse("config: initial_backoff_length must be > 0"));
        }
        if self.max_backoff_length < self.initial_backoff_length {
            return Err(PeerError::parse(
                "config: max_backoff_length must be >= initial_backoff_length",
            ));
        }
        if self.backoff_multiplier < 1 {
            return Err(PeerError::parse("config: backoff_multiplier must be >= 1"));
        }
        if self.max_pings == 0 {
            return Err(PeerError::parse("config: max_pings must be > 0"));
        }
        Ok(())
    }
}
