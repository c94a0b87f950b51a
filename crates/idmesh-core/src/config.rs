//! Timing configuration for the background services.
//!
//! The intervals live in explicit structs rather than module constants so
//! tests can shrink them to milliseconds.

use std::time::Duration;

/// Timing for the announce manager.
#[derive(Debug, Clone)]
pub struct AnnounceConfig {
    /// Quiet period after a change before re-signing; coalesces edit bursts
    pub debounce: Duration,
    /// How long a signed announcement stays valid; also the proactive
    /// re-sign cadence
    pub longevity: Duration,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(10),
            longevity: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Timing for the protocol handler.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// How often to re-gossip one random stored identity
    pub gossip_interval: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_secs(71),
        }
    }
}
