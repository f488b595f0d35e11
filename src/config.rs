//! Tunnel timing and retry configuration
//!
//! Every field has the reference default, so a partial JSON file (or none at
//! all) is enough.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ============================================================================
// Defaults
// ============================================================================

/// Socket send/receive (and connect) timeout
pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 2000;

/// Overall budget for the address request exchange
pub const DEFAULT_ADDRESS_TIMEOUT_MS: u64 = 2000;

/// Consecutive stalled reads tolerated (each followed by a reconnect)
pub const DEFAULT_RECONNECT_LIMIT: u32 = 3;

/// Pause before each in-place reconnect
pub const DEFAULT_RETRY_INTERVAL_US: u64 = 100;

/// Ticks between two outbound heartbeats
pub const DEFAULT_HEARTBEAT_INTERVAL_TICKS: u32 = 20;

/// Seconds without an inbound heartbeat before the session is declared dead
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u32 = 60;

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub socket_timeout_ms: u64,
    pub address_timeout_ms: u64,
    pub reconnect_limit: u32,
    pub retry_interval_us: u64,
    pub heartbeat_interval_ticks: u32,
    pub heartbeat_timeout_secs: u32,
    /// Disable Nagle on the tunnel socket
    pub tcp_nodelay: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            socket_timeout_ms: DEFAULT_SOCKET_TIMEOUT_MS,
            address_timeout_ms: DEFAULT_ADDRESS_TIMEOUT_MS,
            reconnect_limit: DEFAULT_RECONNECT_LIMIT,
            retry_interval_us: DEFAULT_RETRY_INTERVAL_US,
            heartbeat_interval_ticks: DEFAULT_HEARTBEAT_INTERVAL_TICKS,
            heartbeat_timeout_secs: DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            tcp_nodelay: true,
        }
    }
}

impl TunnelConfig {
    /// Load a config from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn socket_timeout(&self) -> Option<Duration> {
        // A zero timeout means "block forever" for the socket layer
        if self.socket_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.socket_timeout_ms))
        }
    }

    pub fn address_timeout(&self) -> Duration {
        Duration::from_millis(self.address_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_micros(self.retry_interval_us)
    }
}
