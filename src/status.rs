//! Session counters and their human-readable / Prometheus renderings
//!
//! Counters are plain atomics: they are written from the uplink thread, the
//! downlink thread and the host's tick thread without any lock.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Live counters of one session
#[derive(Debug, Default)]
pub struct Counters {
    /// Wire bytes of DataRequest frames sent
    pub bytes_sent: AtomicU64,
    /// Wire bytes of DataReply frames received
    pub bytes_received: AtomicU64,
    /// Supervisor ticks since relay start (one per second)
    pub seconds_connected: AtomicU32,
    /// `seconds_connected` value when the last heartbeat arrived
    pub last_heartbeat: AtomicU32,
    /// Ticks since the last heartbeat we sent
    pub heartbeat_ticks: AtomicU32,
    /// In-place reconnect attempts after stalled reads
    pub reconnects: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Status {
        Status {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            seconds_connected: self.seconds_connected.load(Ordering::Relaxed),
            last_heartbeat: self.last_heartbeat.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub seconds_connected: u32,
    pub last_heartbeat: u32,
    pub reconnects: u64,
}

impl Status {
    /// Seconds since the last inbound heartbeat
    pub fn heartbeat_age(&self) -> u32 {
        self.seconds_connected.saturating_sub(self.last_heartbeat)
    }

    /// Render in Prometheus text exposition format
    pub fn render_prometheus(&self) -> String {
        format!(
            "# HELP tun_relay_sent_bytes_total Wire bytes of data frames sent\n\
             # TYPE tun_relay_sent_bytes_total counter\n\
             tun_relay_sent_bytes_total {}\n\
             # HELP tun_relay_received_bytes_total Wire bytes of data frames received\n\
             # TYPE tun_relay_received_bytes_total counter\n\
             tun_relay_received_bytes_total {}\n\
             # HELP tun_relay_reconnects_total In-place reconnects after stalled reads\n\
             # TYPE tun_relay_reconnects_total counter\n\
             tun_relay_reconnects_total {}\n\
             # HELP tun_relay_connected_seconds Seconds the relay has been running\n\
             # TYPE tun_relay_connected_seconds gauge\n\
             tun_relay_connected_seconds {}\n\
             # HELP tun_relay_heartbeat_age_seconds Seconds since the last inbound heartbeat\n\
             # TYPE tun_relay_heartbeat_age_seconds gauge\n\
             tun_relay_heartbeat_age_seconds {}\n",
            self.bytes_sent,
            self.bytes_received,
            self.reconnects,
            self.seconds_connected,
            self.heartbeat_age(),
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Sent: {}\nReceived: {}\nTime connected: {}",
            pretty_size(self.bytes_sent),
            pretty_size(self.bytes_received),
            pretty_time(self.seconds_connected as u64),
        )
    }
}

// ============================================================================
// Pretty printing
// ============================================================================

fn pretty(mut value: u64, scale: u64, units: &[&str]) -> String {
    let mut unit = 0;
    while value > scale && unit < units.len() - 1 {
        value /= scale;
        unit += 1;
    }
    format!("{} {}", value, units[unit])
}

/// e.g. `1500` -> `"1 KBytes"`
pub fn pretty_size(bytes: u64) -> String {
    pretty(bytes, 1024, &["Bytes", "KBytes", "MBytes", "GBytes"])
}

/// e.g. `125` -> `"2 min(s)"`
pub fn pretty_time(seconds: u64) -> String {
    pretty(seconds, 60, &["s", "min(s)"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pretty_size() {
        assert_eq!(pretty_size(0), "0 Bytes");
        assert_eq!(pretty_size(1024), "1024 Bytes");
        assert_eq!(pretty_size(1500), "1 KBytes");
        assert_eq!(pretty_size(3 * 1024 * 1024 + 1), "3 MBytes");
        assert_eq!(pretty_size(5 * 1024 * 1024 * 1024 + 1), "5 GBytes");
        // Largest unit caps the scaling
        assert_eq!(pretty_size(2048 * 1024 * 1024 * 1024), "2048 GBytes");
    }

    #[test]
    fn test_pretty_time() {
        assert_eq!(pretty_time(59), "59 s");
        assert_eq!(pretty_time(60), "60 s");
        assert_eq!(pretty_time(125), "2 min(s)");
        assert_eq!(pretty_time(7200), "120 min(s)");
    }

    #[test]
    fn test_status_display() {
        let counters = Counters::new();
        counters.bytes_sent.fetch_add(1205, Ordering::Relaxed);
        counters.bytes_received.fetch_add(305, Ordering::Relaxed);
        counters.seconds_connected.store(61, Ordering::Relaxed);

        assert_eq!(
            counters.snapshot().to_string(),
            "Sent: 1 KBytes\nReceived: 305 Bytes\nTime connected: 1 min(s)"
        );
    }

    #[test]
    fn test_heartbeat_age() {
        let status = Status {
            seconds_connected: 45,
            last_heartbeat: 40,
            ..Status::default()
        };
        assert_eq!(status.heartbeat_age(), 5);
    }

    #[test]
    fn test_render_prometheus() {
        let counters = Counters::new();
        counters.bytes_sent.fetch_add(42, Ordering::Relaxed);
        counters.reconnects.fetch_add(2, Ordering::Relaxed);
        counters.seconds_connected.store(30, Ordering::Relaxed);
        counters.last_heartbeat.store(20, Ordering::Relaxed);

        let output = counters.snapshot().render_prometheus();
        assert!(output.contains("tun_relay_sent_bytes_total 42"));
        assert!(output.contains("tun_relay_received_bytes_total 0"));
        assert!(output.contains("tun_relay_reconnects_total 2"));
        assert!(output.contains("tun_relay_connected_seconds 30"));
        assert!(output.contains("tun_relay_heartbeat_age_seconds 10"));
        assert!(output.contains("# TYPE tun_relay_sent_bytes_total counter"));
        assert!(output.contains("# TYPE tun_relay_connected_seconds gauge"));
    }
}
