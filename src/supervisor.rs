//! Liveness supervisor
//!
//! Driven by the host once per second. Each tick advances the connected
//! time, checks how long ago the peer's last heartbeat arrived, and sends our
//! own heartbeat every `heartbeat_interval_ticks`.

use std::sync::atomic::Ordering;

use crate::control;
use crate::session::{RelayExit, Session};
use crate::status::Status;

/// Result of one supervisor tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Relay not running; nothing was done
    Inactive,
    /// No heartbeat for too long; the relay has been told to shut down
    Expired,
    /// Relay healthy; counters after this tick
    Alive(Status),
}

/// Run one supervisor step
///
/// Never closes the socket: on expiry it only clears the running flag and
/// leaves teardown to the relay.
pub fn tick(session: &Session) -> Tick {
    if !session.is_open() || !session.is_running() {
        return Tick::Inactive;
    }

    let config = session.config();
    let counters = session.counters();

    let connected = counters.seconds_connected.fetch_add(1, Ordering::Relaxed) + 1;
    let last_heartbeat = counters.last_heartbeat.load(Ordering::Relaxed);
    if connected.saturating_sub(last_heartbeat) > config.heartbeat_timeout_secs {
        log::warn!(
            "No heartbeat for {} seconds, terminating",
            connected.saturating_sub(last_heartbeat)
        );
        session.shut_down(RelayExit::HeartbeatTimeout);
        return Tick::Expired;
    }

    let since_sent = counters.heartbeat_ticks.fetch_add(1, Ordering::Relaxed) + 1;
    if since_sent >= config.heartbeat_interval_ticks {
        counters.heartbeat_ticks.store(0, Ordering::Relaxed);
        log::debug!("Sending heartbeat (time: {})", connected);
        if let Err(e) = control::send_heartbeat(session) {
            log::warn!("Heartbeat send failed: {}", e);
        }
    }

    Tick::Alive(counters.snapshot())
}
