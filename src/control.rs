//! Control protocol: address negotiation and heartbeats
//!
//! # Address negotiation
//!
//! ```text
//! Client                         Server
//!   │──── AddressRequest ──────────►│
//!   │◄─── AddressReply "a r d d d" ─│
//! ```
//!
//! The reply is a whitespace-separated text record. The first field is the
//! tunnel address handed to the client; the rest (route, DNS servers) are
//! passed through for the host to configure the interface.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::codec::FrameKind;
use crate::error::TunnelError;
use crate::session::{Mode, Session};

/// Run the address request exchange
///
/// Frames other than AddressReply received meanwhile are dropped. On timeout
/// or stream failure the session is closed.
pub fn request_address(session: &Session, timeout: Duration) -> Result<String, TunnelError> {
    session.enter(Mode::AwaitingAddress)?;
    let deadline = Instant::now() + timeout;

    log::debug!("Sending address request");
    if let Err(e) = session.send(FrameKind::AddressRequest, &[]) {
        session.close();
        log::warn!("Address request could not be sent: {}", e);
        return Err(e);
    }

    while Instant::now() < deadline {
        let frame = match session.read_frame(Some(deadline)) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("No address reply: {}", e);
                break;
            }
        };

        if frame.kind == FrameKind::AddressReply {
            let address = reply_text(&frame.payload);
            session.leave(Mode::AwaitingAddress);
            log::info!("Received address reply: {}", address);
            return Ok(address);
        }

        // Nothing is relayed yet; early data and heartbeats are dropped
        log::debug!("Discarding {:?} frame while awaiting address", frame.kind);
    }

    session.close();
    log::info!("Socket shut down (address request timeout)");
    Err(TunnelError::AddressTimeout)
}

/// Send one empty heartbeat frame
///
/// Does nothing if the session is not active.
pub fn send_heartbeat(session: &Session) -> Result<(), TunnelError> {
    if !session.is_active() {
        return Ok(());
    }
    session.send(FrameKind::Heartbeat, &[])?;
    Ok(())
}

/// Reply payload as text, cut at the first NUL and trimmed
fn reply_text(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).trim().to_string()
}

// ============================================================================
// Address lease
// ============================================================================

/// Parsed form of an address reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressLease {
    /// Address assigned to the tun interface
    pub address: IpAddr,
    /// Remaining IP fields in reply order (route, then DNS servers)
    pub extra: Vec<IpAddr>,
}

impl AddressLease {
    /// Parse `"<address> [<ip>...]"`; unparsable extra fields are skipped
    pub fn parse(reply: &str) -> Option<Self> {
        let mut fields = reply.split_whitespace();
        let address = fields.next()?.parse().ok()?;
        let extra = fields.filter_map(|f| f.parse().ok()).collect();
        Some(AddressLease { address, extra })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::config::TunnelConfig;
    use crate::session::test_support::*;
    use std::io::Read;
    use std::thread;

    fn read_request(server: &mut std::net::TcpStream) -> codec::Frame {
        codec::decode(server).unwrap()
    }

    #[test]
    fn test_request_address_success() {
        let (session, mut server, _listener) = connected_session(fast_config());

        let responder = thread::spawn(move || {
            let request = read_request(&mut server);
            assert_eq!(request.kind, FrameKind::AddressRequest);
            assert!(request.payload.is_empty());
            codec::write_frame(&mut server, FrameKind::AddressReply, b"198.51.100.5\0").unwrap();
            server
        });

        let address = request_address(&session, Duration::from_secs(2)).unwrap();
        assert_eq!(address, "198.51.100.5");
        assert_eq!(session.mode(), Mode::Idle);
        assert!(session.is_open());
        let _server = responder.join().unwrap();
    }

    #[test]
    fn test_request_address_discards_other_frames() {
        let (session, mut server, _listener) = connected_session(fast_config());

        let responder = thread::spawn(move || {
            read_request(&mut server);
            codec::write_frame(&mut server, FrameKind::Heartbeat, &[]).unwrap();
            codec::write_frame(&mut server, FrameKind::DataReply, &[0x45; 40]).unwrap();
            codec::write_frame(&mut server, FrameKind::AddressReply, b"10.8.0.2 0.0.0.0 8.8.8.8").unwrap();
            server
        });

        let address = request_address(&session, Duration::from_secs(2)).unwrap();
        assert_eq!(address, "10.8.0.2 0.0.0.0 8.8.8.8");
        let _server = responder.join().unwrap();
    }

    #[test]
    fn test_request_address_timeout_closes_session() {
        let (session, mut server, _listener) = connected_session(fast_config());

        let start = Instant::now();
        let result = request_address(&session, Duration::from_millis(200));
        assert!(matches!(result, Err(TunnelError::AddressTimeout)));
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(!session.is_open());
        assert_eq!(session.mode(), Mode::Closed);

        // The request did go out before the wait started
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(buf[4], 100);
    }

    #[test]
    fn test_late_reply_after_discarded_frame_times_out() {
        // A socket timeout longer than the address budget
        let config = TunnelConfig {
            socket_timeout_ms: 1000,
            ..fast_config()
        };
        let (session, mut server, _listener) = connected_session(config);

        let responder = thread::spawn(move || {
            read_request(&mut server);
            thread::sleep(Duration::from_millis(100));
            codec::write_frame(&mut server, FrameKind::Heartbeat, &[]).unwrap();
            thread::sleep(Duration::from_millis(500));
            let _ = codec::write_frame(&mut server, FrameKind::AddressReply, b"198.51.100.5");
            server
        });

        let start = Instant::now();
        let result = request_address(&session, Duration::from_millis(300));
        assert!(matches!(result, Err(TunnelError::AddressTimeout)));
        assert!(start.elapsed() < Duration::from_millis(550));
        assert!(!session.is_open());
        let _server = responder.join().unwrap();
    }

    #[test]
    fn test_request_address_rejected_during_relay() {
        let (session, _server, _listener) = connected_session(fast_config());
        session.enter(Mode::Relaying).unwrap();

        let result = request_address(&session, Duration::from_millis(100));
        assert!(matches!(result, Err(TunnelError::Busy(Mode::Relaying))));
        // Rejection leaves the running session untouched
        assert!(session.is_open());
    }

    #[test]
    fn test_heartbeat_ignored_when_inactive() {
        let (session, _server, _listener) = connected_session(fast_config());
        send_heartbeat(&session).unwrap();
        assert_eq!(session.counters().snapshot().bytes_sent, 0);
    }

    #[test]
    fn test_heartbeat_frame() {
        let (session, mut server, _listener) = connected_session(fast_config());
        session.start_running();
        send_heartbeat(&session).unwrap();

        let frame = codec::decode(&mut server).unwrap();
        assert_eq!(frame.kind, FrameKind::Heartbeat);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_address_lease_parse() {
        let lease = AddressLease::parse("13.8.0.2 0.0.0.0 202.38.120.242 8.8.8.8 202.106.0.20").unwrap();
        assert_eq!(lease.address, "13.8.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(lease.extra.len(), 4);

        let single = AddressLease::parse("198.51.100.5").unwrap();
        assert!(single.extra.is_empty());

        assert!(AddressLease::parse("").is_none());
        assert!(AddressLease::parse("not-an-ip").is_none());
    }

    #[test]
    fn test_reply_text() {
        assert_eq!(reply_text(b"10.0.0.1\0garbage"), "10.0.0.1");
        assert_eq!(reply_text(b"  10.0.0.1 \n"), "10.0.0.1");
    }
}
