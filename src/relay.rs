//! Duplex relay between the tun device and the tunnel socket
//!
//! ```text
//!              uplink (DataRequest)
//!   tun ────────────────────────────────► TCP
//!   tun ◄──────────────────────────────── TCP
//!              downlink (DataReply, Heartbeat)
//! ```
//!
//! Both directions run on their own thread and share only the session. Either
//! one (or the supervisor, or `stop`) clears the running flag; the other
//! notices at its next iteration. The uplink sleeps in a `mio` readiness wait
//! that the session's waker interrupts; the downlink notices within one
//! socket receive timeout.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::codec::{FrameKind, MAX_PAYLOAD};
use crate::error::TunnelError;
use crate::session::{Mode, RelayExit, Session};
use crate::tun::{self, TunDevice};

/// mio token for the tun descriptor
const TUN_TOKEN: Token = Token(0);

/// mio token for the shutdown waker
const WAKE_TOKEN: Token = Token(1);

/// Relay until shut down, then close the session
///
/// Blocks the caller until both directions have exited. This is the only
/// place a relaying session's socket is closed.
pub fn run<T: TunDevice>(session: &Session, tun: &T) -> Result<RelayExit, TunnelError> {
    session.enter(Mode::Relaying)?;

    let fd = tun.as_raw_fd();
    let saved_flags = tun::set_nonblocking(fd).map_err(|e| {
        log::error!("Failed to prepare tun device: {}", e);
        session.leave(Mode::Relaying);
        TunnelError::Io(e)
    })?;

    let poll = match prepare_uplink(session, fd) {
        Ok(poll) => poll,
        Err(e) => {
            log::error!("Failed to prepare tun device: {}", e);
            restore_tun(fd, saved_flags);
            session.leave(Mode::Relaying);
            return Err(TunnelError::Io(e));
        }
    };

    session.start_running();
    log::info!("Relay started (peer {})", session.transport().peer());

    thread::scope(|s| {
        s.spawn(|| uplink(session, tun, poll));
        s.spawn(|| downlink(session, tun));
    });

    session.install_waker(None);
    restore_tun(fd, saved_flags);
    session.close();
    log::info!("Socket shut down (relay ended)");

    Ok(session.exit_reason().unwrap_or(RelayExit::Stopped))
}

fn prepare_uplink(session: &Session, fd: RawFd) -> io::Result<Poll> {
    let poll = Poll::new()?;
    poll.registry()
        .register(&mut SourceFd(&fd), TUN_TOKEN, Interest::READABLE)?;
    let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
    session.install_waker(Some(Arc::new(waker)));

    Ok(poll)
}

/// Hand the descriptor back with the flags the host gave it
fn restore_tun(fd: RawFd, flags: libc::c_int) {
    if let Err(e) = tun::restore_flags(fd, flags) {
        log::warn!("Failed to restore tun descriptor flags: {}", e);
    }
}

// ============================================================================
// Uplink: tun -> DataRequest
// ============================================================================

fn uplink<T: TunDevice>(session: &Session, tun: &T, mut poll: Poll) {
    let mut events = Events::with_capacity(16);
    let mut buf = vec![0u8; MAX_PAYLOAD];

    while session.is_running() {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("Tun poll failed: {}", e);
            session.shut_down(RelayExit::TunReadFailed);
            break;
        }

        for event in events.iter() {
            if event.token() == TUN_TOKEN {
                drain_tun(session, tun, &mut buf);
            }
        }
    }

    log::debug!("Uplink ends");
}

/// Forward every packet the tun device has ready
fn drain_tun<T: TunDevice>(session: &Session, tun: &T, buf: &mut [u8]) {
    while session.is_running() {
        let len = match tun.recv(buf) {
            // Empty read: nothing to forward, keep draining
            Ok(0) => continue,
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::error!("Tun read failed: {}", e);
                session.shut_down(RelayExit::TunReadFailed);
                return;
            }
        };

        match session.send(FrameKind::DataRequest, &buf[..len]) {
            Ok(sent) => {
                session.counters().bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                log::trace!("Uplink packet ({} bytes)", len);
            }
            // Stopped between the check and the send
            Err(TunnelError::NotActive) => return,
            Err(e) => {
                log::error!("Uplink send failed: {}", e);
                session.shut_down(RelayExit::SendFailed);
                return;
            }
        }
    }
}

// ============================================================================
// Downlink: frames -> tun
// ============================================================================

fn downlink<T: TunDevice>(session: &Session, tun: &T) {
    while session.is_running() {
        let frame = match session.read_frame(None) {
            Ok(frame) => frame,
            Err(e) => {
                if session.is_running() {
                    log::info!("Tunnel stream ended: {}", e);
                }
                session.shut_down(RelayExit::StreamClosed);
                break;
            }
        };

        match frame.kind {
            FrameKind::DataReply => {
                match tun.send(&frame.payload) {
                    Ok(n) if n == frame.payload.len() => {
                        session
                            .counters()
                            .bytes_received
                            .fetch_add(frame.wire_len() as u64, Ordering::Relaxed);
                        log::trace!("Downlink packet ({} bytes)", n);
                    }
                    Ok(n) => {
                        log::error!("System tunnel down (short write {}/{})", n, frame.payload.len());
                        session.shut_down(RelayExit::TunWriteFailed);
                        break;
                    }
                    Err(e) => {
                        log::error!("System tunnel down: {}", e);
                        session.shut_down(RelayExit::TunWriteFailed);
                        break;
                    }
                }
            }
            FrameKind::Heartbeat => {
                let counters = session.counters();
                let now = counters.seconds_connected.load(Ordering::Relaxed);
                counters.last_heartbeat.store(now, Ordering::Relaxed);
                log::debug!("Heartbeat received (time: {})", now);
            }
            other => {
                log::debug!("Ignoring {:?} frame ({} bytes)", other, frame.payload.len());
            }
        }
    }

    log::debug!("Downlink ends");
}
