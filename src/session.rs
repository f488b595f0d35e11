//! Process-wide state of one tunnel connection
//!
//! A `Session` is created by `Tunnel::open` and shared (through `Arc`) with
//! the relay threads and the supervisor tick. Everything mutable in here is
//! atomic; the socket handle itself lives behind the transport's lock.
//!
//! # Use-modes
//!
//! ```text
//!            request_address            start_relay
//!   Idle ───────────────────► AwaitingAddress     Idle ─────────► Relaying
//!    ▲                              │                                │
//!    └────────── reply ─────────────┘                                │
//!                                   │ timeout                        │ teardown
//!                                   ▼                                ▼
//!                                 Closed ◄───────────────────────── Closed
//! ```
//!
//! Address negotiation and relay are mutually exclusive: each one enters its
//! mode with a compare-and-swap from `Idle`.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mio::Waker;

use crate::codec::{self, DecodeError, Frame, FrameKind};
use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::status::Counters;
use crate::transport::{self, Transport};

// ============================================================================
// Mode
// ============================================================================

/// Current use-mode of the session
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle = 0,
    AwaitingAddress = 1,
    Relaying = 2,
    Closed = 3,
}

impl Mode {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Mode::Idle,
            1 => Mode::AwaitingAddress,
            2 => Mode::Relaying,
            _ => Mode::Closed,
        }
    }
}

// ============================================================================
// Relay exit reason
// ============================================================================

/// Why a relay ended
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// `stop()` was called
    Stopped = 1,
    /// No heartbeat observed within the liveness deadline
    HeartbeatTimeout = 2,
    /// Frame decode failed (peer closed, stall limit reached, garbage)
    StreamClosed = 3,
    /// Sending a frame to the peer failed
    SendFailed = 4,
    /// Reading from the tun device failed
    TunReadFailed = 5,
    /// Writing to the tun device failed or was short
    TunWriteFailed = 6,
}

impl RelayExit {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RelayExit::Stopped),
            2 => Some(RelayExit::HeartbeatTimeout),
            3 => Some(RelayExit::StreamClosed),
            4 => Some(RelayExit::SendFailed),
            5 => Some(RelayExit::TunReadFailed),
            6 => Some(RelayExit::TunWriteFailed),
            _ => None,
        }
    }
}

const NO_EXIT: u8 = 0;

// ============================================================================
// Session
// ============================================================================

pub struct Session {
    transport: Transport,
    config: TunnelConfig,
    mode: AtomicU8,
    /// Relay liveness; cleared by stop, staleness and fatal loop errors
    running: AtomicBool,
    /// First recorded RelayExit (NO_EXIT until then)
    exit: AtomicU8,
    counters: Counters,
    /// Wakes the uplink's readiness wait on shutdown
    waker: Mutex<Option<Arc<Waker>>>,
}

impl Session {
    pub fn new(transport: Transport, config: TunnelConfig) -> Self {
        Session {
            transport,
            config,
            mode: AtomicU8::new(Mode::Idle as u8),
            running: AtomicBool::new(false),
            exit: AtomicU8::new(NO_EXIT),
            counters: Counters::new(),
            waker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn mode(&self) -> Mode {
        Mode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Socket handle still present
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Relaying or awaiting an address: sends and receives are allowed
    pub fn is_active(&self) -> bool {
        self.is_running() || self.mode() == Mode::AwaitingAddress
    }

    pub fn exit_reason(&self) -> Option<RelayExit> {
        RelayExit::from_u8(self.exit.load(Ordering::Acquire))
    }

    // ------------------------------------------------------------------------
    // Mode transitions
    // ------------------------------------------------------------------------

    /// Move from `Idle` into `mode`
    pub(crate) fn enter(&self, mode: Mode) -> Result<(), TunnelError> {
        match self.mode.compare_exchange(
            Mode::Idle as u8,
            mode as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(current) => match Mode::from_u8(current) {
                Mode::Closed => Err(TunnelError::NotConnected),
                other => Err(TunnelError::Busy(other)),
            },
        }
    }

    /// Return from `mode` to `Idle` (no-op if the session moved on)
    pub(crate) fn leave(&self, mode: Mode) {
        let _ = self.mode.compare_exchange(
            mode as u8,
            Mode::Idle as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn start_running(&self) {
        self.exit.store(NO_EXIT, Ordering::Release);
        self.running.store(true, Ordering::Release);
    }

    pub(crate) fn install_waker(&self, waker: Option<Arc<Waker>>) {
        *self.waker.lock().unwrap_or_else(|p| p.into_inner()) = waker;
    }

    /// Clear the running flag and wake the relay loops
    ///
    /// The first reason recorded wins. Does not touch the socket: the relay
    /// teardown owns that.
    pub fn shut_down(&self, reason: RelayExit) {
        let _ = self
            .exit
            .compare_exchange(NO_EXIT, reason as u8, Ordering::AcqRel, Ordering::Acquire);
        if self.running.swap(false, Ordering::AcqRel) {
            log::info!("Relay shutting down ({:?})", reason);
        }

        let waker = self.waker.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if let Some(waker) = waker {
            if let Err(e) = waker.wake() {
                log::warn!("Failed to wake uplink: {}", e);
            }
        }
    }

    /// Cooperative stop request; returns immediately
    pub fn stop(&self) {
        self.shut_down(RelayExit::Stopped);
    }

    /// Shut the socket down and mark the session closed
    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
        self.mode.store(Mode::Closed as u8, Ordering::Release);
        self.transport.close();
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Send an already-encoded frame
    ///
    /// Rejected unless the session is relaying or awaiting an address.
    pub fn send_frame(&self, bytes: &[u8]) -> Result<usize, TunnelError> {
        if !self.is_active() {
            return Err(TunnelError::NotActive);
        }
        self.transport.send(bytes).map_err(|e| {
            log::error!("Failed to write frame ({} bytes): {}", bytes.len(), e);
            TunnelError::Io(e)
        })
    }

    /// Encode and send one frame
    pub fn send(&self, kind: FrameKind, payload: &[u8]) -> Result<usize, TunnelError> {
        let encoded = codec::encode(kind, payload)?;
        self.send_frame(&encoded)
    }

    // ------------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------------

    /// Read exactly `buf.len()` bytes
    ///
    /// Returns how many bytes were gathered. Anything short of `buf.len()`
    /// means the stream is unusable: the peer closed, the session stopped
    /// being active, or the stall limit was reached.
    pub fn recv_exact(&self, buf: &mut [u8]) -> usize {
        let mut received = 0;
        while received < buf.len() {
            let n = self.recv_some(&mut buf[received..], Wait::STRICT);
            if n == 0 {
                break;
            }
            received += n;
        }
        received
    }

    /// Decode the next frame from the socket
    ///
    /// While no byte of the frame has arrived, receive timeouts mean the link
    /// is quiet and are not counted as stalls. `deadline` bounds that wait.
    pub fn read_frame(&self, deadline: Option<Instant>) -> Result<Frame, DecodeError> {
        let mut reader = FrameReader {
            session: self,
            consumed: 0,
            deadline,
        };
        codec::decode(&mut reader)
    }

    /// One read of at least one byte, or 0 if the read gave up
    fn recv_some(&self, buf: &mut [u8], wait: Wait) -> usize {
        let mut stalls = 0;

        while self.is_active() {
            let result = match wait.remaining() {
                Some(left) => self.transport.recv_within(buf, left),
                None => self.transport.recv(buf),
            };
            let err = match result {
                Ok(0) => {
                    log::debug!("Peer closed the stream");
                    return 0;
                }
                Ok(n) => return n,
                Err(e) => e,
            };

            if wait.expired() {
                return 0;
            }

            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::NotConnected => return 0,
                _ if wait.idle_ok && transport::is_timeout(&err) => continue,
                _ => {}
            }

            if stalls == self.config.reconnect_limit {
                log::warn!("Receive stalled {} times, giving up: {}", stalls, err);
                return 0;
            }
            stalls += 1;
            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);

            thread::sleep(self.config.retry_interval());
            log::debug!("Receive failed ({}), reconnecting (attempt {})", err, stalls);
            if let Err(e) = self.transport.reconnect() {
                log::debug!("Reconnect to {} failed: {}", self.transport.peer(), e);
            }
        }

        0
    }
}

// ============================================================================
// Frame reader
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Wait {
    /// Timeouts are "no data yet" rather than stalls
    idle_ok: bool,
    deadline: Option<Instant>,
}

impl Wait {
    const STRICT: Wait = Wait {
        idle_ok: false,
        deadline: None,
    };

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Time left before the deadline, if there is one
    fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// `Read` adapter handing the session's receive policy to the codec
///
/// Returning `Ok(0)` when the session gives up makes `read_exact` fail, which
/// the codec reports as a truncated frame.
struct FrameReader<'a> {
    session: &'a Session,
    consumed: usize,
    deadline: Option<Instant>,
}

impl Read for FrameReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let wait = Wait {
            idle_ok: self.consumed == 0,
            deadline: self.deadline,
        };
        let n = self.session.recv_some(buf, wait);
        self.consumed += n;
        Ok(n)
    }
}

// ============================================================================
// Test helpers
// ============================================================================
