//! Tun-over-TCP tunnel client
//!
//! This crate provides the core of a tunnel client that bridges a local tun
//! device to a remote server over one TCP connection:
//! - Length-prefixed framing of data and control messages
//! - Address negotiation before the relay starts
//! - Duplex relay between the tun device and the socket
//! - Heartbeat-based liveness supervision driven by an external tick
//! - FFI interface for host applications
//!
//! # Lifecycle
//!
//! ```text
//! open ──► request_address ──► start_relay (blocks) ──► session gone
//!                                   ▲
//!                  tick (1/s) ──────┤
//!                  stop ────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod ffi;
pub mod relay;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod transport;
pub mod tun;
pub mod tunnel;

pub use codec::{Frame, FrameKind, MAX_PAYLOAD};
pub use config::TunnelConfig;
pub use control::AddressLease;
pub use error::TunnelError;
pub use session::{Mode, RelayExit, Session};
pub use status::Status;
pub use tun::{HostTun, TunDevice};
pub use tunnel::Tunnel;
