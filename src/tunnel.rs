//! Tunnel: owner of the single live session
//!
//! This is the operation surface the host drives:
//!
//! 1. `open(host, port)` - connect, reset counters
//! 2. `request_address()` - negotiate the tunnel address
//! 3. `start_relay(tun)` - blocks until the relay ends, then tears down
//! 4. `tick()` - once per second from the host's timer
//! 5. `stop()` - ask the relay to end; does not block

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::config::TunnelConfig;
use crate::control;
use crate::error::TunnelError;
use crate::relay;
use crate::session::{RelayExit, Session};
use crate::status::Status;
use crate::supervisor::{self, Tick};
use crate::transport::Transport;
use crate::tun::TunDevice;

pub struct Tunnel {
    config: TunnelConfig,
    session: Mutex<Option<Arc<Session>>>,
}

impl Tunnel {
    pub fn new(config: TunnelConfig) -> Self {
        Tunnel {
            config,
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Connect to `host:port`
    ///
    /// Only one session may be alive: opening while one is alive is refused
    /// with `SessionActive`.
    pub fn open(&self, host: &str, port: u16) -> Result<SocketAddr, TunnelError> {
        if self.is_connected() {
            return Err(TunnelError::SessionActive);
        }

        log::info!("Trying to connect {} (port: {})", host, port);
        let transport = Transport::connect(host, port, &self.config)?;
        let peer = transport.peer();

        // Connect runs unlocked; a racing open may have won meanwhile
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|s| s.is_open()) {
            return Err(TunnelError::SessionActive);
        }
        *slot = Some(Arc::new(Session::new(transport, self.config.clone())));
        Ok(peer)
    }

    /// Same as `open`, with the port given as text
    pub fn open_str(&self, host: &str, port: &str) -> Result<SocketAddr, TunnelError> {
        let port = port
            .trim()
            .parse()
            .map_err(|_| TunnelError::InvalidPort(port.to_string()))?;
        self.open(host, port)
    }

    /// Negotiate the tunnel address (configured timeout)
    ///
    /// On failure the session is closed and dropped.
    pub fn request_address(&self) -> Result<String, TunnelError> {
        let session = self.current().ok_or(TunnelError::NotConnected)?;
        let result = control::request_address(&session, self.config.address_timeout());
        if !session.is_open() {
            self.release(&session);
        }
        result
    }

    /// Relay between `tun` and the tunnel until shut down
    ///
    /// Blocks. When it returns the session is gone.
    pub fn start_relay<T: TunDevice>(&self, tun: &T) -> Result<RelayExit, TunnelError> {
        let session = self.current().ok_or(TunnelError::NotConnected)?;
        let exit = relay::run(&session, tun)?;
        self.release(&session);
        log::info!("Relay ended ({:?})", exit);
        Ok(exit)
    }

    /// One supervisor step; returns the status text while the relay runs
    pub fn tick(&self) -> Option<String> {
        let session = self.current()?;
        match supervisor::tick(&session) {
            Tick::Alive(status) => Some(status.to_string()),
            Tick::Inactive | Tick::Expired => None,
        }
    }

    /// Ask the relay to shut down
    pub fn stop(&self) {
        log::info!("Terminate requested");
        if let Some(session) = self.current() {
            session.stop();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some_and(|s| s.is_open())
    }

    pub fn status(&self) -> Option<Status> {
        self.current().map(|s| s.counters().snapshot())
    }

    /// Counters in Prometheus text format
    pub fn metrics(&self) -> Option<String> {
        self.status().map(|s| s.render_prometheus())
    }

    /// Raw socket descriptor of the live session
    #[cfg(unix)]
    pub fn socket_fd(&self) -> Option<std::os::unix::io::RawFd> {
        self.current().and_then(|s| s.transport().raw_fd())
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<Session>>> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn current(&self) -> Option<Arc<Session>> {
        self.slot().clone()
    }

    /// Drop `session` from the slot if it is still the current one
    fn release(&self, session: &Arc<Session>) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, session)) {
            *slot = None;
        }
    }
}

impl Default for Tunnel {
    fn default() -> Self {
        Tunnel::new(TunnelConfig::default())
    }
}
