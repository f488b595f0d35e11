//! TCP transport for the tunnel
//!
//! Owns the socket handle. Resolution tries every address the resolver
//! returns, in order, and keeps the first one that connects. The resolved peer
//! is remembered so a stalled stream can be replaced in place.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::config::TunnelConfig;
use crate::error::TunnelError;

/// Socket options applied to every stream (initial and reconnected)
#[derive(Debug, Clone, Copy)]
struct SocketOptions {
    timeout: Option<Duration>,
    nodelay: bool,
}

impl SocketOptions {
    fn from_config(config: &TunnelConfig) -> Self {
        SocketOptions {
            timeout: config.socket_timeout(),
            nodelay: config.tcp_nodelay,
        }
    }

    fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let stream = match self.timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
            None => TcpStream::connect(addr)?,
        };
        stream.set_nodelay(self.nodelay)?;
        stream.set_read_timeout(self.timeout)?;
        stream.set_write_timeout(self.timeout)?;
        Ok(stream)
    }
}

/// Connected TCP stream plus the peer it was resolved to
pub struct Transport {
    peer: SocketAddr,
    options: SocketOptions,
    /// None once closed
    stream: RwLock<Option<Arc<TcpStream>>>,
    /// Serializes writers so frames go out whole
    send_lock: Mutex<()>,
}

impl Transport {
    /// Resolve `host:port` and connect to the first address that accepts
    pub fn connect(host: &str, port: u16, config: &TunnelConfig) -> Result<Self, TunnelError> {
        let target = format!("{}:{}", host, port);
        let candidates: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| TunnelError::Resolve(host.to_string(), e))?
            .collect();

        let options = SocketOptions::from_config(config);
        for addr in candidates {
            log::debug!("Trying {} (resolved from {})", addr, target);
            match options.connect(addr) {
                Ok(stream) => {
                    log::info!("Connected to {}", addr);
                    return Ok(Transport {
                        peer: addr,
                        options,
                        stream: RwLock::new(Some(Arc::new(stream))),
                        send_lock: Mutex::new(()),
                    });
                }
                Err(e) => log::debug!("connect({}) failed: {}", addr, e),
            }
        }

        Err(TunnelError::Connect(target))
    }

    /// Resolved peer address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        self.current().is_some()
    }

    /// OS handle of the current socket (for hosts that protect it from routing)
    #[cfg(unix)]
    pub fn raw_fd(&self) -> Option<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;
        self.current().map(|s| s.as_raw_fd())
    }

    fn current(&self) -> Option<Arc<TcpStream>> {
        match self.stream.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Write the whole buffer or fail
    ///
    /// Partial writes are not retried: a short write leaves the stream
    /// misaligned and is reported as an error.
    pub fn send(&self, bytes: &[u8]) -> io::Result<usize> {
        let stream = self.current().ok_or_else(not_connected)?;
        let _guard = self.send_lock.lock().unwrap_or_else(|p| p.into_inner());

        let sent = (&*stream).write(bytes)?;
        if sent < bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write ({}/{})", sent, bytes.len()),
            ));
        }
        Ok(sent)
    }

    /// One read from the socket
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let stream = self.current().ok_or_else(not_connected)?;
        (&*stream).read(buf)
    }

    /// One read that waits at most `limit` (and never past the socket timeout)
    ///
    /// The socket timeout is restored afterwards. A zero `limit` fails with
    /// `TimedOut` without reading.
    pub fn recv_within(&self, buf: &mut [u8], limit: Duration) -> io::Result<usize> {
        let stream = self.current().ok_or_else(not_connected)?;
        let bound = match self.options.timeout {
            Some(timeout) => timeout.min(limit),
            None => limit,
        };
        if bound.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "deadline reached"));
        }

        stream.set_read_timeout(Some(bound))?;
        let result = (&*stream).read(buf);
        if let Err(e) = stream.set_read_timeout(self.options.timeout) {
            log::debug!("Failed to restore read timeout: {}", e);
        }
        result
    }

    /// Replace the stream with a fresh connection to the same peer
    ///
    /// Does nothing if the transport has been closed.
    pub fn reconnect(&self) -> io::Result<()> {
        if !self.is_open() {
            return Err(not_connected());
        }

        let fresh = self.options.connect(self.peer)?;
        let mut guard = self.stream.write().unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some(old) => {
                let _ = old.shutdown(Shutdown::Both);
                *guard = Some(Arc::new(fresh));
                Ok(())
            }
            // Closed while we were connecting
            None => {
                let _ = fresh.shutdown(Shutdown::Both);
                Err(not_connected())
            }
        }
    }

    /// Shut the socket down in both directions and drop the handle
    ///
    /// Idempotent.
    pub fn close(&self) {
        let taken = self.stream.write().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(stream) = taken {
            let _ = stream.shutdown(Shutdown::Both);
            log::debug!("Socket to {} shut down", self.peer);
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport closed")
}

/// True for the error kinds a socket read timeout produces
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
