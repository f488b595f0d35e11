//! Error type for tunnel operations

use std::io;

use crate::session::Mode;

/// Errors reported to the caller of a tunnel operation
///
/// Failures inside a running relay are not errors: they end the relay and are
/// reported as a `RelayExit` reason.
#[derive(Debug)]
pub enum TunnelError {
    /// Host name could not be resolved
    Resolve(String, io::Error),
    /// Every resolved address refused or timed out
    Connect(String),
    /// Port string is not a valid port number
    InvalidPort(String),
    /// A session is already alive (only one is allowed per tunnel)
    SessionActive,
    /// No session is alive
    NotConnected,
    /// The session is in another use-mode (address request vs. relay)
    Busy(Mode),
    /// The session is neither relaying nor awaiting an address
    NotActive,
    /// No address reply before the deadline (session has been closed)
    AddressTimeout,
    /// Frame could not be encoded
    Encode(crate::codec::EncodeError),
    /// Socket or tun I/O failed
    Io(io::Error),
}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelError::Resolve(host, e) => write!(f, "failed to resolve {}: {}", host, e),
            TunnelError::Connect(target) => write!(f, "failed to connect to {}", target),
            TunnelError::InvalidPort(port) => write!(f, "invalid port: {}", port),
            TunnelError::SessionActive => write!(f, "a session is already active"),
            TunnelError::NotConnected => write!(f, "not connected"),
            TunnelError::Busy(mode) => write!(f, "session busy ({:?})", mode),
            TunnelError::NotActive => write!(f, "session not active"),
            TunnelError::AddressTimeout => write!(f, "address request timed out"),
            TunnelError::Encode(e) => write!(f, "encode error: {}", e),
            TunnelError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for TunnelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TunnelError::Resolve(_, e) | TunnelError::Io(e) => Some(e),
            TunnelError::Encode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TunnelError {
    fn from(e: io::Error) -> Self {
        TunnelError::Io(e)
    }
}

impl From<crate::codec::EncodeError> for TunnelError {
    fn from(e: crate::codec::EncodeError) -> Self {
        TunnelError::Encode(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            format!("{}", TunnelError::Connect("203.0.113.7:9000".to_string())),
            "failed to connect to 203.0.113.7:9000"
        );
        assert_eq!(
            format!("{}", TunnelError::Busy(Mode::Relaying)),
            "session busy (Relaying)"
        );
        assert_eq!(format!("{}", TunnelError::AddressTimeout), "address request timed out");
    }

    #[test]
    fn test_io_source() {
        use std::error::Error;
        let err = TunnelError::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(err.source().is_some());
        assert!(TunnelError::SessionActive.source().is_none());
    }
}
