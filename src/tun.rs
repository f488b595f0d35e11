//! Tun device handle
//!
//! The relay only needs packet-at-a-time reads and writes on a pollable file
//! descriptor. Creating and configuring the interface is the host's job; it
//! hands over an already-open descriptor.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;

/// A packet device the relay can pump
pub trait TunDevice: AsRawFd + Sync {
    /// Read one outbound packet
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Inject one inbound packet
    fn send(&self, buf: &[u8]) -> io::Result<usize>;
}

impl TunDevice for File {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&*self).read(buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        (&*self).write(buf)
    }
}

impl TunDevice for UnixDatagram {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UnixDatagram::recv(self, buf)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UnixDatagram::send(self, buf)
    }
}

/// Descriptor owned by the host application
///
/// Unlike `File`, dropping it leaves the descriptor open.
#[derive(Debug, Clone, Copy)]
pub struct HostTun {
    fd: RawFd,
}

impl HostTun {
    pub fn new(fd: RawFd) -> Self {
        HostTun { fd }
    }
}

impl AsRawFd for HostTun {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl TunDevice for HostTun {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is a valid writable region of buf.len() bytes
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: buf is a valid readable region of buf.len() bytes
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

/// Put a descriptor in non-blocking mode, preserving its other flags
///
/// Returns the flags it had before, for `restore_flags`.
pub fn set_nonblocking(fd: RawFd) -> io::Result<libc::c_int> {
    // SAFETY: fcntl on an arbitrary fd is memory safe; errors come back as -1
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if flags & libc::O_NONBLOCK == 0 && libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(flags)
    }
}

/// Put back the status flags saved by `set_nonblocking`
pub fn restore_flags(fd: RawFd, flags: libc::c_int) -> io::Result<()> {
    // SAFETY: as above
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_tun_roundtrip() {
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        let tun = HostTun::new(ours.as_raw_fd());

        theirs.send(&[0x45, 0, 0, 20]).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(tun.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[0x45, 0, 0, 20]);

        assert_eq!(tun.send(&[0x60; 10]).unwrap(), 10);
        assert_eq!(theirs.recv(&mut buf).unwrap(), 10);
    }

    #[test]
    fn test_set_nonblocking() {
        let (ours, _theirs) = UnixDatagram::pair().unwrap();
        set_nonblocking(ours.as_raw_fd()).unwrap();

        let mut buf = [0u8; 16];
        let err = TunDevice::recv(&ours, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        // Idempotent; the second call sees the flag already set
        let flags = set_nonblocking(ours.as_raw_fd()).unwrap();
        assert_ne!(flags & libc::O_NONBLOCK, 0);
    }

    #[test]
    fn test_restore_flags() {
        let (ours, _theirs) = UnixDatagram::pair().unwrap();
        let saved = set_nonblocking(ours.as_raw_fd()).unwrap();
        assert_eq!(saved & libc::O_NONBLOCK, 0);

        restore_flags(ours.as_raw_fd(), saved).unwrap();
        let now = unsafe { libc::fcntl(ours.as_raw_fd(), libc::F_GETFL) };
        assert_eq!(now & libc::O_NONBLOCK, 0);
    }

    #[test]
    fn test_set_nonblocking_bad_fd() {
        assert!(set_nonblocking(-1).is_err());
    }
}
