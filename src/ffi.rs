//! C ABI for host applications
//!
//! One tunnel per process, reached through these entry points. Every call is
//! wrapped in `catch_unwind` so a panic never crosses the FFI boundary.
//! Failures are reported with sentinels: `-1` for descriptors and invalid
//! arguments, an empty (zero-length) string for text results.

use std::ffi::CStr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Once, OnceLock};

use libc::{c_char, c_int, size_t};

use crate::tun::HostTun;
use crate::Tunnel;

static TUNNEL: OnceLock<Tunnel> = OnceLock::new();

static INIT_LOGGING: Once = Once::new();

fn tunnel() -> &'static Tunnel {
    TUNNEL.get_or_init(Tunnel::default)
}

/// Route `log` output to stderr unless the host already installed a logger
fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .try_init();
    });
}

/// Copy `text` into a caller buffer as a NUL-terminated string
///
/// Returns the length written (without the NUL), or -1 if it does not fit.
unsafe fn write_c_string(text: &str, out: *mut c_char, capacity: size_t) -> c_int {
    let bytes = text.as_bytes();
    if bytes.len() + 1 > capacity {
        return -1;
    }
    std::ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, out, bytes.len());
    *out.add(bytes.len()) = 0;
    bytes.len() as c_int
}

unsafe fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

// ============================================================================
// FFI Functions - Connection
// ============================================================================

/// Connect to the tunnel server
///
/// # Arguments
/// * `host` - Server hostname or IP (null-terminated C string)
/// * `port` - Server port (null-terminated C string)
///
/// # Returns
/// The socket descriptor (so the host can exclude it from the tunnel's
/// routes), or -1 on failure.
///
/// # Safety
/// `host` and `port` must be null or valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn tunnel_open(host: *const c_char, port: *const c_char) -> c_int {
    init_logging();

    let (host, port) = match (str_arg(host), str_arg(port)) {
        (Some(h), Some(p)) => (h, p),
        _ => return -1,
    };

    panic::catch_unwind(AssertUnwindSafe(|| {
        let tunnel = tunnel();
        match tunnel.open_str(host, port) {
            Ok(_) => tunnel.socket_fd().unwrap_or(-1),
            Err(e) => {
                log::warn!("Open failed: {}", e);
                -1
            }
        }
    }))
    .unwrap_or(-1)
}

/// Request the tunnel address
///
/// # Arguments
/// * `out` - Buffer receiving the NUL-terminated address reply
/// * `capacity` - Size of `out` in bytes
///
/// # Returns
/// Length of the reply, 0 if the request failed (the session is then
/// closed), -1 for an invalid buffer.
///
/// # Safety
/// `out` must be valid for `capacity` bytes.
#[no_mangle]
pub unsafe extern "C" fn tunnel_request_address(out: *mut c_char, capacity: size_t) -> c_int {
    if out.is_null() || capacity == 0 {
        return -1;
    }

    panic::catch_unwind(AssertUnwindSafe(|| match tunnel().request_address() {
        Ok(address) => write_c_string(&address, out, capacity),
        Err(e) => {
            log::warn!("Address request failed: {}", e);
            write_c_string("", out, capacity)
        }
    }))
    .unwrap_or(-1)
}

// ============================================================================
// FFI Functions - Relay
// ============================================================================

/// Relay between the tun descriptor and the tunnel; blocks until it ends
///
/// The descriptor stays owned by the caller and is not closed.
///
/// # Returns
/// The `RelayExit` code, or -1 if the relay could not start.
#[no_mangle]
pub extern "C" fn tunnel_start_relay(tun_fd: c_int) -> c_int {
    if tun_fd < 0 {
        return -1;
    }

    panic::catch_unwind(|| match tunnel().start_relay(&HostTun::new(tun_fd)) {
        Ok(exit) => exit as c_int,
        Err(e) => {
            log::warn!("Relay could not start: {}", e);
            -1
        }
    })
    .unwrap_or(-1)
}

/// One supervisor step; call once per second
///
/// # Arguments
/// * `out` - Buffer receiving the NUL-terminated status text
/// * `capacity` - Size of `out` in bytes
///
/// # Returns
/// Length of the status text, 0 when no relay is running, -1 for an invalid
/// or too small buffer.
///
/// # Safety
/// `out` must be valid for `capacity` bytes.
#[no_mangle]
pub unsafe extern "C" fn tunnel_tick(out: *mut c_char, capacity: size_t) -> c_int {
    if out.is_null() || capacity == 0 {
        return -1;
    }

    panic::catch_unwind(AssertUnwindSafe(|| {
        let status = tunnel().tick().unwrap_or_default();
        write_c_string(&status, out, capacity)
    }))
    .unwrap_or(-1)
}

/// Ask the relay to stop; returns immediately
#[no_mangle]
pub extern "C" fn tunnel_stop() {
    let _ = panic::catch_unwind(|| tunnel().stop());
}

/// Whether a session (socket) is alive
#[no_mangle]
pub extern "C" fn tunnel_is_connected() -> bool {
    panic::catch_unwind(|| tunnel().is_connected()).unwrap_or(false)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, FrameKind};
    use std::ffi::CString;
    use std::net::TcpListener;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixDatagram;
    use std::thread;

    #[test]
    fn test_write_c_string() {
        let mut buf = [1 as c_char; 8];
        unsafe {
            assert_eq!(write_c_string("abc", buf.as_mut_ptr(), buf.len()), 3);
            assert_eq!(CStr::from_ptr(buf.as_ptr()).to_str().unwrap(), "abc");

            assert_eq!(write_c_string("12345678", buf.as_mut_ptr(), buf.len()), -1);
            assert_eq!(write_c_string("", buf.as_mut_ptr(), buf.len()), 0);
            assert_eq!(buf[0], 0);
        }
    }

    #[test]
    fn test_invalid_arguments() {
        unsafe {
            assert_eq!(tunnel_open(std::ptr::null(), std::ptr::null()), -1);
            assert_eq!(tunnel_request_address(std::ptr::null_mut(), 64), -1);
            assert_eq!(tunnel_tick(std::ptr::null_mut(), 64), -1);
        }
        assert_eq!(tunnel_start_relay(-1), -1);
    }

    /// The global tunnel is shared, so the whole lifecycle lives in one test
    #[test]
    fn test_global_lifecycle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = CString::new(listener.local_addr().unwrap().port().to_string()).unwrap();
        let host = CString::new("127.0.0.1").unwrap();

        let fd = unsafe { tunnel_open(host.as_ptr(), port.as_ptr()) };
        assert!(fd >= 0);
        assert!(tunnel_is_connected());

        // Second open while alive is refused
        assert_eq!(unsafe { tunnel_open(host.as_ptr(), port.as_ptr()) }, -1);

        let (mut server, _) = listener.accept().unwrap();
        let responder = thread::spawn(move || {
            let request = codec::decode(&mut server).unwrap();
            assert_eq!(request.kind, FrameKind::AddressRequest);
            codec::write_frame(&mut server, FrameKind::AddressReply, b"198.51.100.5").unwrap();
            server
        });

        let mut buf = [0 as c_char; 128];
        let len = unsafe { tunnel_request_address(buf.as_mut_ptr(), buf.len()) };
        assert_eq!(len, 12);
        let text = unsafe { CStr::from_ptr(buf.as_ptr()) };
        assert_eq!(text.to_str().unwrap(), "198.51.100.5");
        let server = responder.join().unwrap();

        // Not relaying yet: tick reports nothing
        assert_eq!(unsafe { tunnel_tick(buf.as_mut_ptr(), buf.len()) }, 0);

        // Peer goes away; the relay ends and the session is dropped
        drop(server);
        let (tun, _host) = UnixDatagram::pair().unwrap();
        let exit = tunnel_start_relay(tun.as_raw_fd());
        assert_eq!(exit, crate::RelayExit::StreamClosed as c_int);
        assert!(!tunnel_is_connected());
        tunnel_stop();
    }
}
