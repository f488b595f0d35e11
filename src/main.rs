//! Standalone tunnel client
//!
//! Connects to a tunnel server, negotiates the tunnel address and relays
//! between an inherited tun descriptor and the server until stopped.
//!
//! ```text
//! tun-relay --server <host> --port <port> --tun-fd <fd> [--config <file.json>]
//! ```
//!
//! The tun descriptor must already be open (and configured by whoever created
//! it). SIGINT/SIGTERM stop the relay; the supervisor tick runs on a timer
//! thread once per second.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tun_relay::{AddressLease, HostTun, Tunnel, TunnelConfig};

/// Supervisor tick period
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Granularity of the timer thread's sleep, so signals are noticed promptly
const TICK_SLICE: Duration = Duration::from_millis(100);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    // --server <host>       Tunnel server hostname or IP
    // --port <port>         Tunnel server port
    // --tun-fd <fd>         Open tun descriptor inherited from the parent
    // --config <path>       JSON timing configuration (optional)

    let (server, port, tun_fd) = match (
        parse_arg(&args, "--server"),
        parse_arg(&args, "--port"),
        parse_arg(&args, "--tun-fd"),
    ) {
        (Some(server), Some(port), Some(fd)) => (server, port, fd),
        _ => {
            let program = args.first().map(String::as_str).unwrap_or("tun-relay");
            eprintln!(
                "Usage: {} --server <host> --port <port> --tun-fd <fd> [--config <file.json>]",
                program
            );
            std::process::exit(2);
        }
    };
    let tun_fd: i32 = tun_fd
        .parse()
        .map_err(|_| format!("invalid --tun-fd: {}", tun_fd))?;

    let config = match parse_arg(&args, "--config") {
        Some(path) => {
            log::info!("Loading configuration from {}", path);
            TunnelConfig::from_file(&path)?
        }
        None => TunnelConfig::default(),
    };
    log::debug!("Configuration: {:?}", config);

    let tunnel = Tunnel::new(config);
    tunnel.open_str(&server, &port)?;

    let reply = tunnel.request_address()?;
    match AddressLease::parse(&reply) {
        Some(lease) => log::info!("Tunnel address: {} (extra: {:?})", lease.address, lease.extra),
        None => log::warn!("Unparsable address reply: {:?}", reply),
    }

    let terminate = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&terminate))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&terminate))?;

    let relay_done = AtomicBool::new(false);
    let tun = HostTun::new(tun_fd);

    let exit = thread::scope(|s| {
        s.spawn(|| run_timer(&tunnel, &terminate, &relay_done));
        let exit = tunnel.start_relay(&tun);
        relay_done.store(true, Ordering::Relaxed);
        exit
    })?;

    log::info!("Relay exited: {:?}", exit);
    Ok(())
}

/// Tick the supervisor once per second until the relay ends
fn run_timer(tunnel: &Tunnel, terminate: &AtomicBool, relay_done: &AtomicBool) {
    let slices = (TICK_INTERVAL.as_millis() / TICK_SLICE.as_millis()).max(1);
    let mut stop_sent = false;

    while !relay_done.load(Ordering::Relaxed) {
        for _ in 0..slices {
            thread::sleep(TICK_SLICE);
            if terminate.load(Ordering::Relaxed) && !stop_sent {
                log::info!("Signal received, stopping relay");
                tunnel.stop();
                stop_sent = true;
            }
            if relay_done.load(Ordering::Relaxed) {
                return;
            }
        }

        if let Some(status) = tunnel.tick() {
            log::info!("{}", status.replace('\n', ", "));
        }
        if let Some(metrics) = tunnel.metrics() {
            log::trace!("\n{}", metrics);
        }
    }
}

/// Parse a command line argument value
fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
