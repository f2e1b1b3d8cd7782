//! seamless - zero-downtime listening-socket handoff daemon
//!
//! Creates the application and control listeners, forks a worker that owns
//! them, and rotates workers on SIGUSR2 without the endpoint ever being
//! unbound. SIGTERM exits the supervisor and leaves the current worker
//! serving.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;

use seamless::config::{self, Config};
use seamless::supervisor;

#[derive(Parser)]
#[command(name = "seamless")]
#[command(about = "Zero-downtime listening-socket handoff supervisor")]
#[command(
    long_about = "seamless supervises a worker process that serves a TCP endpoint. \
    On SIGUSR2 it requests the worker's listening socket over a local control \
    channel and replaces the worker without rebinding the endpoint. \
    Use seamlessctl to deliver the trigger signals."
)]
struct Args {
    /// IPv4 address the application listener binds to
    #[arg(long, default_value_t = config::DEFAULT_LISTEN_ADDR)]
    listen: Ipv4Addr,

    /// TCP port the application listener binds to
    #[arg(long, default_value_t = config::DEFAULT_LISTEN_PORT)]
    port: u16,

    /// Path of the control socket used for descriptor transfer
    #[arg(long, default_value = config::DEFAULT_CONTROL_PATH)]
    control_socket: PathBuf,

    /// Readiness-wait timeout in milliseconds (bounds worker shutdown latency)
    #[arg(long, default_value_t = config::DEFAULT_POLL_TIMEOUT_MS)]
    poll_timeout_ms: u16,

    /// Where to record the supervisor pid for seamlessctl
    #[arg(long, default_value = config::DEFAULT_PIDFILE)]
    pidfile: PathBuf,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config {
        listen_addr: args.listen,
        listen_port: args.port,
        control_path: args.control_socket,
        poll_timeout_ms: args.poll_timeout_ms,
        pidfile: args.pidfile,
    };

    if let Err(e) = supervisor::run(config) {
        log::error!("seamless: {}", e);
        std::process::exit(1);
    }
}
