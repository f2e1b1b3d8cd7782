//! Runtime configuration shared by the supervisor and worker roles.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;

/// Default bind address for the application listener.
pub const DEFAULT_LISTEN_ADDR: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// Default port for the application listener.
pub const DEFAULT_LISTEN_PORT: u16 = 3490;

/// Fixed rendezvous path for the control channel.
pub const DEFAULT_CONTROL_PATH: &str = "/tmp/seamless.sock";

/// Where the supervisor records its pid for `seamlessctl`.
pub const DEFAULT_PIDFILE: &str = "/tmp/seamless.pid";

/// Default readiness-wait timeout. Bounds how long the worker takes to
/// notice its shutdown flag.
pub const DEFAULT_POLL_TIMEOUT_MS: u16 = 1000;

/// Backlog for the application listener.
pub const SERVER_BACKLOG: i32 = 2;

/// Backlog for the control listener.
pub const CONTROL_BACKLOG: i32 = 5;

/// Runtime configuration, passed explicitly to every component instead of
/// living in process-wide globals.
#[derive(Debug, Clone)]
pub struct Config {
    /// IPv4 address the application listener binds to.
    pub listen_addr: Ipv4Addr,
    /// TCP port the application listener binds to.
    pub listen_port: u16,
    /// Filesystem path of the control socket.
    pub control_path: PathBuf,
    /// Readiness-wait timeout in milliseconds.
    pub poll_timeout_ms: u16,
    /// Pidfile written by the supervisor.
    pub pidfile: PathBuf,
}

impl Config {
    /// Full bind address of the application listener.
    pub fn server_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.listen_addr, self.listen_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR,
            listen_port: DEFAULT_LISTEN_PORT,
            control_path: PathBuf::from(DEFAULT_CONTROL_PATH),
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            pidfile: PathBuf::from(DEFAULT_PIDFILE),
        }
    }
}
