//! Listening socket creation.
//!
//! Both listeners are created by the supervisor before the first worker
//! exists and reach the worker through descriptor inheritance across the
//! fork. Any failure here is a setup error and fatal to the process.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

use nix::sys::socket::{
    bind, getsockname, listen, setsockopt, socket, sockopt, AddressFamily, Backlog, SockFlag,
    SockType, SockaddrIn, UnixAddr,
};

use crate::config::{CONTROL_BACKLOG, SERVER_BACKLOG};

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to create socket: {0}")]
    Socket(#[source] nix::Error),

    #[error("failed to remove stale control socket {path}: {source}")]
    RemoveStale {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid socket address {0}: {1}")]
    Address(String, #[source] nix::Error),

    #[error("failed to set socket option on {0}: {1}")]
    SockOpt(String, #[source] nix::Error),

    #[error("failed to bind {0}: {1}")]
    Bind(String, #[source] nix::Error),

    #[error("failed to listen on {0}: {1}")]
    Listen(String, #[source] nix::Error),
}

/// Create the control listener at the fixed rendezvous path.
///
/// A stale socket file left behind by a previous run is removed first, so
/// creation is idempotent and never fails with "already exists". This is
/// also what lets the supervisor steal the rendezvous from a worker that
/// is about to be replaced.
pub fn create_control_listener(path: &Path) -> Result<OwnedFd, SetupError> {
    log::debug!("creating control listener at {}", path.display());

    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("removed stale control socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(SetupError::RemoveStale {
                path: path.display().to_string(),
                source,
            })
        }
    }

    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(SetupError::Socket)?;

    let display = path.display().to_string();
    let addr = UnixAddr::new(path).map_err(|e| SetupError::Address(display.clone(), e))?;
    bind(fd.as_raw_fd(), &addr).map_err(|e| SetupError::Bind(display.clone(), e))?;

    let backlog = Backlog::new(CONTROL_BACKLOG).map_err(|e| SetupError::Listen(display.clone(), e))?;
    listen(&fd, backlog).map_err(|e| SetupError::Listen(display, e))?;

    Ok(fd)
}

/// Create the application listener on `addr:port` with a small backlog.
pub fn create_server_listener(addr: Ipv4Addr, port: u16) -> Result<OwnedFd, SetupError> {
    let sock_addr = SocketAddrV4::new(addr, port);
    log::debug!("creating server listener on {}", sock_addr);

    let fd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .map_err(SetupError::Socket)?;

    let display = sock_addr.to_string();
    // Lets a restarted supervisor rebind while old connections linger in
    // TIME_WAIT.
    setsockopt(&fd, sockopt::ReuseAddr, &true)
        .map_err(|e| SetupError::SockOpt(display.clone(), e))?;

    let nix_addr = SockaddrIn::from(sock_addr);
    bind(fd.as_raw_fd(), &nix_addr).map_err(|e| SetupError::Bind(display.clone(), e))?;

    let backlog = Backlog::new(SERVER_BACKLOG).map_err(|e| SetupError::Listen(display.clone(), e))?;
    listen(&fd, backlog).map_err(|e| SetupError::Listen(display, e))?;

    Ok(fd)
}

/// Local address a bound IPv4 listener descriptor is serving on.
pub fn local_addr<F: AsRawFd>(fd: &F) -> nix::Result<SocketAddrV4> {
    let addr: SockaddrIn = getsockname(fd.as_raw_fd())?;
    Ok(SocketAddrV4::new(addr.ip(), addr.port()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_listener_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");

        let first = create_control_listener(&path).unwrap();
        // Simulate a crashed previous run: the socket file still exists.
        drop(first);
        assert!(path.exists());

        let second = create_control_listener(&path);
        assert!(second.is_ok());
    }

    #[test]
    fn control_listener_rebinds_over_a_live_listener() {
        // Rotation rebinds the path while the old worker still holds its
        // listener; the old socket just becomes unreachable by path.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");

        let _old = create_control_listener(&path).unwrap();
        let new = create_control_listener(&path);
        assert!(new.is_ok());
    }

    #[test]
    fn server_listener_reports_its_local_address() {
        let fd = create_server_listener(Ipv4Addr::LOCALHOST, 0).unwrap();
        let addr = local_addr(&fd).unwrap();
        assert_eq!(*addr.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(addr.port(), 0);
    }
}
