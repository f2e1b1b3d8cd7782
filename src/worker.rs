//! Worker server and event loop.
//!
//! After the fork the worker owns both listening sockets. A
//! single-threaded, level-triggered epoll loop multiplexes readiness
//! across the control listener, the application listener and every
//! accepted control connection. Application connections are accepted and
//! closed immediately, standing in for a real request-handling layer.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::socket::{accept, accept4, SockFlag};
use nix::unistd::read;

use crate::config::Config;
use crate::fdpass;
use crate::listener;
use crate::protocol::{Command, TRANSFER_PAYLOAD};

const MAX_EVENTS: usize = 100;
const READ_CHUNK: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to register shutdown handler: {0}")]
    Signals(#[source] io::Error),

    #[error("failed to create epoll instance: {0}")]
    EpollCreate(#[source] nix::Error),

    #[error("failed to register descriptor with epoll: {0}")]
    EpollRegister(#[source] nix::Error),

    #[error("readiness wait failed: {0}")]
    Wait(#[source] nix::Error),

    #[error("failed to accept connection: {0}")]
    Accept(#[source] nix::Error),

    #[error("descriptor transfer failed: {0}")]
    Transfer(#[source] io::Error),
}

/// Register a SIGTERM handler that only sets the returned flag. The event
/// loop observes the flag within one readiness-wait timeout; no work
/// happens in handler context.
pub fn install_shutdown_handler() -> io::Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))?;
    Ok(flag)
}

/// Everything the worker loop needs, passed in explicitly rather than held
/// in process-wide globals.
pub struct Worker {
    config: Config,
    control_listener: OwnedFd,
    server_listener: OwnedFd,
    shutdown: Arc<AtomicBool>,
    epoll: Epoll,
    /// Accepted control connections, keyed by raw descriptor (the value
    /// also used as the epoll token).
    conns: HashMap<RawFd, OwnedFd>,
}

impl Worker {
    pub fn new(
        config: Config,
        control_listener: OwnedFd,
        server_listener: OwnedFd,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, WorkerError> {
        let epoll = Epoll::new(EpollCreateFlags::empty()).map_err(WorkerError::EpollCreate)?;

        // Level-triggered registration: a backlog of pending connections
        // beyond the single accept per wake-up re-arms the listener.
        epoll
            .add(
                &control_listener,
                EpollEvent::new(EpollFlags::EPOLLIN, control_listener.as_raw_fd() as u64),
            )
            .map_err(WorkerError::EpollRegister)?;
        epoll
            .add(
                &server_listener,
                EpollEvent::new(EpollFlags::EPOLLIN, server_listener.as_raw_fd() as u64),
            )
            .map_err(WorkerError::EpollRegister)?;

        Ok(Self {
            config,
            control_listener,
            server_listener,
            shutdown,
            epoll,
            conns: HashMap::new(),
        })
    }

    /// Run the event loop until the shutdown flag is observed.
    ///
    /// The readiness wait is bounded by `poll_timeout_ms`, so shutdown
    /// latency is bounded too. A wait that returns zero ready descriptors
    /// is not an error.
    pub fn run(&mut self) -> Result<(), WorkerError> {
        if let Ok(addr) = listener::local_addr(&self.server_listener) {
            log::info!("worker: serving on {}", addr);
        }

        let timeout = EpollTimeout::from(self.config.poll_timeout_ms);
        let mut events = [EpollEvent::empty(); MAX_EVENTS];

        while !self.shutdown.load(Ordering::SeqCst) {
            let ready = match self.epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(WorkerError::Wait(e)),
            };
            if ready == 0 {
                log::trace!("worker: no events during waiting period");
                continue;
            }

            for event in &events[..ready] {
                let fd = event.data() as RawFd;
                if fd == self.control_listener.as_raw_fd() {
                    self.accept_control_connection()?;
                } else if fd == self.server_listener.as_raw_fd() {
                    self.accept_and_close()?;
                } else {
                    self.service_control_connection(fd)?;
                }
            }
        }

        log::info!("worker: shutdown flag set, exiting");
        Ok(())
    }

    /// Accept exactly one pending control connection and register it.
    fn accept_control_connection(&mut self) -> Result<(), WorkerError> {
        let raw = match accept4(self.control_listener.as_raw_fd(), SockFlag::SOCK_NONBLOCK) {
            Ok(raw) => raw,
            // Spurious wake-up: another wake-up will follow if a
            // connection is actually pending.
            Err(Errno::EAGAIN) => return Ok(()),
            Err(e) => return Err(WorkerError::Accept(e)),
        };
        let conn = unsafe { OwnedFd::from_raw_fd(raw) };
        log::debug!("worker: accepted control connection (fd {})", raw);

        self.epoll
            .add(
                &conn,
                EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP, raw as u64),
            )
            .map_err(WorkerError::EpollRegister)?;
        self.conns.insert(raw, conn);
        Ok(())
    }

    /// Accept an application connection and close it immediately.
    fn accept_and_close(&mut self) -> Result<(), WorkerError> {
        match accept(self.server_listener.as_raw_fd()) {
            Ok(raw) => {
                // Dropping the OwnedFd closes the connection.
                drop(unsafe { OwnedFd::from_raw_fd(raw) });
                log::debug!("worker: accepted and closed server connection");
                Ok(())
            }
            Err(Errno::EAGAIN) => Ok(()),
            Err(e) => Err(WorkerError::Accept(e)),
        }
    }

    /// Drain a ready control connection, acting on each recognized token,
    /// then close it. Connections are single-use by design.
    fn service_control_connection(&mut self, fd: RawFd) -> Result<(), WorkerError> {
        let Some(conn) = self.conns.remove(&fd) else {
            log::warn!("worker: event for unknown descriptor {}", fd);
            return Ok(());
        };

        let mut transferred = false;
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match read(conn.as_raw_fd(), &mut buf) {
                Ok(0) => {
                    log::debug!("worker: control peer closed (fd {})", fd);
                    break;
                }
                Ok(n) => match Command::parse(&buf[..n]) {
                    Some(Command::GetListener) if !transferred => {
                        log::info!("worker: listener requested, sending descriptor");
                        fdpass::send_fd(&conn, TRANSFER_PAYLOAD, &self.server_listener)
                            .map_err(WorkerError::Transfer)?;
                        transferred = true;
                    }
                    Some(Command::GetListener) => {
                        // At most one transfer per connection.
                        log::debug!("worker: ignoring repeated transfer request");
                    }
                    None => {
                        log::debug!("worker: ignoring unknown control token ({} bytes)", n);
                    }
                },
                // Nothing left to read; not an error.
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    log::warn!("worker: control read failed (fd {}): {}", fd, e);
                    break;
                }
            }
        }

        if let Err(e) = self.epoll.delete(&conn) {
            log::warn!("worker: failed to deregister fd {}: {}", fd, e);
        }
        drop(conn);
        Ok(())
    }
}

/// Entry point for the child branch of the fork: install the shutdown
/// flag, build the loop context around the inherited descriptors, and run
/// to completion.
pub fn run_to_completion(
    config: Config,
    control_listener: OwnedFd,
    server_listener: OwnedFd,
) -> Result<(), WorkerError> {
    let shutdown = install_shutdown_handler().map_err(WorkerError::Signals)?;
    let mut worker = Worker::new(config, control_listener, server_listener, shutdown)?;
    worker.run()
}
