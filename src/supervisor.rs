//! Supervisor process.
//!
//! Creates both listening sockets, forks the worker that owns them, and
//! mediates handoff triggers. The supervisor never serves traffic itself:
//! after each fork it closes its own copies of the listeners and goes back
//! to a blocking signal wait.
//!
//! Signals:
//! - SIGTERM: exit gracefully; the current worker keeps serving.
//! - SIGUSR2: rotate the worker: request the listening socket over the
//!   control channel, spawn a replacement that inherits it, retire the
//!   old worker.
//! - SIGCHLD: reap; an unexpected worker death is fatal, restart policy
//!   belongs to whoever supervises this process.

use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use signal_hook::consts::{SIGCHLD, SIGTERM, SIGUSR2};
use signal_hook::iterator::Signals;

use crate::config::Config;
use crate::fdpass;
use crate::listener::{self, SetupError};
use crate::protocol;
use crate::worker;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("failed to register signal handlers: {0}")]
    Signals(#[source] io::Error),

    #[error("failed to fork worker: {0}")]
    Fork(#[source] nix::Error),

    #[error("failed to write pidfile {path}: {source}")]
    Pidfile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("handoff request failed: {0}")]
    Handoff(#[source] io::Error),

    #[error("failed to signal worker {pid}: {source}")]
    SignalWorker {
        pid: Pid,
        #[source]
        source: nix::Error,
    },

    #[error("worker {0} exited unexpectedly")]
    WorkerDied(Pid),
}

/// Run the supervisor until a termination signal arrives.
///
/// Bootstraps both listeners, forks the first worker, then blocks waiting
/// for signals. Every fatal condition propagates out so the process exits
/// non-zero; there are no retries here. Restart and backoff policy is an
/// external supervisor's job.
pub fn run(config: Config) -> Result<(), SupervisorError> {
    let control = listener::create_control_listener(&config.control_path)?;
    let server = listener::create_server_listener(config.listen_addr, config.listen_port)?;
    log::info!(
        "supervisor: listening on {} (control at {})",
        config.server_addr(),
        config.control_path.display()
    );

    // The handlers behind this iterator only wake the blocking wait; all
    // real work, including the handoff, runs here in ordinary context.
    // Registered before the first fork so a worker that dies during
    // bootstrap is still delivered as a pending SIGCHLD.
    let mut signals =
        Signals::new([SIGTERM, SIGUSR2, SIGCHLD]).map_err(SupervisorError::Signals)?;

    let mut worker_pid = spawn_worker(&config, control, server)?;

    write_pidfile(&config.pidfile)?;

    let result = supervise(&config, &mut signals, &mut worker_pid);

    if let Err(e) = std::fs::remove_file(&config.pidfile) {
        log::debug!("supervisor: failed to remove pidfile: {}", e);
    }
    result
}

fn supervise(
    config: &Config,
    signals: &mut Signals,
    worker_pid: &mut Pid,
) -> Result<(), SupervisorError> {
    log::info!("supervisor: waiting for signals (worker {})", worker_pid);

    for signal in signals.forever() {
        match signal {
            SIGTERM => {
                log::info!("supervisor: received SIGTERM, exiting; worker keeps serving");
                return Ok(());
            }
            SIGUSR2 => {
                log::info!("supervisor: received SIGUSR2, rotating worker {}", worker_pid);
                *worker_pid = rotate_worker(config, *worker_pid)?;
                log::info!("supervisor: rotation complete, worker is now {}", worker_pid);
            }
            SIGCHLD => {
                if reap_children(*worker_pid) {
                    return Err(SupervisorError::WorkerDied(*worker_pid));
                }
            }
            other => log::debug!("supervisor: ignoring signal {}", other),
        }
    }
    Ok(())
}

/// Fork a worker that inherits both listener descriptors.
///
/// The child installs its shutdown flag, runs the event loop and exits the
/// process; it never returns into supervisor code. The parent closes its
/// copies of both descriptors by dropping them: from here on exactly one
/// process can accept on them.
fn spawn_worker(
    config: &Config,
    control_listener: OwnedFd,
    server_listener: OwnedFd,
) -> Result<Pid, SupervisorError> {
    match unsafe { fork() }.map_err(SupervisorError::Fork)? {
        ForkResult::Child => {
            let code =
                match worker::run_to_completion(config.clone(), control_listener, server_listener) {
                    Ok(()) => 0,
                    Err(e) => {
                        log::error!("worker: fatal: {}", e);
                        1
                    }
                };
            process::exit(code);
        }
        ForkResult::Parent { child } => {
            log::info!("supervisor: spawned worker {}", child);
            drop(control_listener);
            drop(server_listener);
            Ok(child)
        }
    }
}

/// Replace the current worker without the endpoint ever being unbound.
///
/// Any failure while requesting or receiving the descriptor is fatal: a
/// half-finished handoff must be visible to whoever supervises us, so
/// nothing here retries or papers over errors.
fn rotate_worker(config: &Config, old: Pid) -> Result<Pid, SupervisorError> {
    // The serving worker answers with a kernel duplicate of its listening
    // socket; from this moment the supervisor owns an independent
    // reference to the bound endpoint.
    let server_listener =
        request_listener(&config.control_path).map_err(SupervisorError::Handoff)?;

    // Rebind the rendezvous path so the replacement answers future
    // requests. The old worker's control listener stays alive but is no
    // longer reachable by path.
    let control_listener = listener::create_control_listener(&config.control_path)?;

    let new = spawn_worker(config, control_listener, server_listener)?;

    // Retire the old worker: it drains its current wake-up and exits. New
    // connections already land on the replacement's listeners.
    kill(old, Signal::SIGTERM).map_err(|source| SupervisorError::SignalWorker { pid: old, source })?;
    loop {
        match waitpid(old, None) {
            Ok(status) => {
                log::debug!("supervisor: old worker {} exited ({:?})", old, status);
                break;
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                log::warn!("supervisor: failed to reap old worker {}: {}", old, e);
                break;
            }
        }
    }

    Ok(new)
}

/// Connect to the control channel and request the listening socket.
///
/// One connection, one exchange: write the exact command literal, block
/// for the response carrying the descriptor.
fn request_listener(control_path: &Path) -> io::Result<OwnedFd> {
    let mut stream = UnixStream::connect(control_path)?;
    stream.write_all(protocol::GET_LISTENER)?;
    fdpass::recv_fd(&stream)
}

/// Reap exited children without blocking. Returns true if the current
/// worker was among them.
fn reap_children(current: Pid) -> bool {
    let mut current_died = false;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                let pid = match status {
                    WaitStatus::Exited(pid, code) => {
                        log::warn!("supervisor: child {} exited with {}", pid, code);
                        pid
                    }
                    WaitStatus::Signaled(pid, sig, _) => {
                        log::warn!("supervisor: child {} killed by {}", pid, sig);
                        pid
                    }
                    _ => continue,
                };
                if pid == current {
                    current_died = true;
                }
            }
            Err(nix::errno::Errno::ECHILD) => break,
            Err(e) => {
                log::warn!("supervisor: waitpid error: {}", e);
                break;
            }
        }
    }
    current_died
}

fn write_pidfile(path: &Path) -> Result<(), SupervisorError> {
    std::fs::write(path, format!("{}\n", process::id())).map_err(|source| {
        SupervisorError::Pidfile {
            path: path.display().to_string(),
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixListener;
    use std::thread;

    use crate::fdpass::send_fd;
    use crate::protocol::TRANSFER_PAYLOAD;

    #[test]
    fn request_listener_speaks_the_exact_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let rendezvous = UnixListener::bind(&path).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // Stand-in for the serving worker: one accept, one exchange.
        let server = thread::spawn(move || {
            let (mut conn, _) = rendezvous.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], protocol::GET_LISTENER);
            send_fd(&conn, TRANSFER_PAYLOAD, &listener).unwrap();
        });

        let received = request_listener(&path).unwrap();
        assert!(received.as_raw_fd() >= 0);
        let received = TcpListener::from(received);
        assert_eq!(received.local_addr().unwrap(), addr);

        server.join().unwrap();
    }

    #[test]
    fn request_listener_fails_when_nobody_listens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.sock");
        assert!(request_listener(&path).is_err());
    }
}
