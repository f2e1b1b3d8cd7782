//! End-to-end tests for the worker event loop and the transfer protocol.
//!
//! Each test runs the worker loop on a background thread against
//! listeners bound to ephemeral addresses, then drives the control
//! channel exactly as the supervisor would. Fork- and signal-based
//! supervisor scenarios live in supervisor_integration.rs, which spawns
//! the built binary instead of forking inside the test harness.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use seamless::config::Config;
use seamless::fdpass;
use seamless::listener;
use seamless::protocol;
use seamless::worker::{Worker, WorkerError};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A worker loop running on a background thread.
struct WorkerHarness {
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<Result<(), WorkerError>>>,
    control_path: PathBuf,
    server_addr: SocketAddr,
    _dir: tempfile::TempDir,
}

impl WorkerHarness {
    fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let control_path = dir.path().join("control.sock");
        let control = listener::create_control_listener(&control_path).unwrap();

        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let server_addr = server.local_addr().unwrap();
        let server = OwnedFd::from(server);

        let shutdown = Arc::new(AtomicBool::new(false));
        let config = Config {
            poll_timeout_ms: 25,
            ..Config::default()
        };

        let mut worker = Worker::new(config, control, server, Arc::clone(&shutdown)).unwrap();
        let handle = thread::spawn(move || worker.run());

        Self {
            shutdown,
            handle: Some(handle),
            control_path,
            server_addr,
            _dir: dir,
        }
    }

    fn connect_control(&self) -> UnixStream {
        let stream = UnixStream::connect(&self.control_path).unwrap();
        stream.set_read_timeout(Some(TEST_TIMEOUT)).unwrap();
        stream
    }

    /// Request the listening socket the way the supervisor does.
    fn request_listener(&self) -> std::io::Result<OwnedFd> {
        let mut stream = self.connect_control();
        stream.write_all(protocol::GET_LISTENER)?;
        fdpass::recv_fd(&stream)
    }

    fn stop(mut self) -> Result<(), WorkerError> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.handle.take().unwrap().join().unwrap()
    }
}

impl Drop for WorkerHarness {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[test]
fn transfer_hands_over_a_live_listener() {
    let harness = WorkerHarness::start();
    let server_addr = harness.server_addr;

    let received = harness.request_listener().unwrap();
    let received = TcpListener::from(received);
    assert_eq!(received.local_addr().unwrap(), server_addr);

    // Retire the worker so its copies of the listeners close; the
    // endpoint must stay bound through the received descriptor alone.
    harness.stop().unwrap();

    let client = TcpStream::connect(server_addr).unwrap();
    let (_conn, _) = received.accept().unwrap();
    drop(client);
}

#[test]
fn coalesced_junk_and_command_transfer_nothing() {
    let harness = WorkerHarness::start();

    // A single write, so both tokens land in one stream chunk; matching
    // is whole-chunk and exact, so nothing may be transferred.
    let mut stream = harness.connect_control();
    let mut bytes = b"junk".to_vec();
    bytes.extend_from_slice(protocol::GET_LISTENER);
    stream.write_all(&bytes).unwrap();

    assert!(fdpass::recv_fd(&stream).is_err());

    // The loop must still be serving: a well-formed request succeeds.
    let received = harness.request_listener().unwrap();
    let received = TcpListener::from(received);
    assert_eq!(received.local_addr().unwrap(), harness.server_addr);
}

#[test]
fn unknown_tokens_are_ignored_not_fatal() {
    let harness = WorkerHarness::start();

    let mut stream = harness.connect_control();
    stream.write_all(b"GET-LISTENER").unwrap(); // wrong case
    assert!(fdpass::recv_fd(&stream).is_err());

    let received = harness.request_listener();
    assert!(received.is_ok());
}

#[test]
fn control_connection_is_single_use() {
    let harness = WorkerHarness::start();

    let mut stream = harness.connect_control();
    stream.write_all(protocol::GET_LISTENER).unwrap();
    let _fd = fdpass::recv_fd(&stream).unwrap();

    // After the exchange the worker drains and closes the connection.
    let mut buf = [0u8; 8];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 0);
}

#[test]
fn zero_byte_half_close_is_drained() {
    let harness = WorkerHarness::start();

    let mut stream = harness.connect_control();
    stream.shutdown(Shutdown::Write).unwrap();

    // The worker observes end-of-stream within one wake-up and closes.
    let mut buf = [0u8; 8];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(n, 0);

    // And stays responsive afterwards.
    assert!(harness.request_listener().is_ok());
}

#[test]
fn server_connections_are_closed_immediately() {
    let harness = WorkerHarness::start();

    let mut client = TcpStream::connect(harness.server_addr).unwrap();
    client.set_read_timeout(Some(TEST_TIMEOUT)).unwrap();

    let mut buf = [0u8; 8];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(n, 0, "expected zero bytes before the worker closes");
}

#[test]
fn shutdown_latency_is_bounded_by_the_poll_timeout() {
    let harness = WorkerHarness::start();

    let started = Instant::now();
    harness.stop().unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "worker took too long to observe its shutdown flag"
    );
}
