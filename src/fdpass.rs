//! Descriptor transfer over a Unix stream socket.
//!
//! Wraps the SCM_RIGHTS ancillary-data encoding behind two primitives so
//! that call sites deal only in descriptor values and ownership transfer.
//! The kernel duplicates the descriptor into the receiving process: after
//! `recv_fd` returns, sender and receiver each hold an independent
//! reference to the same open socket, and each is responsible for closing
//! its own.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::cmsg_space;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

/// Maximum in-band payload read alongside a received descriptor.
const PAYLOAD_BUF: usize = 64;

/// Send `fd` over the connected stream socket `conn`, attached to the given
/// in-band payload as a single SCM_RIGHTS record.
///
/// The payload must be at least one byte; ancillary data is not delivered
/// on its own. The sender keeps its own copy of `fd`.
pub fn send_fd<C: AsRawFd, F: AsRawFd>(conn: &C, payload: &[u8], fd: &F) -> io::Result<()> {
    debug_assert!(!payload.is_empty());

    let iov = [IoSlice::new(payload)];
    let fds = [fd.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];

    let sent = sendmsg::<()>(conn.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
        .map_err(io::Error::from)?;
    if sent != payload.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "short send of descriptor payload",
        ));
    }
    Ok(())
}

/// Receive one descriptor from the connected stream socket `conn`.
///
/// Blocks until the peer's transfer message arrives. The returned
/// descriptor is fully owned by the caller and closed on drop; the in-band
/// payload bytes are discarded. If a buggy peer attaches more than one
/// descriptor, the extras are closed immediately so nothing leaks.
pub fn recv_fd<C: AsRawFd>(conn: &C) -> io::Result<OwnedFd> {
    let mut buf = [0u8; PAYLOAD_BUF];
    let mut iov = [IoSliceMut::new(&mut buf)];
    let mut cmsg_buf = cmsg_space!([RawFd; 1]);

    let msg = recvmsg::<()>(
        conn.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )
    .map_err(io::Error::from)?;

    if msg.bytes == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed before sending a descriptor",
        ));
    }

    let mut received: Option<OwnedFd> = None;
    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for fd in fds {
                let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                if received.is_none() {
                    received = Some(owned);
                }
                // extra descriptors drop (close) here
            }
        }
    }

    received.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "message carried no descriptor in ancillary data",
        )
    })
}
