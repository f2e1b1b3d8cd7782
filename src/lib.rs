//! seamless - zero-downtime handoff of a listening socket
//!
//! A supervising process creates an application listener and a control
//! listener, forks a worker that owns both, and can replace that worker
//! without the endpoint ever being unbound:
//!
//! - The worker runs a single-threaded readiness loop over both listeners
//!   and answers requests on the control channel.
//! - On a handoff trigger (SIGUSR2), the supervisor connects to the
//!   control channel, sends the transfer command, and receives a kernel
//!   duplicate of the listening socket as SCM_RIGHTS ancillary data.
//! - A replacement worker is forked around the received descriptor; the
//!   old worker drains and exits.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  SIGUSR2   ┌─────────────────────────────┐
//! │  operator  │───────────▶│         supervisor          │
//! └────────────┘            │  (signals, fork, rotation)  │
//!                           └──────┬──────────────▲───────┘
//!                     fork, fds    │              │ fd via SCM_RIGHTS
//!                                  ▼              │
//!                           ┌─────────────────────┴───────┐
//!                           │           worker            │
//!                           │ (epoll loop, both listeners)│
//!                           └─────────────────────────────┘
//! ```

pub mod config;
pub mod fdpass;
pub mod listener;
pub mod protocol;
pub mod supervisor;
pub mod worker;
