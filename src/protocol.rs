//! Control channel command vocabulary.
//!
//! The control channel carries raw literal tokens with no framing. A token
//! matches a command only by exact, case-sensitive byte equality; anything
//! else is a no-op rather than an error, so new commands can be added
//! without breaking older peers.

/// Ask the worker to send back a duplicate of its application listening
/// socket on the same connection.
pub const GET_LISTENER: &[u8] = b"get-listener";

/// In-band payload accompanying a transferred descriptor. SCM_RIGHTS
/// ancillary data is only delivered alongside at least one regular byte,
/// so the payload exists purely to carry the control message.
pub const TRANSFER_PAYLOAD: &[u8] = b":)";

/// A recognized control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Transfer the application listening socket to the requester.
    GetListener,
}

impl Command {
    /// Parse a received token. Returns `None` for anything that is not a
    /// byte-exact match, including partial or differently-cased tokens.
    pub fn parse(token: &[u8]) -> Option<Command> {
        if token == GET_LISTENER {
            Some(Command::GetListener)
        } else {
            None
        }
    }
}
