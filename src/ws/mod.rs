//! WebSocket adapter
//!
//! `GET /channels/{chanID}/messages[/{subtopic...}]` upgrades to a session
//! bound to one channel and subtopic for its whole life. The credential is
//! checked before the upgrade; a refused handshake never becomes a socket.

mod handshake;
mod session;
mod table;

use crate::utils::error::ErrorKind;

pub use handshake::{WsState, router};
pub use table::{SessionInfo, SessionTable};

pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_UNSUPPORTED: u16 = 1003;
pub const CLOSE_POLICY: u16 = 1008;
pub const CLOSE_INTERNAL: u16 = 1011;

/// Close code sent when a session ends because of `kind`.
pub fn close_code_for(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::Malformed => CLOSE_UNSUPPORTED,
        ErrorKind::Unauthorized => CLOSE_POLICY,
        _ => CLOSE_INTERNAL,
    }
}
