use std::io;

use thiserror::Error;

use crate::wire::DecodeError;

/// Failures of tunnel setup and operation. Most of them are per relay candidate and handled
///  by moving on to the next candidate - see [crate::gateway::session_manager::SessionManager::connect].
#[derive(Debug, Error)]
pub enum AmtError {
    #[error("relay address did not resolve to any IPv4 address: {0}")]
    AddressResolution(String),
    #[error("relay did not respond within the handshake deadline ({0})")]
    HandshakeTimeout(&'static str),
    #[error("relay echoed nonce {received:#010x}, expected {expected:#010x}")]
    NonceMismatch { expected: u32, received: u32 },
    #[error("malformed frame: {0}")]
    Malformed(#[from] DecodeError),
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),
    #[error("joining the multicast group failed: {0}")]
    Join(String),
    #[error("handshake step called in state {0}")]
    HandshakeOutOfOrder(&'static str),
    #[error("no AMT relay responding")]
    NoRelayResponding,
    #[error("cancelled")]
    Cancelled,
}
