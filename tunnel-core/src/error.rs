use std::io;
use std::time::Duration;

use crate::protocol::ProtocolError;
use crate::types::ClusterKey;

/// Failure to open a dial-through stream.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("tunnel session closed")]
    SessionClosed,
    #[error("no tunnel session for cluster {0}")]
    NoSession(ClusterKey),
    #[error("dial timed out after {0:?}")]
    Timeout(Duration),
    #[error("too many concurrent streams")]
    TooManyStreams,
    #[error("dial to {network} {address} is not allowed")]
    NotAllowed { network: String, address: String },
    #[error("remote dial failed: {0}")]
    Remote(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DialError {
    pub fn not_allowed(network: &str, address: &str) -> Self {
        Self::NotAllowed {
            network: network.to_string(),
            address: address.to_string(),
        }
    }
}

impl From<DialError> for io::Error {
    fn from(err: DialError) -> Self {
        let kind = match err {
            DialError::Io(e) => return e,
            DialError::SessionClosed => io::ErrorKind::ConnectionAborted,
            DialError::NoSession(_) => io::ErrorKind::NotConnected,
            DialError::Timeout(_) => io::ErrorKind::TimedOut,
            DialError::TooManyStreams => io::ErrorKind::WouldBlock,
            DialError::NotAllowed { .. } => io::ErrorKind::PermissionDenied,
            DialError::Remote(_) => io::ErrorKind::ConnectionRefused,
            DialError::Protocol(_) => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, err)
    }
}

/// Why a session's read loop stopped.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no traffic for {0:?}")]
    Stale(Duration),
}
