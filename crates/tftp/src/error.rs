//! Session failure taxonomy.

use std::error;
use std::fmt;
use std::io;

use crate::packet::ErrorCode;

/// Why a transfer session failed.
///
/// Timeout exhaustion (`NoAck`/`NoData`) is silent on the wire; every other
/// variant except `Remote` maps to an ERROR packet sent to the peer before
/// the session terminates (see [`TransferError::wire_reply`]).
#[derive(Debug)]
pub enum TransferError {
    /// Retries exhausted while waiting for an ACK.
    NoAck,
    /// Retries exhausted while waiting for DATA.
    NoData,
    /// The peer terminated the transfer with an ERROR packet.
    Remote { code: ErrorCode, message: String },
    /// The peer broke the lock-step protocol (future block, wrong packet
    /// type, undecodable datagram).
    Protocol(String),
    /// The server's OACK violated the requester rules.
    OptionNegotiation(String),
    /// The session was cancelled by a shutdown request.
    Cancelled,
    /// A local I/O failure (socket, byte source, or byte sink).
    Io(io::Error),
}

impl TransferError {
    /// The ERROR packet to send to the peer for this failure, if one is
    /// owed. Timeouts are silent and a remote error is never answered.
    pub fn wire_reply(&self) -> Option<(ErrorCode, String)> {
        match self {
            Self::NoAck | Self::NoData | Self::Remote { .. } => None,
            Self::Protocol(message) => Some((ErrorCode::IllegalOperation, message.clone())),
            Self::OptionNegotiation(message) => {
                Some((ErrorCode::OptionNegotiation, message.clone()))
            }
            Self::Cancelled => Some((ErrorCode::NotDefined, "Shutting down".to_string())),
            Self::Io(err) => Some((io_error_code(err), err.to_string())),
        }
    }
}

/// Map a local I/O failure to the closest wire error code.
pub fn io_error_code(err: &io::Error) -> ErrorCode {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorCode::FileNotFound,
        io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
        io::ErrorKind::StorageFull => ErrorCode::DiskFull,
        io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
        _ => ErrorCode::NotDefined,
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAck => write!(f, "no acknowledgment after retries exhausted"),
            Self::NoData => write!(f, "no data after retries exhausted"),
            Self::Remote { code, message } => {
                write!(f, "peer reported error {}: \"{}\"", code.as_u16(), message)
            }
            Self::Protocol(message) => write!(f, "protocol violation: {}", message),
            Self::OptionNegotiation(message) => {
                write!(f, "option negotiation failed: {}", message)
            }
            Self::Cancelled => write!(f, "transfer cancelled by shutdown"),
            Self::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl error::Error for TransferError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}
