//! Transport Error Types
//!
//! Error handling for channel I/O, readiness polling, group broadcasts and
//! protocol exchanges. OS error codes are folded into a small taxonomy so the
//! daemon can decide between "peer went away" and "something is broken".

use codec::{Code, CodecError};
use nix::errno::Errno;
use thiserror::Error;

/// Network error alias for compatibility
pub type NetworkError = TransportError;

/// Main transport error type
#[derive(Error, Debug)]
pub enum TransportError {
    /// OS-level failure not covered by the more specific variants
    #[error("System error: {operation}: {source}")]
    System {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Peer refused, reset or closed the connection
    #[error("Connection aborted: {operation}")]
    ConnectionAborted { operation: String },

    /// Outbound connect did not complete in time
    #[error("Connection timeout: {target} did not answer within {timeout_ms}ms")]
    ConnectionTimeout { target: String, timeout_ms: u64 },

    /// Non-blocking operation or socket timeout with nothing to transfer
    #[error("Operation would block: {operation}")]
    WouldBlock { operation: String },

    /// Fewer or more bytes moved than the header declared
    #[error("Transfer error: {operation} moved {actual} bytes, expected {expected}")]
    Transfer {
        operation: String,
        expected: usize,
        actual: usize,
    },

    /// Unexpected control code for the current state
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// A reply outside the set the requester was waiting for
    #[error("Unexpected response: expected one of [{expected}], got {got}")]
    UnexpectedResponse { expected: String, got: String },

    /// Not every recipient of a broadcast received the message
    #[error("Broadcast incomplete: {failed} of {total} sends failed")]
    Broadcast { failed: usize, total: usize },

    /// Frame could not be decoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Create a system error from an I/O failure
    pub fn system(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::System {
            operation: operation.into(),
            source,
        }
    }

    /// Create a connection-aborted error
    pub fn aborted(operation: impl Into<String>) -> Self {
        Self::ConnectionAborted {
            operation: operation.into(),
        }
    }

    /// Create a connect timeout error
    pub fn timeout(target: impl Into<String>, timeout_ms: u64) -> Self {
        Self::ConnectionTimeout {
            target: target.into(),
            timeout_ms,
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a transfer error
    pub fn transfer(operation: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::Transfer {
            operation: operation.into(),
            expected,
            actual,
        }
    }

    /// Create an unexpected-response error from the codes that were acceptable
    pub fn unexpected(expected: &[Code], got: i32) -> Self {
        let expected = expected
            .iter()
            .map(|code| code.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let got = match Code::from_tag(got) {
            Ok(code) => code.as_str().to_string(),
            Err(_) => format!("unknown code {}", got),
        };
        Self::UnexpectedResponse { expected, got }
    }

    /// Classify an errno returned by a socket call
    pub fn from_errno(operation: impl Into<String>, errno: Errno) -> Self {
        let operation = operation.into();
        match errno {
            Errno::EAGAIN => Self::WouldBlock { operation },
            Errno::ECONNREFUSED | Errno::ENOTCONN | Errno::EPIPE | Errno::ECONNRESET => {
                Self::ConnectionAborted { operation }
            }
            other => Self::System {
                operation,
                source: std::io::Error::from(other),
            },
        }
    }

    /// Classify an I/O error returned by the standard library
    pub fn from_io(operation: impl Into<String>, error: std::io::Error) -> Self {
        match error.raw_os_error() {
            Some(code) => Self::from_errno(operation, Errno::from_raw(code)),
            None => match error.kind() {
                std::io::ErrorKind::WouldBlock => Self::WouldBlock {
                    operation: operation.into(),
                },
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected
                | std::io::ErrorKind::BrokenPipe => Self::aborted(operation),
                _ => Self::system(operation, error),
            },
        }
    }

    /// Peer went away rather than the local side failing
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransportError::ConnectionAborted { .. })
    }

    /// Get error category for logs
    pub fn category(&self) -> &'static str {
        match self {
            TransportError::System { .. } => "system",
            TransportError::ConnectionAborted { .. } => "connection_aborted",
            TransportError::ConnectionTimeout { .. } => "connection_timeout",
            TransportError::WouldBlock { .. } => "would_block",
            TransportError::Transfer { .. } => "transfer",
            TransportError::Protocol { .. } => "protocol",
            TransportError::UnexpectedResponse { .. } => "unexpected_response",
            TransportError::Broadcast { .. } => "broadcast",
            TransportError::Codec(_) => "codec",
        }
    }
}
