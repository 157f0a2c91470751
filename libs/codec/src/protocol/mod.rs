//! # Protocol Vocabulary
//!
//! ## Purpose
//!
//! Numeric identities shared by every process in a group: message categories,
//! control codes and output stream tags. The values are protocol-significant
//! and must match across all daemons and the client.
//!
//! ## Architecture Role
//!
//! ```text
//! Category ──> routes a frame in the dispatcher
//! Code     ──> tag of Control frames, drives the daemon state machine
//! OutputStream ──> tag of Output frames (captured stdout/stderr)
//! ```

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::CodecError;

/// Routing class of a frame
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum Category {
    /// Application payload, handed to the caller's data callback
    Data = 128,
    /// Protocol messages handled by the state machine
    Control = 129,
    /// Captured stdout/stderr of a running workload
    Output = 130,
}

impl Category {
    pub fn from_byte(byte: u8) -> Result<Self, CodecError> {
        Self::try_from(byte).map_err(|_| CodecError::UnknownCategory { category: byte })
    }
}

/// Control codes carried in the tag of Control frames
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum Code {
    Noop = 0,

    // Replies (6-9)
    Ok = 6,
    Success = 7,
    Failed = 8,
    Refuse = 9,

    // Formation (10-17, 25)
    Enslave = 10,
    ConnectTo = 12,
    Join = 13,
    Disconnect = 14,
    Peers = 15,
    Leave = 16,
    Grouped = 17,
    PrepareToLeave = 18,
    Shutdown = 19,
    CutRope = 20,
    InitialData = 21,
    Run = 22,
    Start = 23,
    Done = 24,
    DataLine = 25,

    // Out-of-band administration (26-28)
    Status = 26,
    ForceShutdown = 27,
    ForceReset = 28,

    // Failure propagation (32-33)
    Error = 32,
    Renegade = 33,

    // Diagnostics
    Table = 64,
}

impl Code {
    pub fn from_tag(tag: i32) -> Result<Self, CodecError> {
        Self::try_from(tag).map_err(|_| CodecError::UnknownCode { code: tag })
    }

    pub fn tag(self) -> i32 {
        self.into()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Code::Noop => "noop",
            Code::Ok => "ok",
            Code::Success => "success",
            Code::Failed => "failed",
            Code::Refuse => "refuse",
            Code::Enslave => "enslave",
            Code::ConnectTo => "connect-to",
            Code::Join => "join",
            Code::Disconnect => "disconnect",
            Code::Peers => "peers",
            Code::Leave => "leave",
            Code::Grouped => "grouped",
            Code::PrepareToLeave => "prepare-to-leave",
            Code::Shutdown => "shutdown",
            Code::CutRope => "cut-rope",
            Code::InitialData => "initial-data",
            Code::Run => "run",
            Code::Start => "start",
            Code::Done => "done",
            Code::DataLine => "data-line",
            Code::Status => "status",
            Code::ForceShutdown => "force-shutdown",
            Code::ForceReset => "force-reset",
            Code::Error => "error",
            Code::Renegade => "renegade",
            Code::Table => "table",
        }
    }

    /// Replies that close a request/response exchange
    pub fn is_reply(self) -> bool {
        matches!(self, Code::Ok | Code::Success | Code::Failed | Code::Refuse)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which standard stream an Output frame was captured from
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum OutputStream {
    Standard = 1,
    Error = 2,
}

impl OutputStream {
    pub fn from_tag(tag: i32) -> Result<Self, CodecError> {
        Self::try_from(tag).map_err(|_| CodecError::UnknownStream { tag })
    }

    /// File descriptor of the stream in the producing process
    pub fn fd(self) -> i32 {
        match self {
            OutputStream::Standard => 1,
            OutputStream::Error => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_values_are_stable() {
        assert_eq!(Code::Ok.tag(), 6);
        assert_eq!(Code::Refuse.tag(), 9);
        assert_eq!(Code::Error.tag(), 32);
        assert_eq!(Code::Table.tag(), 64);
        assert_eq!(Code::from_tag(25).unwrap(), Code::DataLine);
    }

    #[test]
    fn test_unknown_values_are_rejected() {
        assert_eq!(
            Code::from_tag(11),
            Err(CodecError::UnknownCode { code: 11 })
        );
        assert_eq!(
            Category::from_byte(7),
            Err(CodecError::UnknownCategory { category: 7 })
        );
        assert!(OutputStream::from_tag(0).is_err());
    }

    #[test]
    fn test_reply_classification() {
        assert!(Code::Ok.is_reply());
        assert!(Code::Refuse.is_reply());
        assert!(!Code::Enslave.is_reply());
    }
}
