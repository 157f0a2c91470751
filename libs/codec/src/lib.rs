//! # Herd Protocol Codec
//!
//! ## Purpose
//!
//! Framing rules for the group protocol: a fixed head, one length word per
//! segment, then the segment bytes. This crate knows nothing about sockets; it
//! turns [`Message`] values into header bytes plus segment slices and back.
//!
//! ## Architecture Role
//!
//! ```text
//! codec (frames, codes) → network (channels, registry, dispatch) → herd (daemon, client)
//! ```
//!
//! ## What This Crate Contains
//! - [`Message`] and [`SegmentReader`] for building and decoding frames
//! - [`Head`] with zero-copy decoding of the fixed head
//! - [`Category`], [`Code`] and [`OutputStream`] protocol enums
//! - Wire constants shared by every process in a group
//!
//! ## What This Crate Does NOT Contain
//! - Socket I/O (belongs in `network`)
//! - The daemon state machine (belongs in `herd`)

pub mod constants;
pub mod error;
pub mod header;
pub mod message;
pub mod protocol;

pub use constants::{ALL, HEAD_SIZE, LENGTH_WORD_SIZE, MASTER, MAX_SEGMENTS};
pub use error::{CodecError, CodecResult};
pub use header::{decode_lengths, header_size, Head};
pub use message::{Message, SegmentReader};
pub use protocol::{Category, Code, OutputStream};
