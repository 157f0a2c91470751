//! # Wire Constants
//!
//! Values every process in a group must agree on. Changing any of them breaks
//! interoperability with daemons built from an older tree.

/// Size of the fixed head: category, segment count, from, to, tag.
pub const HEAD_SIZE: usize = 8;

/// Size of one segment length word following the head.
pub const LENGTH_WORD_SIZE: usize = 4;

/// Upper bound on the number of segments carried by one message.
pub const MAX_SEGMENTS: usize = 255;

/// Rank of the master (the client driving the group).
pub const MASTER: u8 = 0;

/// Broadcast destination rank.
pub const ALL: u8 = 255;
