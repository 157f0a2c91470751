//! # Frame Header
//!
//! ## Purpose
//!
//! Fixed 8-byte head plus one length word per segment:
//!
//! ```text
//! +----------+-------+------+----+---------+------------------+----------------+
//! | category | count | from | to | tag:i32 | count x len:u32  | segment bytes  |
//! +----------+-------+------+----+---------+------------------+----------------+
//!     1         1      1     1      4          4 * count          sum(len)
//! ```
//!
//! Multi-byte fields are little-endian. The head is read through zerocopy so
//! a peeked buffer can be decoded in place without alignment requirements.

use zerocopy::byteorder::{LittleEndian, I32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::constants::{HEAD_SIZE, LENGTH_WORD_SIZE};
use crate::error::{CodecError, CodecResult};

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
struct RawHead {
    category: u8,
    count: u8,
    from: u8,
    to: u8,
    tag: I32<LittleEndian>,
}

/// Decoded fixed head of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Head {
    pub category: u8,
    pub count: u8,
    pub from: u8,
    pub to: u8,
    pub tag: i32,
}

impl Head {
    /// Decode the head from the first [`HEAD_SIZE`] bytes of `bytes`
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() < HEAD_SIZE {
            return Err(CodecError::header_too_short(
                HEAD_SIZE,
                bytes.len(),
                "fixed head",
            ));
        }
        let raw = RawHead::read_from(&bytes[..HEAD_SIZE]).ok_or_else(|| {
            CodecError::header_too_short(HEAD_SIZE, bytes.len(), "head conversion")
        })?;
        Ok(Self {
            category: raw.category,
            count: raw.count,
            from: raw.from,
            to: raw.to,
            tag: raw.tag.get(),
        })
    }

    pub fn encode(&self) -> [u8; HEAD_SIZE] {
        let raw = RawHead {
            category: self.category,
            count: self.count,
            from: self.from,
            to: self.to,
            tag: I32::new(self.tag),
        };
        let mut out = [0u8; HEAD_SIZE];
        out.copy_from_slice(raw.as_bytes());
        out
    }

    pub fn segment_count(&self) -> usize {
        self.count as usize
    }

    /// Head plus the length words that follow it
    pub fn header_size(&self) -> usize {
        header_size(self.segment_count())
    }
}

pub fn header_size(count: usize) -> usize {
    HEAD_SIZE + count * LENGTH_WORD_SIZE
}

/// Decode the segment length words that follow the head
pub fn decode_lengths(words: &[u8], count: usize) -> CodecResult<Vec<u32>> {
    let need = count * LENGTH_WORD_SIZE;
    if words.len() < need {
        return Err(CodecError::header_too_short(
            need,
            words.len(),
            "segment length words",
        ));
    }
    Ok(words[..need]
        .chunks_exact(LENGTH_WORD_SIZE)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_layout() {
        let head = Head {
            category: 129,
            count: 2,
            from: 1,
            to: 255,
            tag: -7,
        };
        let bytes = head.encode();
        assert_eq!(&bytes[..4], &[129, 2, 1, 255]);
        assert_eq!(&bytes[4..], &(-7i32).to_le_bytes());
        assert_eq!(Head::decode(&bytes).unwrap(), head);
        assert_eq!(head.header_size(), 16);
    }

    #[test]
    fn test_short_buffers_are_rejected() {
        assert!(matches!(
            Head::decode(&[0u8; 5]),
            Err(CodecError::HeaderTooShort { need: 8, got: 5, .. })
        ));
        assert!(decode_lengths(&[0u8; 7], 2).is_err());
    }

    #[test]
    fn test_lengths_decode_in_order() {
        let mut words = Vec::new();
        words.extend_from_slice(&3u32.to_le_bytes());
        words.extend_from_slice(&0u32.to_le_bytes());
        words.extend_from_slice(&70_000u32.to_le_bytes());
        assert_eq!(decode_lengths(&words, 3).unwrap(), vec![3, 0, 70_000]);
    }
}
