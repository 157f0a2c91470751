//! Codec-level errors for message framing and segment decoding
//!
//! Each variant carries enough context to tell which part of a frame was
//! rejected without re-reading the socket.

use thiserror::Error;

/// Framing and payload decoding errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// Message already holds the maximum number of segments
    #[error("Segment overflow: message already carries {max} segments")]
    SegmentOverflow { max: usize },

    /// Header buffer shorter than the head or the declared length words
    #[error("Header too short: need {need} bytes, got {got} (context: {context})")]
    HeaderTooShort {
        need: usize,
        got: usize,
        context: String,
    },

    /// Reader ran past the last segment
    #[error("Missing segment {index}: message has {count} segments (expected: {expected})")]
    MissingSegment {
        index: usize,
        count: usize,
        expected: String,
    },

    /// Segment length does not match the decoded type
    #[error("Segment {index} has {got} bytes, expected {expected} (type: {type_name})")]
    SegmentSize {
        index: usize,
        expected: usize,
        got: usize,
        type_name: String,
    },

    /// Segment longer than a length word can describe
    #[error("Segment {index} has {len} bytes, more than a length word can carry")]
    SegmentTooLarge { index: usize, len: usize },

    /// Segment declared as text is not valid UTF-8
    #[error("Segment {index} is not valid UTF-8")]
    InvalidUtf8 { index: usize },

    /// Category byte outside the known set
    #[error("Unknown message category {category}")]
    UnknownCategory { category: u8 },

    /// Tag does not name a control code
    #[error("Unknown control code {code}")]
    UnknownCode { code: i32 },

    /// Tag does not name an output stream
    #[error("Unknown output stream {tag}")]
    UnknownStream { tag: i32 },
}

impl CodecError {
    pub fn header_too_short(need: usize, got: usize, context: impl Into<String>) -> Self {
        Self::HeaderTooShort {
            need,
            got,
            context: context.into(),
        }
    }

    pub fn missing_segment(index: usize, count: usize, expected: impl Into<String>) -> Self {
        Self::MissingSegment {
            index,
            count,
            expected: expected.into(),
        }
    }

    pub fn segment_size(
        index: usize,
        expected: usize,
        got: usize,
        type_name: impl Into<String>,
    ) -> Self {
        Self::SegmentSize {
            index,
            expected,
            got,
            type_name: type_name.into(),
        }
    }
}

/// Result type for codec operations
pub type CodecResult<T> = std::result::Result<T, CodecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_context() {
        let err = CodecError::header_too_short(16, 8, "length words");
        assert!(err.to_string().contains("need 16 bytes"));
        assert!(err.to_string().contains("length words"));

        let err = CodecError::segment_size(2, 4, 3, "i32");
        assert_eq!(err.to_string(), "Segment 2 has 3 bytes, expected 4 (type: i32)");
    }
}
