//! # Message
//!
//! ## Purpose
//!
//! Owned in-memory form of one frame: routing fields plus up to 255 byte
//! segments. Typed payload items (integers, strings, raw bytes) each occupy
//! exactly one segment, so a receiver reads them back in the order they were
//! pushed with a [`SegmentReader`].
//!
//! ## Lifecycle
//!
//! Built empty with a [`Category`], segments appended, sent as a single
//! vectored write. On receive the head is peeked first, then every segment is
//! read into an exactly sized buffer that the message owns.

use crate::constants::{HEAD_SIZE, MAX_SEGMENTS};
use crate::error::{CodecError, CodecResult};
use crate::header::{header_size, Head};
use crate::protocol::{Category, Code, OutputStream};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    category: u8,
    from: u8,
    to: u8,
    tag: i32,
    segments: Vec<Vec<u8>>,
}

impl Message {
    pub fn new(category: Category) -> Self {
        Self {
            category: category.into(),
            from: 0,
            to: 0,
            tag: 0,
            segments: Vec::new(),
        }
    }

    pub fn control(code: Code) -> Self {
        Self::new(Category::Control).with_tag(code.tag())
    }

    pub fn data(tag: i32) -> Self {
        Self::new(Category::Data).with_tag(tag)
    }

    pub fn output(stream: OutputStream) -> Self {
        Self::new(Category::Output).with_tag(stream.into())
    }

    /// Rebuild a message from a received head and its segments
    pub fn from_parts(head: Head, segments: Vec<Vec<u8>>) -> Self {
        Self {
            category: head.category,
            from: head.from,
            to: head.to,
            tag: head.tag,
            segments,
        }
    }

    pub fn with_tag(mut self, tag: i32) -> Self {
        self.tag = tag;
        self
    }

    pub fn category(&self) -> CodecResult<Category> {
        Category::from_byte(self.category)
    }

    pub fn raw_category(&self) -> u8 {
        self.category
    }

    pub fn tag(&self) -> i32 {
        self.tag
    }

    pub fn set_tag(&mut self, tag: i32) {
        self.tag = tag;
    }

    /// Tag interpreted as a control code
    pub fn code(&self) -> CodecResult<Code> {
        Code::from_tag(self.tag)
    }

    pub fn set_code(&mut self, code: Code) {
        self.tag = code.tag();
    }

    /// Tag interpreted as the originating output stream
    pub fn stream(&self) -> CodecResult<OutputStream> {
        OutputStream::from_tag(self.tag)
    }

    pub fn from(&self) -> u8 {
        self.from
    }

    pub fn to(&self) -> u8 {
        self.to
    }

    pub fn set_from(&mut self, rank: u8) {
        self.from = rank;
    }

    pub fn set_to(&mut self, rank: u8) {
        self.to = rank;
    }

    pub fn count(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Append one segment; returns false once [`MAX_SEGMENTS`] are present
    pub fn add(&mut self, bytes: impl Into<Vec<u8>>) -> bool {
        if self.segments.len() >= MAX_SEGMENTS {
            return false;
        }
        self.segments.push(bytes.into());
        true
    }

    fn push(&mut self, bytes: Vec<u8>) -> CodecResult<&mut Self> {
        if self.add(bytes) {
            Ok(self)
        } else {
            Err(CodecError::SegmentOverflow { max: MAX_SEGMENTS })
        }
    }

    pub fn push_i32(&mut self, value: i32) -> CodecResult<&mut Self> {
        self.push(value.to_le_bytes().to_vec())
    }

    pub fn push_str(&mut self, value: &str) -> CodecResult<&mut Self> {
        self.push(value.as_bytes().to_vec())
    }

    pub fn push_bytes(&mut self, value: &[u8]) -> CodecResult<&mut Self> {
        self.push(value.to_vec())
    }

    /// Drop every segment, keeping category, tag and addressing
    pub fn clear(&mut self) {
        self.segments.clear();
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    pub fn into_segments(self) -> Vec<Vec<u8>> {
        self.segments
    }

    pub fn reader(&self) -> SegmentReader<'_> {
        SegmentReader {
            segments: &self.segments,
            position: 0,
        }
    }

    pub fn head(&self) -> Head {
        Head {
            category: self.category,
            count: self.segments.len() as u8,
            from: self.from,
            to: self.to,
            tag: self.tag,
        }
    }

    pub fn header_size(&self) -> usize {
        header_size(self.segments.len())
    }

    pub fn payload_size(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    /// Total bytes this message occupies on the wire
    pub fn encoded_size(&self) -> usize {
        self.header_size() + self.payload_size()
    }

    /// Head followed by one little-endian length word per segment
    pub fn encode_header(&self) -> CodecResult<Vec<u8>> {
        let mut header = Vec::with_capacity(self.header_size());
        header.extend_from_slice(&self.head().encode());
        for (index, segment) in self.segments.iter().enumerate() {
            header.extend_from_slice(&length_word(index, segment.len())?);
        }
        debug_assert!(header.len() >= HEAD_SIZE);
        Ok(header)
    }
}

/// Sequential decoder over the segments of a message
#[derive(Debug, Clone)]
pub struct SegmentReader<'a> {
    segments: &'a [Vec<u8>],
    position: usize,
}

impl<'a> SegmentReader<'a> {
    fn next_segment(&mut self, expected: &str) -> CodecResult<&'a [u8]> {
        let segment = self.segments.get(self.position).ok_or_else(|| {
            CodecError::missing_segment(self.position, self.segments.len(), expected)
        })?;
        self.position += 1;
        Ok(segment.as_slice())
    }

    pub fn read_i32(&mut self) -> CodecResult<i32> {
        let index = self.position;
        let bytes = self.next_segment("i32")?;
        let word: [u8; 4] = bytes
            .try_into()
            .map_err(|_| CodecError::segment_size(index, 4, bytes.len(), "i32"))?;
        Ok(i32::from_le_bytes(word))
    }

    pub fn read_str(&mut self) -> CodecResult<&'a str> {
        let index = self.position;
        let bytes = self.next_segment("string")?;
        std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8 { index })
    }

    pub fn read_bytes(&mut self) -> CodecResult<&'a [u8]> {
        self.next_segment("bytes")
    }

    pub fn remaining(&self) -> usize {
        self.segments.len().saturating_sub(self.position)
    }

    /// Remaining segments decoded lossily as text, e.g. an argument vector
    pub fn rest_lossy(&mut self) -> Vec<String> {
        let rest = &self.segments[self.position.min(self.segments.len())..];
        self.position = self.segments.len();
        rest.iter()
            .map(|segment| String::from_utf8_lossy(segment).into_owned())
            .collect()
    }
}

/// Little-endian length word of segment `index`
fn length_word(index: usize, len: usize) -> CodecResult<[u8; 4]> {
    u32::try_from(len)
        .map(u32::to_le_bytes)
        .map_err(|_| CodecError::SegmentTooLarge { index, len })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_bound() {
        let mut message = Message::data(3);
        for i in 0..MAX_SEGMENTS {
            assert!(message.add(vec![i as u8]), "segment {} should fit", i);
        }
        let before = message.clone();
        assert!(!message.add(vec![0xFF]));
        assert_eq!(message, before);
        assert_eq!(message.count(), 255);
        assert!(matches!(
            message.push_i32(1),
            Err(CodecError::SegmentOverflow { max: 255 })
        ));
    }

    #[test]
    fn test_clear_preserves_category() {
        let mut message = Message::control(Code::Run);
        message.push_str("prog").unwrap().push_str("x").unwrap();
        message.clear();
        assert_eq!(message.count(), 0);
        assert_eq!(message.category().unwrap(), Category::Control);
        message.set_code(Code::Start);
        assert_eq!(message.code().unwrap(), Code::Start);
    }

    #[test]
    fn test_encoded_size() {
        let mut message = Message::data(0);
        message.add(vec![1, 2, 3]);
        message.add(Vec::new());
        message.add(vec![9; 10]);
        assert_eq!(message.header_size(), 8 + 3 * 4);
        assert_eq!(message.encoded_size(), 8 + 12 + 13);
        assert_eq!(message.encode_header().unwrap().len(), message.header_size());
    }

    #[test]
    fn test_typed_segments_read_back_in_order() {
        let mut message = Message::control(Code::Enslave);
        message
            .push_i32(3)
            .unwrap()
            .push_str("alpha")
            .unwrap()
            .push_i32(2)
            .unwrap();

        let mut reader = message.reader();
        assert_eq!(reader.read_i32().unwrap(), 3);
        assert_eq!(reader.read_str().unwrap(), "alpha");
        assert_eq!(reader.read_i32().unwrap(), 2);
        assert!(matches!(
            reader.read_i32(),
            Err(CodecError::MissingSegment { index: 3, count: 3, .. })
        ));
    }

    #[test]
    fn test_wrong_segment_size_is_reported() {
        let mut message = Message::control(Code::Peers);
        message.push_str("abc").unwrap();
        let mut reader = message.reader();
        assert!(matches!(
            reader.read_i32(),
            Err(CodecError::SegmentSize { index: 0, expected: 4, got: 3, .. })
        ));
    }

    #[test]
    fn test_rest_lossy_collects_arguments() {
        let mut message = Message::control(Code::Run);
        message.push_str("prog").unwrap().push_str("x").unwrap();
        let mut reader = message.reader();
        assert_eq!(reader.rest_lossy(), vec!["prog".to_string(), "x".to_string()]);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_length_word_refuses_oversized_segments() {
        assert_eq!(length_word(0, 70_000).unwrap(), 70_000u32.to_le_bytes());
        assert_eq!(length_word(1, u32::MAX as usize).unwrap(), [0xff; 4]);
        assert_eq!(
            length_word(2, u32::MAX as usize + 1),
            Err(CodecError::SegmentTooLarge {
                index: 2,
                len: u32::MAX as usize + 1
            })
        );
    }
}
