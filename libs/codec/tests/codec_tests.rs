//! # Herd Codec Integration Tests
//!
//! Exercises the public API the network layer relies on:
//! - header bytes produced by `Message` decode back through `Head`
//! - length words line up with the segments they describe
//! - protocol enums survive the tag/category byte conversions

use codec::{
    decode_lengths, Category, Code, Head, Message, OutputStream, ALL, HEAD_SIZE, MASTER,
    MAX_SEGMENTS,
};
use proptest::prelude::*;

#[test]
fn test_codec_public_api_basic_functionality() {
    let mut message = Message::control(Code::ConnectTo);
    message.set_from(MASTER);
    message.set_to(ALL);
    message
        .push_i32(2)
        .unwrap()
        .push_str("beta")
        .unwrap()
        .push_str("10.0.0.2:41813")
        .unwrap()
        .push_i32(4)
        .unwrap();

    let header = message.encode_header().unwrap();
    let head = Head::decode(&header).unwrap();
    assert_eq!(head.category, u8::from(Category::Control));
    assert_eq!(head.count, 4);
    assert_eq!(head.from, 0);
    assert_eq!(head.to, 255);
    assert_eq!(Code::from_tag(head.tag).unwrap(), Code::ConnectTo);

    let lengths = decode_lengths(&header[HEAD_SIZE..], head.segment_count()).unwrap();
    assert_eq!(lengths, vec![4, 4, 14, 4]);
}

#[test]
fn test_output_messages_carry_stream_tag() {
    let mut message = Message::output(OutputStream::Error);
    message.add(b"boom\n".to_vec());
    assert_eq!(message.category().unwrap(), Category::Output);
    assert_eq!(message.stream().unwrap(), OutputStream::Error);
    assert_eq!(message.stream().unwrap().fd(), 2);
}

#[test]
fn test_rebuilt_message_matches_original() {
    let mut original = Message::data(-12);
    original.set_from(3);
    original.set_to(1);
    original.add(vec![0u8; 1024]);
    original.add(b"tail".to_vec());

    let head = Head::decode(&original.encode_header().unwrap()).unwrap();
    let rebuilt = Message::from_parts(head, original.segments().to_vec());
    assert_eq!(rebuilt, original);
}

proptest! {
    #[test]
    fn header_describes_segments(
        segments in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..MAX_SEGMENTS),
        tag in any::<i32>(),
        from in any::<u8>(),
        to in any::<u8>(),
    ) {
        let mut message = Message::data(tag);
        message.set_from(from);
        message.set_to(to);
        for segment in &segments {
            prop_assert!(message.add(segment.clone()));
        }

        let header = message.encode_header().unwrap();
        prop_assert_eq!(header.len(), message.header_size());

        let head = Head::decode(&header).unwrap();
        prop_assert_eq!(head.segment_count(), segments.len());
        prop_assert_eq!(head.tag, tag);
        prop_assert_eq!(head.from, from);
        prop_assert_eq!(head.to, to);

        let lengths = decode_lengths(&header[HEAD_SIZE..], head.segment_count()).unwrap();
        let expected: Vec<u32> = segments.iter().map(|s| s.len() as u32).collect();
        prop_assert_eq!(lengths, expected);
        prop_assert_eq!(
            message.encoded_size(),
            header.len() + segments.iter().map(Vec::len).sum::<usize>()
        );
    }
}
