//! Frame encode/decode and wire size tests.

use bytes::Bytes;
use f2fstream::buffer::PooledBuffer;
use f2fstream::error::F2fStreamError;
use f2fstream::frame::{
    wire_size, ControlFlags, DataMessage, Frame, FrameType, AUTH_TAG_LEN, MESSAGE_HEADER_LEN,
    NO_WINDOW, SEQUENCE_NUMBER_BYTES,
};
use f2fstream::sequence::SequenceNumber;

#[test]
fn service_data_roundtrip() {
    let msg = DataMessage::data(
        42,
        SequenceNumber::new(3, 7),
        PooledBuffer::from(&b"hello world"[..]),
    );
    let frame = Frame::ServiceData(msg);
    let decoded = Frame::decode(&frame.encode()).unwrap();
    assert_eq!(frame, decoded);
    assert_eq!(decoded.frame_type(), FrameType::ServiceData);
    assert_eq!(decoded.channel_id(), 42);
}

#[test]
fn no_window_survives_encoding() {
    let msg = DataMessage::data(1, SequenceNumber::new(1, 1), PooledBuffer::empty());
    assert_eq!(msg.window, NO_WINDOW);
    match Frame::decode(&Frame::ServiceData(msg).encode()).unwrap() {
        Frame::ServiceData(d) => assert_eq!(d.window, -1),
        other => panic!("unexpected frame {other:?}"),
    }
}

#[test]
fn ack_carries_list_and_window() {
    let msg = DataMessage::acknowledge(9, 12_000, 4, vec![1, 5, 9], true);
    match Frame::decode(&Frame::ServiceData(msg).encode()).unwrap() {
        Frame::ServiceData(d) => {
            assert!(d.is_ack());
            assert!(!d.is_syn());
            assert!(d.datagram);
            assert_eq!(d.flow, 4);
            assert_eq!(d.window, 12_000);
            assert_eq!(d.acks, vec![1, 5, 9]);
            assert!(d.payload.is_empty());
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

#[test]
fn combined_flags_roundtrip() {
    let mut msg = DataMessage::data(2, SequenceNumber::new(1, 0), PooledBuffer::empty());
    msg.flags.insert(ControlFlags::SYN);
    msg.flags.insert(ControlFlags::RST);
    match Frame::decode(&Frame::ServiceData(msg).encode()).unwrap() {
        Frame::ServiceData(d) => {
            assert!(d.is_syn() && d.is_rst());
            assert!(!d.is_ack());
            assert!(!d.datagram);
        }
        other => panic!("unexpected frame {other:?}"),
    }
}

#[test]
fn channel_data_roundtrip() {
    let frame = Frame::ChannelData {
        channel_id: 77,
        payload: Bytes::from_static(b"raw overlay bytes"),
    };
    let decoded = Frame::decode(&frame.encode()).unwrap();
    assert_eq!(frame, decoded);
    assert_eq!(decoded.frame_type(), FrameType::ChannelData);
}

#[test]
fn encoded_len_matches_encoding() {
    let frame = Frame::ServiceData(DataMessage::data(
        1,
        SequenceNumber::new(1, 1),
        PooledBuffer::from(Bytes::from(vec![7u8; 300])),
    ));
    assert_eq!(frame.encoded_len(), frame.encode().len());
}

// ---------------------------------------------------------------------------
// Wire size
// ---------------------------------------------------------------------------

#[test]
fn wire_size_includes_crypto_overhead() {
    let msg = DataMessage::data(
        1,
        SequenceNumber::new(1, 0),
        PooledBuffer::from(Bytes::from(vec![0u8; 1000])),
    );
    let serialized = MESSAGE_HEADER_LEN + msg.body_len();
    assert_eq!(serialized, 1026);
    // 1026 pads to 1040.
    assert_eq!(msg.wire_size(), SEQUENCE_NUMBER_BYTES + 1040 + AUTH_TAG_LEN);
}

#[test]
fn block_aligned_message_gets_no_padding() {
    assert_eq!(wire_size(32), SEQUENCE_NUMBER_BYTES + 32 + AUTH_TAG_LEN);
    assert_eq!(wire_size(33), SEQUENCE_NUMBER_BYTES + 48 + AUTH_TAG_LEN);
}

#[test]
fn acks_count_towards_wire_size() {
    let bare = DataMessage::acknowledge(1, 0, 1, vec![], false);
    let listed = DataMessage::acknowledge(1, 0, 1, vec![1, 2, 3, 4], false);
    assert_eq!(listed.body_len() - bare.body_len(), 16);
}

// ---------------------------------------------------------------------------
// Malformed input
// ---------------------------------------------------------------------------

#[test]
fn empty_buffer_rejected() {
    assert!(matches!(
        Frame::decode(&[]),
        Err(F2fStreamError::FrameTooShort { expected: 1, actual: 0 })
    ));
}

#[test]
fn unknown_type_rejected() {
    assert!(matches!(
        Frame::decode(&[0x7F, 0, 0, 0, 0]),
        Err(F2fStreamError::UnknownFrameType(0x7F))
    ));
}

#[test]
fn truncated_payload_rejected() {
    let frame = Frame::ServiceData(DataMessage::data(
        1,
        SequenceNumber::new(1, 1),
        PooledBuffer::from(&b"0123456789"[..]),
    ));
    let bytes = frame.encode();
    assert!(matches!(
        Frame::decode(&bytes[..bytes.len() - 1]),
        Err(F2fStreamError::FrameTooShort { .. })
    ));
}

#[test]
fn truncated_header_rejected() {
    let bytes = Frame::ServiceData(DataMessage::acknowledge(1, 0, 1, vec![], false)).encode();
    assert!(matches!(
        Frame::decode(&bytes[..10]),
        Err(F2fStreamError::FrameTooShort { expected: 17, actual: 9 })
    ));
}
