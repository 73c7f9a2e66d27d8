use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::buffer::PooledBuffer;
use crate::error::{F2fStreamError, Result};
use crate::sequence::{FlowId, SequenceNumber};

/// Largest datagram the link will put on the wire.
pub const MAX_DATAGRAM_SIZE: usize = 1450;
/// Largest payload a service sub-flow may hand to a channel in one message.
pub const MAX_SERVICE_MESSAGE_SIZE: usize = 1024;
/// Overlay message header: length prefix plus type tag.
pub const MESSAGE_HEADER_LEN: usize = 5;
/// Datagram sequence number prepended by the encryption layer.
pub const SEQUENCE_NUMBER_BYTES: usize = 4;
/// Authentication tag appended by the encryption layer.
pub const AUTH_TAG_LEN: usize = 20;
/// Cipher block size the encryption layer pads to.
pub const PADDING_BLOCK: usize = 16;

/// Advertised window value meaning "no window".
pub const NO_WINDOW: i32 = -1;

/// High bit of the flags byte carries datagram eligibility.
const DATAGRAM_BIT: u8 = 0x80;

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    ChannelData = 0x01,
    ServiceData = 0x02,
}

impl TryFrom<u8> for FrameType {
    type Error = F2fStreamError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FrameType::ChannelData),
            0x02 => Ok(FrameType::ServiceData),
            other => Err(F2fStreamError::UnknownFrameType(other)),
        }
    }
}

/// Control flags carried by service data messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlFlags(pub u8);

impl ControlFlags {
    pub const NONE: Self = Self(0x00);
    pub const ACK: Self = Self(0x01);
    pub const RST: Self = Self(0x02);
    pub const SYN: Self = Self(0x04);

    pub fn contains(self, flag: ControlFlags) -> bool {
        (self.0 & flag.0) == flag.0
    }

    pub fn insert(&mut self, flag: ControlFlags) {
        self.0 |= flag.0;
    }
}

/// A service channel data message.
///
/// Carries one sub-flow's payload (or acknowledgments) across a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub channel_id: u32,
    /// Receive window advertised by the sender, or `NO_WINDOW`.
    pub window: i32,
    pub num: u32,
    pub flow: FlowId,
    pub flags: ControlFlags,
    pub acks: Vec<u32>,
    /// Whether the message may travel over the unreliable datagram path.
    pub datagram: bool,
    pub payload: PooledBuffer,
}

impl DataMessage {
    /// A plain data message for `seq`.
    pub fn data(channel_id: u32, seq: SequenceNumber, payload: PooledBuffer) -> Self {
        Self {
            channel_id,
            window: NO_WINDOW,
            num: seq.num(),
            flow: seq.flow(),
            flags: ControlFlags::NONE,
            acks: Vec::new(),
            datagram: false,
            payload,
        }
    }

    /// An acknowledgment of `acks` on `flow`, advertising `window`.
    pub fn acknowledge(
        channel_id: u32,
        window: i32,
        flow: FlowId,
        acks: Vec<u32>,
        datagram: bool,
    ) -> Self {
        Self {
            channel_id,
            window,
            num: 0,
            flow,
            flags: ControlFlags::ACK,
            acks,
            datagram,
            payload: PooledBuffer::empty(),
        }
    }

    pub fn sequence(&self) -> SequenceNumber {
        SequenceNumber::new(self.flow, self.num)
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(ControlFlags::ACK)
    }

    pub fn is_rst(&self) -> bool {
        self.flags.contains(ControlFlags::RST)
    }

    pub fn is_syn(&self) -> bool {
        self.flags.contains(ControlFlags::SYN)
    }

    /// Serialized length without the frame type tag.
    pub fn body_len(&self) -> usize {
        4 + 4 + 4 + 2 + 1 + 2 + self.acks.len() * 4 + 4 + self.payload.len()
    }

    /// Bytes this message occupies on the wire once the encryption layer
    /// has added its sequence number, padding and authentication tag.
    pub fn wire_size(&self) -> usize {
        wire_size(MESSAGE_HEADER_LEN + self.body_len())
    }
}

/// Wire size of a serialized overlay message of `serialized` bytes.
pub fn wire_size(serialized: usize) -> usize {
    SEQUENCE_NUMBER_BYTES + serialized + padding_len(serialized) + AUTH_TAG_LEN
}

/// Padding needed to round `serialized` up to a whole cipher block.
pub fn padding_len(serialized: usize) -> usize {
    (PADDING_BLOCK - serialized % PADDING_BLOCK) % PADDING_BLOCK
}

/// Overlay wire frame.
///
/// Binary layout (all fields big-endian):
///
/// ```text
/// +-------+----------+--- variable ---+
/// | type  |  ... fields per type ...  |
/// | (1B)  |                            |
/// +-------+----------------------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// CHANNEL_DATA: channel_id(4) + payload_len(4) + payload(N)
    ChannelData { channel_id: u32, payload: Bytes },
    /// SERVICE_DATA: channel_id(4) + window(4) + seq(4) + flow(2) + flags(1)
    /// + ack_count(2) + acks(4*N) + payload_len(4) + payload(N)
    ServiceData(DataMessage),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::ChannelData { .. } => FrameType::ChannelData,
            Frame::ServiceData(_) => FrameType::ServiceData,
        }
    }

    pub fn channel_id(&self) -> u32 {
        match self {
            Frame::ChannelData { channel_id, .. } => *channel_id,
            Frame::ServiceData(msg) => msg.channel_id,
        }
    }

    /// Encode this frame into a byte buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encode into a pre-allocated `BytesMut`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Frame::ChannelData {
                channel_id,
                payload,
            } => {
                buf.put_u8(FrameType::ChannelData as u8);
                buf.put_u32(*channel_id);
                buf.put_u32(payload.len() as u32);
                buf.put_slice(payload);
            }
            Frame::ServiceData(msg) => {
                buf.put_u8(FrameType::ServiceData as u8);
                buf.put_u32(msg.channel_id);
                buf.put_i32(msg.window);
                buf.put_u32(msg.num);
                buf.put_u16(msg.flow);
                let mut flags = msg.flags.0 & !DATAGRAM_BIT;
                if msg.datagram {
                    flags |= DATAGRAM_BIT;
                }
                buf.put_u8(flags);
                buf.put_u16(msg.acks.len() as u16);
                for ack in &msg.acks {
                    buf.put_u32(*ack);
                }
                buf.put_u32(msg.payload.len() as u32);
                buf.put_slice(&msg.payload);
            }
        }
    }

    /// The total number of bytes this frame will occupy when encoded.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Frame::ChannelData { payload, .. } => 4 + 4 + payload.len(),
            Frame::ServiceData(msg) => msg.body_len(),
        }
    }

    /// Decode a frame from the given byte buffer.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(F2fStreamError::FrameTooShort {
                expected: 1,
                actual: 0,
            });
        }

        let frame_type = FrameType::try_from(data[0])?;
        let data = &data[1..];

        match frame_type {
            FrameType::ChannelData => {
                Self::ensure_len(data, 8)?;
                let channel_id = (&data[0..4]).get_u32();
                let payload_len = (&data[4..8]).get_u32() as usize;
                let data = &data[8..];
                Self::ensure_len(data, payload_len)?;
                Ok(Frame::ChannelData {
                    channel_id,
                    payload: Bytes::copy_from_slice(&data[..payload_len]),
                })
            }
            FrameType::ServiceData => {
                Self::ensure_len(data, 17)?; // 4+4+4+2+1+2
                let channel_id = (&data[0..4]).get_u32();
                let window = (&data[4..8]).get_i32();
                let num = (&data[8..12]).get_u32();
                let flow = (&data[12..14]).get_u16();
                let raw_flags = data[14];
                let ack_count = (&data[15..17]).get_u16() as usize;
                let mut data = &data[17..];
                Self::ensure_len(data, ack_count * 4 + 4)?;
                let mut acks = Vec::with_capacity(ack_count);
                for _ in 0..ack_count {
                    acks.push(data.get_u32());
                }
                let payload_len = data.get_u32() as usize;
                Self::ensure_len(data, payload_len)?;
                let payload = Bytes::copy_from_slice(&data[..payload_len]);
                Ok(Frame::ServiceData(DataMessage {
                    channel_id,
                    window,
                    num,
                    flow,
                    flags: ControlFlags(raw_flags & !DATAGRAM_BIT),
                    acks,
                    datagram: raw_flags & DATAGRAM_BIT != 0,
                    payload: PooledBuffer::from(payload),
                }))
            }
        }
    }

    fn ensure_len(data: &[u8], needed: usize) -> Result<()> {
        if data.len() < needed {
            Err(F2fStreamError::FrameTooShort {
                expected: needed,
                actual: data.len(),
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_rounds_to_block() {
        assert_eq!(padding_len(16), 0);
        assert_eq!(padding_len(17), 15);
        assert_eq!(padding_len(31), 1);
    }

    #[test]
    fn wire_size_adds_crypto_overhead() {
        // 27 serialized bytes pad to 32.
        assert_eq!(wire_size(27), 4 + 27 + 5 + 20);
    }

    #[test]
    fn service_data_flags_survive_encoding() {
        let mut msg = DataMessage::data(
            9,
            SequenceNumber::new(2, 0),
            PooledBuffer::from(&b"hi"[..]),
        );
        msg.flags.insert(ControlFlags::SYN);
        msg.datagram = true;

        let decoded = Frame::decode(&Frame::ServiceData(msg.clone()).encode()).unwrap();
        match decoded {
            Frame::ServiceData(d) => {
                assert!(d.is_syn());
                assert!(!d.is_rst());
                assert!(d.datagram);
                assert_eq!(d, msg);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn encoded_len_matches_body() {
        let msg = DataMessage::acknowledge(1, 4096, 3, vec![1, 2, 3], false);
        let frame = Frame::ServiceData(msg.clone());
        assert_eq!(frame.encode().len(), 1 + msg.body_len());
    }

    #[test]
    fn truncated_ack_list_rejected() {
        let msg = DataMessage::acknowledge(1, 0, 3, vec![1, 2], false);
        let bytes = Frame::ServiceData(msg).encode();
        let result = Frame::decode(&bytes[..bytes.len() - 6]);
        assert!(matches!(result, Err(F2fStreamError::FrameTooShort { .. })));
    }
}
