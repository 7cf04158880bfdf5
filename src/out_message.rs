use std::cmp::min;
use bytes::BufMut;
use crate::fixed_buffer::FixedBuf;
use crate::safe_converter::PrecheckedCast;
use crate::SequenceNumber;

/// Wire tag of a message part. The tag assignment is part of the wire
///  contract and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// First reliable message of a session; its SN seeds both delivery
    ///  counters on the peer.
    Sync,
    Reliable,
    Unreliable,
    /// Zero-payload liveness refresh, never re-sent, SN 0.
    KeepAlive,
    /// Orderly close announcement, never re-sent, SN 0.
    Close,
}

impl MessageType {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            MessageType::Sync => 0,
            MessageType::Reliable => 1,
            MessageType::Unreliable => 2,
            MessageType::KeepAlive => 3,
            MessageType::Close => 4,
        }
    }

    pub(crate) fn from_wire(tag: u8) -> Option<MessageType> {
        match tag {
            0 => Some(MessageType::Sync),
            1 => Some(MessageType::Reliable),
            2 => Some(MessageType::Unreliable),
            3 => Some(MessageType::KeepAlive),
            4 => Some(MessageType::Close),
            _ => None,
        }
    }
}

/// An outbound message owned by the transmit queue, together with its
///  fragmentation cursor. The cursor tracks how many payload bytes have been
///  emitted so far; it wraps back to 0 once the whole payload went out, so
///  the next encoding pass of a re-sent message starts over.
#[derive(Debug)]
pub struct OutMessage {
    /// Reliable messages stay in the transmit queue and keep getting re-sent
    ///  until their SN shows up in the peer's ack set. Everything else is
    ///  sent exactly once.
    pub resend_until_acked: bool,
    pub message_type: MessageType,
    sequence_number: SequenceNumber,
    payload: Vec<u8>,
    pub bytes_already_sent: usize,
}

impl OutMessage {
    /// type + resend flag + sn + total_size + chunk_start + chunk_len
    pub const HEADER_SIZE: usize = 1 + 1 + 4 + 2 + 2 + 2;

    pub fn new(
        resend_until_acked: bool,
        message_type: MessageType,
        sequence_number: SequenceNumber,
        payload: Vec<u8>,
    ) -> OutMessage {
        debug_assert!(payload.len() <= u16::MAX as usize);
        OutMessage {
            resend_until_acked,
            message_type,
            sequence_number,
            payload,
            bytes_already_sent: 0,
        }
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Writes the part header and as many payload bytes starting at `offset`
    ///  as fit into the buffer. The caller has checked that at least the
    ///  header and one payload byte (for non-empty payloads) fit. Returns the
    ///  number of payload bytes written.
    pub fn encode_header_and_payload(&self, buf: &mut FixedBuf, offset: usize) -> u16 {
        debug_assert!(buf.remaining_mut() >= Self::HEADER_SIZE);
        debug_assert!(offset <= self.payload.len());

        let chunk_len = min(self.payload.len() - offset, buf.remaining_mut() - Self::HEADER_SIZE);

        buf.put_u8(self.message_type.to_wire());
        buf.put_u8(self.resend_until_acked as u8);
        buf.put_u32(self.sequence_number);
        buf.put_u16(self.payload.len().prechecked_cast());
        buf.put_u16(offset.prechecked_cast());
        buf.put_u16(chunk_len.prechecked_cast());
        buf.put_slice(&self.payload[offset..offset + chunk_len]);

        chunk_len.prechecked_cast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::sync(MessageType::Sync, 0)]
    #[case::reliable(MessageType::Reliable, 1)]
    #[case::unreliable(MessageType::Unreliable, 2)]
    #[case::keep_alive(MessageType::KeepAlive, 3)]
    #[case::close(MessageType::Close, 4)]
    fn test_message_type_wire_tags(#[case] message_type: MessageType, #[case] tag: u8) {
        assert_eq!(message_type.to_wire(), tag);
        assert_eq!(MessageType::from_wire(tag), Some(message_type));
    }

    #[rstest]
    #[case(5)]
    #[case(255)]
    fn test_message_type_unknown_tag(#[case] tag: u8) {
        assert_eq!(MessageType::from_wire(tag), None);
    }

    #[rstest]
    #[case::empty_payload(
        OutMessage::new(false, MessageType::KeepAlive, 0, vec![]),
        100, 0, 0,
        vec![3, 0, 0,0,0,0, 0,0, 0,0, 0,0],
    )]
    #[case::full_payload_fits(
        OutMessage::new(true, MessageType::Reliable, 7, vec![1, 2, 3]),
        100, 0, 3,
        vec![1, 1, 0,0,0,7, 0,3, 0,0, 0,3, 1,2,3],
    )]
    #[case::payload_truncated_to_buffer(
        OutMessage::new(true, MessageType::Reliable, 7, vec![1, 2, 3, 4, 5]),
        14, 0, 2,
        vec![1, 1, 0,0,0,7, 0,5, 0,0, 0,2, 1,2],
    )]
    #[case::continuation_chunk(
        OutMessage::new(true, MessageType::Reliable, 7, vec![1, 2, 3, 4, 5]),
        100, 2, 3,
        vec![1, 1, 0,0,0,7, 0,5, 0,2, 0,3, 3,4,5],
    )]
    #[case::unreliable_flagged_once_only(
        OutMessage::new(false, MessageType::Unreliable, 260, vec![9]),
        100, 0, 1,
        vec![2, 0, 0,0,1,4, 0,1, 0,0, 0,1, 9],
    )]
    fn test_encode_header_and_payload(
        #[case] message: OutMessage,
        #[case] capacity: usize,
        #[case] offset: usize,
        #[case] expected_written: u16,
        #[case] expected_bytes: Vec<u8>,
    ) {
        let mut buf = FixedBuf::new(capacity);
        let written = message.encode_header_and_payload(&mut buf, offset);
        assert_eq!(written, expected_written);
        assert_eq!(buf.as_ref(), expected_bytes.as_slice());
    }
}
