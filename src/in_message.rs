use std::cmp::{max, min};
use std::collections::BTreeMap;
use anyhow::bail;
use bytes::Buf;
use crate::out_message::MessageType;
use crate::SequenceNumber;

/// One decoded message part: a chunk of a message's payload plus enough
///  header information to place it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMessagePart {
    pub message_type: MessageType,
    pub resend_until_acked: bool,
    pub sequence_number: SequenceNumber,
    pub total_size: u16,
    pub chunk_start: u16,
    pub payload: Vec<u8>,
}

impl InMessagePart {
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<InMessagePart> {
        let tag = buf.try_get_u8()?;
        let message_type = match MessageType::from_wire(tag) {
            Some(t) => t,
            None => bail!("unknown message type tag {}", tag),
        };
        let resend_until_acked = match buf.try_get_u8()? {
            0 => false,
            1 => true,
            flag => bail!("invalid resend flag {}", flag),
        };
        let sequence_number = buf.try_get_u32()?;
        let total_size = buf.try_get_u16()?;
        let chunk_start = buf.try_get_u16()?;
        let chunk_len = buf.try_get_u16()?;

        if chunk_start as u32 + chunk_len as u32 > total_size as u32 {
            bail!("chunk {}+{} exceeds total size {}", chunk_start, chunk_len, total_size);
        }
        if buf.remaining() < chunk_len as usize {
            bail!("truncated payload: {} bytes announced, {} available", chunk_len, buf.remaining());
        }

        let mut payload = vec![0; chunk_len as usize];
        buf.copy_to_slice(&mut payload);

        Ok(InMessagePart {
            message_type,
            resend_until_acked,
            sequence_number,
            total_size,
            chunk_start,
            payload,
        })
    }

    /// A part carries a whole message iff it starts at offset 0 and covers
    ///  the announced total size.
    pub fn is_complete(&self) -> bool {
        self.chunk_start == 0 && self.payload.len() == self.total_size as usize
    }

    pub fn get_complete_message(&self) -> Option<InMessageFull> {
        if !self.is_complete() {
            return None;
        }
        Some(InMessageFull {
            sequence_number: self.sequence_number,
            payload: self.payload.clone(),
        })
    }
}

/// A fully reassembled inbound message, ready for user delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMessageFull {
    pub sequence_number: SequenceNumber,
    pub payload: Vec<u8>,
}

/// A partially received message: a pre-sized payload buffer plus the merged
///  byte ranges that have been written so far.
#[derive(Debug)]
pub struct PendingMessage {
    pub sequence_number: SequenceNumber,
    total_size: u16,
    payload: Vec<u8>,
    /// disjoint, non-adjacent covered ranges, start -> end (exclusive)
    coverage: BTreeMap<u32, u32>,
}

impl PendingMessage {
    pub fn from_part(part: &InMessagePart) -> PendingMessage {
        let mut result = PendingMessage {
            sequence_number: part.sequence_number,
            total_size: part.total_size,
            payload: vec![0; part.total_size as usize],
            coverage: BTreeMap::new(),
        };
        result.update_payload(part.chunk_start, &part.payload);
        result
    }

    /// Copies a chunk into the buffer and unions the covered range. Bytes
    ///  beyond the buffer (a peer disagreeing with itself on the total size)
    ///  are ignored.
    pub fn update_payload(&mut self, chunk_start: u16, bytes: &[u8]) {
        let start = chunk_start as usize;
        if start >= self.payload.len() {
            return;
        }
        let len = min(bytes.len(), self.payload.len() - start);
        if len == 0 {
            return;
        }
        self.payload[start..start + len].copy_from_slice(&bytes[..len]);
        self.add_range(start as u32, (start + len) as u32);
    }

    pub fn is_complete(&self) -> bool {
        if self.total_size == 0 {
            return true;
        }
        self.coverage.get(&0) == Some(&(self.total_size as u32))
    }

    pub fn get_complete_message(&self) -> Option<InMessageFull> {
        if !self.is_complete() {
            return None;
        }
        Some(InMessageFull {
            sequence_number: self.sequence_number,
            payload: self.payload.clone(),
        })
    }

    fn add_range(&mut self, start: u32, end: u32) {
        let mut new_start = start;
        let mut new_end = end;

        // absorb every existing range that overlaps or touches [start, end)
        let absorbed = self.coverage
            .range(..=end)
            .filter(|(_, &e)| e >= start)
            .map(|(&s, _)| s)
            .collect::<Vec<_>>();
        for s in absorbed {
            let e = self.coverage.remove(&s).expect("key taken from the map itself");
            new_start = min(new_start, s);
            new_end = max(new_end, e);
        }

        self.coverage.insert(new_start, new_end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use bytes::BufMut;
    use crate::fixed_buffer::FixedBuf;
    use crate::out_message::OutMessage;

    fn part(sequence_number: SequenceNumber, total_size: u16, chunk_start: u16, payload: &[u8]) -> InMessagePart {
        InMessagePart {
            message_type: MessageType::Reliable,
            resend_until_acked: true,
            sequence_number,
            total_size,
            chunk_start,
            payload: payload.to_vec(),
        }
    }

    #[rstest]
    #[case::whole(part(1, 3, 0, b"abc"), true)]
    #[case::empty_whole(part(1, 0, 0, b""), true)]
    #[case::prefix(part(1, 5, 0, b"abc"), false)]
    #[case::middle(part(1, 5, 2, b"cd"), false)]
    #[case::tail(part(1, 5, 2, b"cde"), false)]
    fn test_part_is_complete(#[case] part: InMessagePart, #[case] expected: bool) {
        assert_eq!(part.is_complete(), expected);
        assert_eq!(part.get_complete_message().is_some(), expected);
    }

    #[rstest]
    #[case::in_order(3, vec![(0, b"ab".as_slice()), (2, b"c".as_slice())], b"abc")]
    #[case::reverse_order(3, vec![(2, b"c".as_slice()), (0, b"ab".as_slice())], b"abc")]
    #[case::overlap(4, vec![(0, b"abc".as_slice()), (2, b"xy".as_slice())], b"abxy")]
    #[case::duplicate_chunk(3, vec![(0, b"ab".as_slice()), (0, b"ab".as_slice()), (2, b"c".as_slice())], b"abc")]
    #[case::three_chunks_middle_last(5, vec![(0, b"ab".as_slice()), (3, b"de".as_slice()), (2, b"c".as_slice())], b"abcde")]
    fn test_pending_completes(
        #[case] total_size: u16,
        #[case] chunks: Vec<(u16, &[u8])>,
        #[case] expected: &[u8],
    ) {
        let (first_start, first_bytes) = chunks[0];
        let mut pending = PendingMessage::from_part(&part(9, total_size, first_start, first_bytes));

        for (i, &(start, bytes)) in chunks.iter().enumerate().skip(1) {
            assert!(!pending.is_complete(), "complete after {} of {} chunks", i, chunks.len());
            pending.update_payload(start, bytes);
        }

        assert!(pending.is_complete());
        let full = pending.get_complete_message().unwrap();
        assert_eq!(full.sequence_number, 9);
        assert_eq!(full.payload, expected);
    }

    #[rstest]
    #[case::gap(4, vec![(0, b"ab".as_slice()), (3, b"d".as_slice())])]
    #[case::missing_head(4, vec![(1, b"bcd".as_slice())])]
    #[case::missing_tail(4, vec![(0, b"abc".as_slice())])]
    fn test_pending_incomplete(#[case] total_size: u16, #[case] chunks: Vec<(u16, &[u8])>) {
        let (first_start, first_bytes) = chunks[0];
        let mut pending = PendingMessage::from_part(&part(9, total_size, first_start, first_bytes));
        for &(start, bytes) in &chunks[1..] {
            pending.update_payload(start, bytes);
        }
        assert!(!pending.is_complete());
        assert!(pending.get_complete_message().is_none());
    }

    #[test]
    fn test_pending_ignores_bytes_beyond_total_size() {
        let mut pending = PendingMessage::from_part(&part(9, 3, 0, b"ab"));
        pending.update_payload(2, b"cXY");
        assert!(pending.is_complete());
        assert_eq!(pending.get_complete_message().unwrap().payload, b"abc");

        pending.update_payload(7, b"Z");
        assert_eq!(pending.get_complete_message().unwrap().payload, b"abc");
    }

    #[rstest]
    #[case::whole_message(OutMessage::new(true, MessageType::Reliable, 12, b"hello".to_vec()), 0)]
    #[case::empty_sync(OutMessage::new(true, MessageType::Sync, 0, vec![]), 0)]
    #[case::continuation(OutMessage::new(true, MessageType::Reliable, 12, b"hello world".to_vec()), 6)]
    #[case::unreliable(OutMessage::new(false, MessageType::Unreliable, 3, b"xy".to_vec()), 0)]
    fn test_part_codec_round_trip(#[case] message: OutMessage, #[case] offset: usize) {
        let mut buf = FixedBuf::new(100);
        let written = message.encode_header_and_payload(&mut buf, offset);

        let mut b: &[u8] = buf.as_ref();
        let part = InMessagePart::deser(&mut b).unwrap();
        assert!(b.is_empty());

        assert_eq!(part.message_type, message.message_type);
        assert_eq!(part.resend_until_acked, message.resend_until_acked);
        assert_eq!(part.sequence_number, message.sequence_number());
        assert_eq!(part.total_size as usize, message.payload_len());
        assert_eq!(part.chunk_start as usize, offset);
        assert_eq!(part.payload.len(), written as usize);
    }

    fn raw_part(tag: u8, resend: u8, total_size: u16, chunk_start: u16, chunk_len: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = FixedBuf::new(100);
        buf.put_u8(tag);
        buf.put_u8(resend);
        buf.put_u32(77);
        buf.put_u16(total_size);
        buf.put_u16(chunk_start);
        buf.put_u16(chunk_len);
        buf.put_slice(payload);
        buf.into_vec()
    }

    #[rstest]
    #[case::unknown_tag(raw_part(9, 1, 1, 0, 1, b"x"))]
    #[case::bad_resend_flag(raw_part(1, 2, 1, 0, 1, b"x"))]
    #[case::chunk_beyond_total(raw_part(1, 1, 3, 2, 2, b"xy"))]
    #[case::announced_more_than_present(raw_part(1, 1, 9, 0, 9, b"xy"))]
    #[case::truncated_header(vec![1, 1, 0, 0])]
    fn test_deser_rejects(#[case] bytes: Vec<u8>) {
        let mut b: &[u8] = &bytes;
        assert!(InMessagePart::deser(&mut b).is_err());
    }
}
