//! Network packet formats
//!
//! The broker path carries audio as a four-frame logical message, each frame
//! prefixed with a u32 big-endian length:
//! - routing envelope (sender identity, opaque bytes)
//! - decoded byte length: u32 big-endian
//! - channel count: u32 big-endian
//! - encoded payload: raw bytes, at most [`crate::MAX_PACKET_LEN`]
//!
//! An envelope followed by an empty frame is an identity probe; the reply is
//! the responder's identity string, NUL-terminated, on the prober's socket.
//!
//! The multicast path and the timing/retransmit side channels use flat
//! little-endian datagrams.

use crate::{PeerId, MAX_PACKET_LEN};

/// Header bytes of a multicast audio datagram: timestamp + channels_included
/// + channel_offset.
pub const MULTICAST_HEADER_SIZE: usize = 12;

/// A message on the broker's world socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorldMessage {
    /// Empty body: the sender wants to learn our identity.
    Probe { from: PeerId },
    /// One encoded audio frame from a peer.
    Audio {
        from: PeerId,
        decoded_len: u32,
        channels: u32,
        payload: Vec<u8>,
    },
}

impl WorldMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            WorldMessage::Probe { from } => {
                push_frame(&mut buf, from.as_bytes());
                push_frame(&mut buf, &[]);
            }
            WorldMessage::Audio {
                from,
                decoded_len,
                channels,
                payload,
            } => {
                push_frame(&mut buf, from.as_bytes());
                push_frame(&mut buf, &decoded_len.to_be_bytes());
                push_frame(&mut buf, &channels.to_be_bytes());
                push_frame(&mut buf, payload);
            }
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Option<WorldMessage> {
        let mut cursor = 0;
        let envelope = read_frame(data, &mut cursor)?;
        let from = PeerId(std::str::from_utf8(envelope).ok()?.to_string());

        let second = read_frame(data, &mut cursor)?;
        if second.is_empty() && cursor == data.len() {
            return Some(WorldMessage::Probe { from });
        }

        let decoded_len = u32::from_be_bytes(second.try_into().ok()?);
        let channels = u32::from_be_bytes(read_frame(data, &mut cursor)?.try_into().ok()?);
        let payload = read_frame(data, &mut cursor)?;
        if cursor != data.len() || payload.len() > MAX_PACKET_LEN {
            return None;
        }

        Some(WorldMessage::Audio {
            from,
            decoded_len,
            channels,
            payload: payload.to_vec(),
        })
    }
}

fn push_frame(buf: &mut Vec<u8>, frame: &[u8]) {
    buf.extend_from_slice(&(frame.len() as u32).to_be_bytes());
    buf.extend_from_slice(frame);
}

fn read_frame<'a>(data: &'a [u8], cursor: &mut usize) -> Option<&'a [u8]> {
    let len_bytes = data.get(*cursor..*cursor + 4)?;
    let len = u32::from_be_bytes(len_bytes.try_into().ok()?) as usize;
    let frame = data.get(*cursor + 4..*cursor + 4 + len)?;
    *cursor += 4 + len;
    Some(frame)
}

/// Identity-probe reply: the responder's identity string, NUL-terminated.
pub fn encode_identity_reply(identity: &PeerId) -> Vec<u8> {
    let mut buf = identity.as_bytes().to_vec();
    buf.push(0);
    buf
}

/// Parse an identity-probe reply.
pub fn decode_identity_reply(data: &[u8]) -> Option<PeerId> {
    let nul = data.iter().position(|&b| b == 0)?;
    let id = std::str::from_utf8(&data[..nul]).ok()?;
    if id.is_empty() {
        return None;
    }
    Some(PeerId(id.to_string()))
}

/// A multicast audio datagram carrying one frame for a contiguous span of
/// channels:
///
/// | offset | size | field |
/// |---|---|---|
/// | 0 | 8 | presentation timestamp, ns, little-endian |
/// | 8 | 2 | channels included |
/// | 10 | 2 | channel offset |
/// | 12 | 2 per channel | payload lengths |
/// | ... | variable | concatenated encoded payloads |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastFrame {
    pub timestamp_ns: u64,
    pub channel_offset: u16,
    pub payloads: Vec<Vec<u8>>,
}

impl MulticastFrame {
    pub fn to_bytes(&self) -> Vec<u8> {
        let total: usize = self.payloads.iter().map(|p| p.len()).sum();
        let mut buf =
            Vec::with_capacity(MULTICAST_HEADER_SIZE + 2 * self.payloads.len() + total);
        buf.extend_from_slice(&self.timestamp_ns.to_le_bytes());
        buf.extend_from_slice(&(self.payloads.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.channel_offset.to_le_bytes());
        for p in &self.payloads {
            buf.extend_from_slice(&(p.len() as u16).to_le_bytes());
        }
        for p in &self.payloads {
            buf.extend_from_slice(p);
        }
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Option<MulticastFrame> {
        let (timestamp_ns, included, channel_offset) = parse_multicast_header(data)?;
        let mut lengths = Vec::with_capacity(included as usize);
        for c in 0..included as usize {
            let off = MULTICAST_HEADER_SIZE + 2 * c;
            lengths.push(u16::from_le_bytes(data.get(off..off + 2)?.try_into().ok()?) as usize);
        }
        let mut offset = MULTICAST_HEADER_SIZE + 2 * included as usize;
        let mut payloads = Vec::with_capacity(included as usize);
        for len in lengths {
            payloads.push(data.get(offset..offset + len)?.to_vec());
            offset += len;
        }
        Some(MulticastFrame {
            timestamp_ns,
            channel_offset,
            payloads,
        })
    }
}

fn parse_multicast_header(data: &[u8]) -> Option<(u64, u16, u16)> {
    if data.len() < MULTICAST_HEADER_SIZE {
        return None;
    }
    let timestamp_ns = u64::from_le_bytes(data[0..8].try_into().ok()?);
    let included = u16::from_le_bytes([data[8], data[9]]);
    let offset = u16::from_le_bytes([data[10], data[11]]);
    Some((timestamp_ns, included, offset))
}

/// Slice one channel's payload out of a multicast datagram without copying
/// the rest. Returns the presentation timestamp and the payload, or `None`
/// when `channel_idx` is not covered by this datagram.
pub fn extract_channel(data: &[u8], channel_idx: u16) -> Option<(u64, &[u8])> {
    let (timestamp_ns, included, channel_offset) = parse_multicast_header(data)?;
    if channel_idx < channel_offset || channel_idx >= channel_offset + included {
        return None;
    }
    let our_slot = (channel_idx - channel_offset) as usize;

    let mut payload_start = MULTICAST_HEADER_SIZE + 2 * included as usize;
    let mut our_len = 0;
    for c in 0..=our_slot {
        let off = MULTICAST_HEADER_SIZE + 2 * c;
        let len = u16::from_le_bytes(data.get(off..off + 2)?.try_into().ok()?) as usize;
        if c < our_slot {
            payload_start += len;
        } else {
            our_len = len;
        }
    }
    Some((timestamp_ns, data.get(payload_start..payload_start + our_len)?))
}

/// An outgoing timing ping: the sender's realtime clock in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingPing(pub u64);

impl TimingPing {
    pub const SIZE: usize = 8;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> Option<TimingPing> {
        Some(TimingPing(u64::from_le_bytes(data.try_into().ok()?)))
    }
}

/// A timing reply: the echoed ping timestamp followed by the responder's
/// current realtime clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingReply {
    pub echoed_tx_ns: u64,
    pub remote_ns: u64,
}

impl TimingReply {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..8].copy_from_slice(&self.echoed_tx_ns.to_le_bytes());
        buf[8..].copy_from_slice(&self.remote_ns.to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Option<TimingReply> {
        if data.len() != Self::SIZE {
            return None;
        }
        Some(TimingReply {
            echoed_tx_ns: u64::from_le_bytes(data[..8].try_into().ok()?),
            remote_ns: u64::from_le_bytes(data[8..].try_into().ok()?),
        })
    }
}

/// A request that the upstream peer retransmit the packet with this
/// presentation timestamp. One datagram per missing slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitRequest(pub u64);

impl RetransmitRequest {
    pub const SIZE: usize = 8;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> Option<RetransmitRequest> {
        Some(RetransmitRequest(u64::from_le_bytes(data.try_into().ok()?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_message_roundtrip() {
        let msg = WorldMessage::Audio {
            from: PeerId::from("fe80::1:5040"),
            decoded_len: 480 * 4,
            channels: 1,
            payload: vec![7u8; 120],
        };
        assert_eq!(WorldMessage::from_bytes(&msg.to_bytes()), Some(msg));
    }

    #[test]
    fn test_probe_roundtrip() {
        let msg = WorldMessage::Probe {
            from: PeerId::from("192.168.1.9:5040"),
        };
        assert_eq!(WorldMessage::from_bytes(&msg.to_bytes()), Some(msg));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let msg = WorldMessage::Audio {
            from: PeerId::from("x:1"),
            decoded_len: 0,
            channels: 1,
            payload: vec![0u8; MAX_PACKET_LEN + 1],
        };
        assert_eq!(WorldMessage::from_bytes(&msg.to_bytes()), None);
    }

    #[test]
    fn test_truncated_message_rejected() {
        let msg = WorldMessage::Audio {
            from: PeerId::from("x:1"),
            decoded_len: 4,
            channels: 1,
            payload: vec![1, 2, 3],
        };
        let bytes = msg.to_bytes();
        assert_eq!(WorldMessage::from_bytes(&bytes[..bytes.len() - 1]), None);
    }

    #[test]
    fn test_identity_reply_roundtrip() {
        let id = PeerId::from("fe80::aa:5040");
        let bytes = encode_identity_reply(&id);
        assert_eq!(*bytes.last().unwrap(), 0);
        assert_eq!(decode_identity_reply(&bytes), Some(id));
    }

    #[test]
    fn test_multicast_roundtrip() {
        let frame = MulticastFrame {
            timestamp_ns: 0x1122_3344_5566_7788,
            channel_offset: 2,
            payloads: vec![vec![1, 2, 3], vec![], vec![4, 5]],
        };
        assert_eq!(MulticastFrame::from_bytes(&frame.to_bytes()), Some(frame));
    }

    #[test]
    fn test_extract_channel() {
        let frame = MulticastFrame {
            timestamp_ns: 42,
            channel_offset: 1,
            payloads: vec![vec![10, 11], vec![20], vec![30, 31, 32]],
        };
        let bytes = frame.to_bytes();

        // Channel 0 is below the offset, channel 4 above the span.
        assert_eq!(extract_channel(&bytes, 0), None);
        assert_eq!(extract_channel(&bytes, 4), None);

        let (ts, payload) = extract_channel(&bytes, 2).unwrap();
        assert_eq!(ts, 42);
        assert_eq!(payload, &[20]);

        let (_, payload) = extract_channel(&bytes, 3).unwrap();
        assert_eq!(payload, &[30, 31, 32]);
    }

    #[test]
    fn test_timing_roundtrip() {
        let ping = TimingPing(123_456_789);
        assert_eq!(TimingPing::from_bytes(&ping.to_bytes()), Some(ping));

        let reply = TimingReply {
            echoed_tx_ns: 123_456_789,
            remote_ns: 987_654_321,
        };
        assert_eq!(TimingReply::from_bytes(&reply.to_bytes()), Some(reply));
    }

    #[test]
    fn test_retransmit_roundtrip() {
        let req = RetransmitRequest(55_000_000);
        assert_eq!(RetransmitRequest::from_bytes(&req.to_bytes()), Some(req));
    }
}
