//! Wire formats
//!
//! Everything that crosses a process boundary is defined here: the framed
//! world audio message, the identity probe, the multicast datagram, timing
//! and retransmit packets, and the command messages the broker sends to
//! device workers.

mod command;
mod packet;

pub use command::DeviceCommand;
pub use packet::{
    decode_identity_reply, encode_identity_reply, extract_channel, MulticastFrame,
    RetransmitRequest, TimingPing, TimingReply, WorldMessage, MULTICAST_HEADER_SIZE,
};

/// Opaque identity of a remote node, in practice its address and port.
/// Compared by byte equality; used as routing key and subscription filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}
