//! Network side of the engine
//!
//! The broker and its peer bookkeeping, the UDP transport, the packet
//! buffer for the multicast receive path, and clock synchronization.

pub mod broker;
mod error;
pub mod packet_buffer;
pub mod roster;
pub mod timesync;
pub mod transport;

pub use broker::{Broker, BrokerChannels, BrokerControl, PeerFrame, WorkerFrame, WorkerLink};
pub use error::NetworkError;
pub use packet_buffer::PacketBuffer;
pub use roster::{ClientRoster, OutboundSet};
pub use timesync::SharedClock;
