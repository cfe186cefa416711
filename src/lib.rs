//! meshjam - peer-to-peer real-time audio conferencing for cooperative LANs
//!
//! Every node captures audio from its local input devices, encodes it and
//! fans it out to connected peers, while decoding, time-aligning and mixing
//! the streams it receives onto its local output devices. One broker thread
//! routes between the network and one worker thread per audio device.

pub mod audio;
pub mod config;
pub mod network;
pub mod protocol;

pub use audio::worker::DeviceWorker;
pub use network::broker::Broker;
pub use protocol::PeerId;

/// Fixed engine sample rate in Hz. Devices that cannot run at this rate are
/// rejected at startup; no sample-rate conversion is performed.
pub const SAMPLE_RATE: u32 = 48_000;

/// Samples per channel in one frame (10 ms at 48 kHz). The unit of exchange
/// with the driver, the codec and the mix ring.
pub const FRAME_SIZE: usize = 480;

/// One frame period in nanoseconds.
pub const FRAME_PERIOD_NS: u64 = 10_000_000;

/// Upper bound on channels per device.
pub const MAX_CHANNELS: u16 = 16;

/// Hard cap on a single encoded payload, in bytes.
pub const MAX_PACKET_LEN: usize = 1486;

/// Capacity of the additive output mix ring, in milliseconds.
pub const MIX_RING_MS: usize = 40;

/// Interval between broker sweeps for silent inbound peers. A peer absent
/// for two full sweeps is evicted.
pub const SWEEP_INTERVAL_MS: u64 = 5_000;

/// Minimum spacing between retransmit-request rounds.
pub const RETRANSMIT_THROTTLE_MS: u64 = 2;

/// Nominal interval between timing pings (jittered by +-5 ms).
pub const PING_INTERVAL_MS: u64 = 200;

/// Depth of the timing-sample window used for clock synchronization.
pub const TIMING_WINDOW: usize = 100;

/// Number of slots in the receive-side packet buffer.
pub const PACKET_BUFFER_SLOTS: usize = 100;

/// Default playout window around host-now, in milliseconds.
pub const DEFAULT_BUFF_TIME_MS: u64 = 55;

/// Length of the linear fade-in applied after an underrun, in samples.
pub const TAPER_SAMPLES: usize = (SAMPLE_RATE / 200) as usize;
