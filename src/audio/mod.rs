//! Audio side of the engine
//!
//! Device records and enumeration, the codec adapters, the mix rings, the
//! per-device workers and the real-time stream callbacks.

pub mod codec;
mod device;
mod error;
pub mod mix_buffer;
mod stream;
pub mod worker;

pub use codec::{AudioDecoder, AudioEncoder, CodecKind};
pub use device::{list_devices, resolve_spec, DeviceId, DeviceInfo, DeviceListing, Direction};
pub use error::AudioError;
pub use mix_buffer::{AdditiveMixBuffer, SpscRing};
pub use stream::{build_input_stream, build_output_stream};
pub use worker::{DeviceWorker, PlayoutWorker};
