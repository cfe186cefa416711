//! Audio error types

use thiserror::Error;

/// Errors from the audio subsystem.
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("ambiguous direction for device \"{0}\"; specify input: or output:")]
    AmbiguousDirection(String),

    #[error("device \"{name}\" supports at most {max} {direction} channels, {requested} requested")]
    TooManyChannels {
        name: String,
        direction: &'static str,
        max: u16,
        requested: u16,
    },

    #[error("invalid channel count {0}; must be between 1 and 16")]
    BadChannelCount(u16),

    #[error("failed to open device: {0}")]
    DeviceOpenFailed(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("a worker channel closed unexpectedly")]
    ChannelClosed,
}
