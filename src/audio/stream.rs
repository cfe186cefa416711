//! The real-time callback boundary
//!
//! The driver calls into us on its own thread; everything here is bounded.
//! Callbacks exchange whole frames with their worker over bounded channels
//! and recycle the buffers, so the hot path neither allocates nor blocks on
//! anything slower than a single channel operation. A capture overflow
//! drops the frame (logged once); a playback underrun plays silence and
//! reports itself on the next pull token so the worker can fade back in.

use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, Stream, StreamConfig};
use tracing::{error, warn};

use crate::{FRAME_SIZE, SAMPLE_RATE};

use super::device::DeviceInfo;
use super::error::AudioError;
use super::mix_buffer::SpscRing;
use super::worker::{CaptureEndpoint, PlaybackEndpoint, PullToken};

/// How long the output callback waits for its pre-mixed frame. The worker
/// keeps one frame ready, so anything near a frame period means trouble.
const PULL_TIMEOUT: Duration = Duration::from_millis(10);

fn stream_config(channels: u16) -> StreamConfig {
    StreamConfig {
        channels,
        sample_rate: SampleRate(SAMPLE_RATE),
        buffer_size: BufferSize::Fixed(FRAME_SIZE as u32),
    }
}

/// Open the capture stream for an input device. The callback re-chunks
/// whatever buffer size the driver delivers into exact frames and sends
/// each complete frame to the worker, non-blocking.
pub fn build_input_stream(
    device: &cpal::Device,
    info: &DeviceInfo,
    endpoint: CaptureEndpoint,
) -> Result<Stream, AudioError> {
    let frame_len = FRAME_SIZE * info.channels as usize;
    let mut chunker = SpscRing::new(4 * frame_len);
    let mut logged_overflow = false;

    let err_fn = |err| error!("capture stream error: {err}");
    let stream = device
        .build_input_stream(
            &stream_config(info.channels),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                chunker.write(data);
                while chunker.readable() >= frame_len {
                    // Each complete frame rides a recycled buffer; with none
                    // free the frame is dropped, never awaited.
                    let Ok(mut frame) = endpoint.recycle_rx.try_recv() else {
                        if !logged_overflow {
                            warn!("capture overflowing; worker not keeping up");
                            logged_overflow = true;
                        }
                        break;
                    };
                    frame.resize(frame_len, 0.0);
                    chunker.read(&mut frame);
                    if endpoint.raw_tx.try_send(frame).is_err() && !logged_overflow {
                        warn!("capture channel full; frame dropped");
                        logged_overflow = true;
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

    stream
        .play()
        .map_err(|e| AudioError::StreamError(e.to_string()))?;
    Ok(stream)
}

/// Open the playback stream for an output device. Each callback sends one
/// pull token, receives the pre-mixed frame the worker already built, and
/// falls back to silence when nothing arrives inside the window.
pub fn build_output_stream(
    device: &cpal::Device,
    info: &DeviceInfo,
    endpoint: PlaybackEndpoint,
) -> Result<Stream, AudioError> {
    let frame_len = FRAME_SIZE * info.channels as usize;
    let mut staging = SpscRing::new(4 * frame_len);
    let mut underran = false;

    let err_fn = |err| error!("playback stream error: {err}");
    let stream = device
        .build_output_stream(
            &stream_config(info.channels),
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut pulls = 0;
                while staging.readable() < data.len() && pulls < 8 {
                    pulls += 1;
                    let token = PullToken { underran };
                    underran = false;
                    if endpoint.pull_tx.try_send(token).is_err() {
                        underran = true;
                        break;
                    }
                    match endpoint.frame_rx.recv_timeout(PULL_TIMEOUT) {
                        Ok(frame) => {
                            staging.write(&frame);
                            let _ = endpoint.recycle_tx.try_send(frame);
                        }
                        Err(_) => {
                            underran = true;
                            break;
                        }
                    }
                }
                // Drain what exists; anything short of a full buffer is
                // padded with silence.
                let got = staging.read_upto(data);
                data[got..].fill(0.0);
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))?;

    stream
        .play()
        .map_err(|e| AudioError::StreamError(e.to_string()))?;
    Ok(stream)
}
