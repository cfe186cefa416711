//! Audio codec adapters
//!
//! Encoding and decoding sit behind small traits so the per-device worker
//! and the packet engine never touch a concrete codec. Decoders additionally
//! expose an exact state snapshot: the packet engine stores the pre-decode
//! state with every queued packet so a late-arriving authoritative packet
//! can be re-decoded as if it had arrived on time.
//!
//! The default codec is 16-bit PCM with repeat-and-fade concealment, which
//! needs no system libraries. Opus support requires the `opus-codec` feature
//! and libopus.

use thiserror::Error;

use crate::{FRAME_SIZE, MAX_PACKET_LEN};

/// Codec selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodecKind {
    /// 16-bit PCM (no compression; LAN use and tests)
    #[default]
    Pcm,
    /// Opus (requires the `opus-codec` feature)
    Opus,
}

impl std::str::FromStr for CodecKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, CodecError> {
        match s.to_ascii_lowercase().as_str() {
            "pcm" | "pcm16" => Ok(CodecKind::Pcm),
            "opus" => Ok(CodecKind::Opus),
            other => Err(CodecError::NotAvailable(format!(
                "unknown codec \"{other}\""
            ))),
        }
    }
}

/// Errors from codec operations.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("codec initialization failed: {0}")]
    InitializationFailed(String),

    #[error("encode failed: {0}")]
    EncodeFailed(String),

    #[error("decode failed: {0}")]
    DecodeFailed(String),

    #[error("encoded frame would be {actual} bytes, cap is {cap}")]
    PayloadTooLarge { actual: usize, cap: usize },

    #[error("invalid frame size: expected {expected} samples, got {actual}")]
    InvalidFrameSize { expected: usize, actual: usize },

    #[error("invalid encoded data: {0}")]
    InvalidData(String),

    #[error("decoder state mismatch: expected {expected} bytes, got {actual}")]
    StateMismatch { expected: usize, actual: usize },

    #[error("codec not available: {0}")]
    NotAvailable(String),
}

/// An opaque byte copy of a decoder's complete state.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderState(Vec<u8>);

impl DecoderState {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Encodes one interleaved frame to bytes.
pub trait AudioEncoder: Send {
    /// Encode `pcm` (interleaved, `FRAME_SIZE * channels` samples) into
    /// `out`, returning the encoded length.
    fn encode(&mut self, pcm: &[f32], out: &mut [u8]) -> Result<usize, CodecError>;

    fn channels(&self) -> u16;
}

/// Decodes encoded frames, with loss concealment and exact state snapshots.
pub trait AudioDecoder: Send {
    /// Decode one frame into `out` (interleaved). Returns the total number
    /// of samples written.
    fn decode(&mut self, data: &[u8], out: &mut [f32]) -> Result<usize, CodecError>;

    /// Synthesize the frame *preceding* `next_data` from that packet's
    /// error-correction side information. Returns samples written.
    fn decode_fec(&mut self, next_data: &[u8], out: &mut [f32]) -> Result<usize, CodecError>;

    /// Byte copy of the complete decoder state.
    fn save_state(&self) -> DecoderState;

    /// Restore a state previously produced by `save_state` on a decoder of
    /// the same configuration.
    fn restore_state(&mut self, state: &DecoderState) -> Result<(), CodecError>;

    fn channels(&self) -> u16;
}

impl<T: AudioDecoder + ?Sized> AudioDecoder for Box<T> {
    fn decode(&mut self, data: &[u8], out: &mut [f32]) -> Result<usize, CodecError> {
        (**self).decode(data, out)
    }

    fn decode_fec(&mut self, next_data: &[u8], out: &mut [f32]) -> Result<usize, CodecError> {
        (**self).decode_fec(next_data, out)
    }

    fn save_state(&self) -> DecoderState {
        (**self).save_state()
    }

    fn restore_state(&mut self, state: &DecoderState) -> Result<(), CodecError> {
        (**self).restore_state(state)
    }

    fn channels(&self) -> u16 {
        (**self).channels()
    }
}

/// Construct an encoder for the given codec and channel count.
pub fn create_encoder(
    kind: CodecKind,
    channels: u16,
) -> Result<Box<dyn AudioEncoder>, CodecError> {
    match kind {
        CodecKind::Pcm => Ok(Box::new(PcmEncoder::new(channels))),
        #[cfg(feature = "opus-codec")]
        CodecKind::Opus => Ok(Box::new(opus_impl::OpusEncoder::new(channels)?)),
        #[cfg(not(feature = "opus-codec"))]
        CodecKind::Opus => Err(CodecError::NotAvailable(
            "Opus requires the 'opus-codec' feature and libopus".to_string(),
        )),
    }
}

/// Construct a decoder for the given codec and channel count.
pub fn create_decoder(
    kind: CodecKind,
    channels: u16,
) -> Result<Box<dyn AudioDecoder>, CodecError> {
    match kind {
        CodecKind::Pcm => Ok(Box::new(PcmDecoder::new(channels))),
        #[cfg(feature = "opus-codec")]
        CodecKind::Opus => Ok(Box::new(opus_impl::OpusDecoder::new(channels)?)),
        #[cfg(not(feature = "opus-codec"))]
        CodecKind::Opus => Err(CodecError::NotAvailable(
            "Opus requires the 'opus-codec' feature and libopus".to_string(),
        )),
    }
}

/// PCM encoder: f32 samples quantized to i16 little-endian.
///
/// A mono 10 ms frame is 960 bytes and fits the payload cap; wider layouts
/// exceed it and are rejected per frame (the worker drops and logs).
pub struct PcmEncoder {
    channels: u16,
}

impl PcmEncoder {
    pub fn new(channels: u16) -> Self {
        Self { channels }
    }
}

impl AudioEncoder for PcmEncoder {
    fn encode(&mut self, pcm: &[f32], out: &mut [u8]) -> Result<usize, CodecError> {
        let expected = FRAME_SIZE * self.channels as usize;
        if pcm.len() != expected {
            return Err(CodecError::InvalidFrameSize {
                expected,
                actual: pcm.len(),
            });
        }
        let enc_len = pcm.len() * 2;
        if enc_len > out.len() || enc_len > MAX_PACKET_LEN {
            return Err(CodecError::PayloadTooLarge {
                actual: enc_len,
                cap: out.len().min(MAX_PACKET_LEN),
            });
        }
        for (i, &s) in pcm.iter().enumerate() {
            let q = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            out[2 * i..2 * i + 2].copy_from_slice(&q.to_le_bytes());
        }
        Ok(enc_len)
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

/// PCM decoder with repeat-and-fade concealment.
///
/// Concealment repeats the last good frame faded by 0.85 per consecutive
/// loss and goes silent after five. That state (last frame + loss counter)
/// is the decoder's entire state, so snapshots are exact by construction.
pub struct PcmDecoder {
    channels: u16,
    last_frame: Vec<f32>,
    consecutive_losses: u32,
}

const FADEOUT_FACTOR: f32 = 0.85;
const MAX_LOSSES_BEFORE_SILENCE: u32 = 5;

impl PcmDecoder {
    pub fn new(channels: u16) -> Self {
        Self {
            channels,
            last_frame: vec![0.0; FRAME_SIZE * channels as usize],
            consecutive_losses: 0,
        }
    }
}

impl AudioDecoder for PcmDecoder {
    fn decode(&mut self, data: &[u8], out: &mut [f32]) -> Result<usize, CodecError> {
        if !data.len().is_multiple_of(2) {
            return Err(CodecError::InvalidData(format!(
                "PCM data length {} is not a multiple of 2",
                data.len()
            )));
        }
        let samples = data.len() / 2;
        if samples > out.len() {
            return Err(CodecError::DecodeFailed(format!(
                "output buffer too small: {} < {}",
                out.len(),
                samples
            )));
        }
        for (i, chunk) in data.chunks_exact(2).enumerate() {
            out[i] = i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / i16::MAX as f32;
        }
        self.last_frame.clear();
        self.last_frame.extend_from_slice(&out[..samples]);
        self.consecutive_losses = 0;
        Ok(samples)
    }

    fn decode_fec(&mut self, next_data: &[u8], out: &mut [f32]) -> Result<usize, CodecError> {
        // PCM carries no real side information; conceal from the last good
        // frame sized like the neighboring packet.
        let samples = (next_data.len() / 2).min(out.len());
        self.consecutive_losses += 1;

        if self.consecutive_losses > MAX_LOSSES_BEFORE_SILENCE {
            out[..samples].fill(0.0);
            return Ok(samples);
        }

        let gain = FADEOUT_FACTOR.powi(self.consecutive_losses as i32);
        for (i, slot) in out[..samples].iter_mut().enumerate() {
            *slot = self.last_frame.get(i).copied().unwrap_or(0.0) * gain;
        }
        Ok(samples)
    }

    fn save_state(&self) -> DecoderState {
        let mut bytes = Vec::with_capacity(4 + self.last_frame.len() * 4);
        bytes.extend_from_slice(&self.consecutive_losses.to_le_bytes());
        for &s in &self.last_frame {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        DecoderState(bytes)
    }

    fn restore_state(&mut self, state: &DecoderState) -> Result<(), CodecError> {
        let expected = 4 + FRAME_SIZE * self.channels as usize * 4;
        if state.0.len() != expected {
            return Err(CodecError::StateMismatch {
                expected,
                actual: state.0.len(),
            });
        }
        self.consecutive_losses = u32::from_le_bytes(state.0[..4].try_into().unwrap());
        self.last_frame.clear();
        for chunk in state.0[4..].chunks_exact(4) {
            self.last_frame
                .push(f32::from_le_bytes(chunk.try_into().unwrap()));
        }
        Ok(())
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

// Opus implementation (requires the opus-codec feature). The encoder uses
// the safe binding; the decoder owns the raw libopus state blob so that
// save_state can be the byte copy the packet engine depends on.
#[cfg(feature = "opus-codec")]
mod opus_impl {
    use std::os::raw::c_int;

    use super::*;
    use crate::SAMPLE_RATE;

    pub struct OpusEncoder {
        encoder: opus::Encoder,
        channels: u16,
    }

    impl OpusEncoder {
        pub fn new(channels: u16) -> Result<Self, CodecError> {
            let ch = match channels {
                1 => opus::Channels::Mono,
                2 => opus::Channels::Stereo,
                other => {
                    return Err(CodecError::InitializationFailed(format!(
                        "Opus supports 1 or 2 channels, not {other}"
                    )))
                }
            };
            let encoder = opus::Encoder::new(SAMPLE_RATE, ch, opus::Application::Audio)
                .map_err(|e| CodecError::InitializationFailed(e.to_string()))?;
            Ok(Self { encoder, channels })
        }
    }

    impl AudioEncoder for OpusEncoder {
        fn encode(&mut self, pcm: &[f32], out: &mut [u8]) -> Result<usize, CodecError> {
            let expected = FRAME_SIZE * self.channels as usize;
            if pcm.len() != expected {
                return Err(CodecError::InvalidFrameSize {
                    expected,
                    actual: pcm.len(),
                });
            }
            self.encoder
                .encode_float(pcm, out)
                .map_err(|e| CodecError::EncodeFailed(e.to_string()))
        }

        fn channels(&self) -> u16 {
            self.channels
        }
    }

    /// Opus decoder over a manually managed state blob. The blob is held in
    /// a u64 vector for alignment; libopus initializes and mutates it in
    /// place, and snapshots are plain byte copies of it.
    pub struct OpusDecoder {
        blob: Vec<u64>,
        state_len: usize,
        channels: u16,
    }

    // The blob is only ever touched through libopus calls on this thread.
    unsafe impl Send for OpusDecoder {}

    impl OpusDecoder {
        pub fn new(channels: u16) -> Result<Self, CodecError> {
            if channels != 1 && channels != 2 {
                return Err(CodecError::InitializationFailed(format!(
                    "Opus supports 1 or 2 channels, not {channels}"
                )));
            }
            let state_len =
                unsafe { audiopus_sys::opus_decoder_get_size(channels as c_int) } as usize;
            let mut blob = vec![0u64; state_len.div_ceil(8)];
            let ret = unsafe {
                audiopus_sys::opus_decoder_init(
                    blob.as_mut_ptr() as *mut audiopus_sys::OpusDecoder,
                    SAMPLE_RATE as i32,
                    channels as c_int,
                )
            };
            if ret != 0 {
                return Err(CodecError::InitializationFailed(format!(
                    "opus_decoder_init returned {ret}"
                )));
            }
            Ok(Self {
                blob,
                state_len,
                channels,
            })
        }

        fn raw(&mut self) -> *mut audiopus_sys::OpusDecoder {
            self.blob.as_mut_ptr() as *mut audiopus_sys::OpusDecoder
        }

        fn decode_inner(
            &mut self,
            data: &[u8],
            out: &mut [f32],
            fec: bool,
        ) -> Result<usize, CodecError> {
            let max_frames = (out.len() / self.channels as usize) as c_int;
            let frame_size = if fec {
                // FEC reconstruction must name the missing frame's length.
                (FRAME_SIZE as c_int).min(max_frames)
            } else {
                max_frames
            };
            let decoded = unsafe {
                audiopus_sys::opus_decode_float(
                    self.raw(),
                    data.as_ptr(),
                    data.len() as i32,
                    out.as_mut_ptr(),
                    frame_size,
                    fec as c_int,
                )
            };
            if decoded < 0 {
                return Err(CodecError::DecodeFailed(format!(
                    "opus_decode_float returned {decoded}"
                )));
            }
            Ok(decoded as usize * self.channels as usize)
        }

        fn state_bytes(&self) -> &[u8] {
            // Safe view over the initialized prefix of the blob.
            unsafe {
                std::slice::from_raw_parts(self.blob.as_ptr() as *const u8, self.state_len)
            }
        }
    }

    impl AudioDecoder for OpusDecoder {
        fn decode(&mut self, data: &[u8], out: &mut [f32]) -> Result<usize, CodecError> {
            self.decode_inner(data, out, false)
        }

        fn decode_fec(&mut self, next_data: &[u8], out: &mut [f32]) -> Result<usize, CodecError> {
            self.decode_inner(next_data, out, true)
        }

        fn save_state(&self) -> DecoderState {
            DecoderState(self.state_bytes().to_vec())
        }

        fn restore_state(&mut self, state: &DecoderState) -> Result<(), CodecError> {
            if state.0.len() != self.state_len {
                return Err(CodecError::StateMismatch {
                    expected: self.state_len,
                    actual: state.0.len(),
                });
            }
            unsafe {
                std::ptr::copy_nonoverlapping(
                    state.0.as_ptr(),
                    self.blob.as_mut_ptr() as *mut u8,
                    self.state_len,
                );
            }
            Ok(())
        }

        fn channels(&self) -> u16 {
            self.channels
        }
    }
}

#[cfg(feature = "opus-codec")]
pub use opus_impl::{OpusDecoder, OpusEncoder};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_roundtrip() {
        let mut enc = PcmEncoder::new(1);
        let mut dec = PcmDecoder::new(1);

        let pcm: Vec<f32> = (0..FRAME_SIZE)
            .map(|i| (i as f32 / FRAME_SIZE as f32) * 2.0 - 1.0)
            .collect();
        let mut encoded = vec![0u8; MAX_PACKET_LEN];
        let len = enc.encode(&pcm, &mut encoded).unwrap();
        assert_eq!(len, FRAME_SIZE * 2);

        let mut out = vec![0.0f32; FRAME_SIZE];
        let n = dec.decode(&encoded[..len], &mut out).unwrap();
        assert_eq!(n, FRAME_SIZE);
        for (orig, got) in pcm.iter().zip(&out) {
            assert!((orig - got).abs() < 1e-4);
        }
    }

    #[test]
    fn test_pcm_stereo_frame_exceeds_cap() {
        let mut enc = PcmEncoder::new(2);
        let pcm = vec![0.0f32; FRAME_SIZE * 2];
        let mut out = vec![0u8; 4096];
        assert!(matches!(
            enc.encode(&pcm, &mut out),
            Err(CodecError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_pcm_wrong_frame_size() {
        let mut enc = PcmEncoder::new(1);
        let mut out = vec![0u8; MAX_PACKET_LEN];
        assert!(matches!(
            enc.encode(&[0.0; 100], &mut out),
            Err(CodecError::InvalidFrameSize { .. })
        ));
    }

    #[test]
    fn test_pcm_fec_repeats_and_fades() {
        let mut enc = PcmEncoder::new(1);
        let mut dec = PcmDecoder::new(1);

        let pcm = vec![0.5f32; FRAME_SIZE];
        let mut encoded = vec![0u8; MAX_PACKET_LEN];
        let len = enc.encode(&pcm, &mut encoded).unwrap();

        let mut out = vec![0.0f32; FRAME_SIZE];
        dec.decode(&encoded[..len], &mut out).unwrap();

        let mut concealed = vec![0.0f32; FRAME_SIZE];
        dec.decode_fec(&encoded[..len], &mut concealed).unwrap();
        assert!((concealed[0] - 0.5 * 0.85).abs() < 1e-3);

        dec.decode_fec(&encoded[..len], &mut concealed).unwrap();
        assert!((concealed[0] - 0.5 * 0.85 * 0.85).abs() < 1e-3);
    }

    #[test]
    fn test_pcm_fec_silence_after_many_losses() {
        let mut dec = PcmDecoder::new(1);
        let mut out = vec![0.7f32; FRAME_SIZE];
        let next = vec![0u8; FRAME_SIZE * 2];
        for _ in 0..MAX_LOSSES_BEFORE_SILENCE + 1 {
            dec.decode_fec(&next, &mut out).unwrap();
        }
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_pcm_state_snapshot_is_exact() {
        let mut enc = PcmEncoder::new(1);
        let mut dec = PcmDecoder::new(1);

        let pcm: Vec<f32> = (0..FRAME_SIZE).map(|i| (i as f32 * 0.01).sin()).collect();
        let mut encoded = vec![0u8; MAX_PACKET_LEN];
        let len = enc.encode(&pcm, &mut encoded).unwrap();

        let mut out = vec![0.0f32; FRAME_SIZE];
        dec.decode(&encoded[..len], &mut out).unwrap();

        let saved = dec.save_state();

        // Mutate the state, then restore and check concealment output is
        // bit-identical to a decoder that never diverged.
        let mut scratch = vec![0.0f32; FRAME_SIZE];
        dec.decode_fec(&encoded[..len], &mut scratch).unwrap();
        dec.decode_fec(&encoded[..len], &mut scratch).unwrap();

        dec.restore_state(&saved).unwrap();
        let mut restored_out = vec![0.0f32; FRAME_SIZE];
        dec.decode_fec(&encoded[..len], &mut restored_out).unwrap();

        let mut fresh = PcmDecoder::new(1);
        fresh.decode(&encoded[..len], &mut out).unwrap();
        let mut fresh_out = vec![0.0f32; FRAME_SIZE];
        fresh.decode_fec(&encoded[..len], &mut fresh_out).unwrap();

        assert_eq!(restored_out, fresh_out);
    }

    #[test]
    fn test_state_mismatch_rejected() {
        let mut mono = PcmDecoder::new(1);
        let stereo_state = PcmDecoder::new(2).save_state();
        assert!(matches!(
            mono.restore_state(&stereo_state),
            Err(CodecError::StateMismatch { .. })
        ));
    }

    #[test]
    fn test_codec_kind_parse() {
        assert_eq!("pcm".parse::<CodecKind>().unwrap(), CodecKind::Pcm);
        assert_eq!("PCM16".parse::<CodecKind>().unwrap(), CodecKind::Pcm);
        assert_eq!("opus".parse::<CodecKind>().unwrap(), CodecKind::Opus);
        assert!("mp3".parse::<CodecKind>().is_err());
    }

    #[cfg(feature = "opus-codec")]
    mod opus_tests {
        use super::*;

        #[test]
        fn test_opus_roundtrip() {
            let mut enc = create_encoder(CodecKind::Opus, 1).unwrap();
            let mut dec = create_decoder(CodecKind::Opus, 1).unwrap();

            let pcm: Vec<f32> = (0..FRAME_SIZE)
                .map(|i| (i as f32 * 2.0 * std::f32::consts::PI / 48.0).sin() * 0.5)
                .collect();
            let mut encoded = vec![0u8; MAX_PACKET_LEN];
            let len = enc.encode(&pcm, &mut encoded).unwrap();
            assert!(len < FRAME_SIZE * 2);

            let mut out = vec![0.0f32; FRAME_SIZE];
            let n = dec.decode(&encoded[..len], &mut out).unwrap();
            assert_eq!(n, FRAME_SIZE);
        }

        #[test]
        fn test_opus_snapshot_restores_stream_position() {
            let mut enc = create_encoder(CodecKind::Opus, 1).unwrap();
            let mut dec = create_decoder(CodecKind::Opus, 1).unwrap();

            let frame =
                |k: usize| -> Vec<f32> { vec![((k as f32) * 0.1).sin() * 0.3; FRAME_SIZE] };
            let mut encoded = vec![0u8; MAX_PACKET_LEN];
            let mut out = vec![0.0f32; FRAME_SIZE];

            let len = enc.encode(&frame(0), &mut encoded).unwrap();
            dec.decode(&encoded[..len], &mut out).unwrap();

            let saved = dec.save_state();
            let len1 = enc.encode(&frame(1), &mut encoded).unwrap();
            let first: Vec<u8> = encoded[..len1].to_vec();

            let mut once = vec![0.0f32; FRAME_SIZE];
            dec.decode(&first, &mut once).unwrap();

            dec.restore_state(&saved).unwrap();
            let mut twice = vec![0.0f32; FRAME_SIZE];
            dec.decode(&first, &mut twice).unwrap();

            assert_eq!(once, twice);
        }
    }
}
