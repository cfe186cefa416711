//! Per-device worker tasks
//!
//! Each audio device gets one worker thread that owns everything mutable
//! about it: the encoder (input side) or the per-peer decoders and the
//! additive mix ring (output side). Workers multiplex over their channels,
//! rebuilding the select set whenever the roster changes, and always give
//! the output-pull event priority so the device callback is never kept
//! waiting.
//!
//! The callback never decodes: the worker keeps one frame pre-assembled and
//! hands it out the instant the pull token arrives, then uses the time
//! until the next callback to build the frame after it.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Select, Sender, TryRecvError};
use tracing::{debug, error, info, trace, warn};

use crate::network::broker::{BrokerControl, PeerFrame, WorkerFrame};
use crate::network::packet_buffer::PacketBuffer;
use crate::network::timesync::SharedClock;
use crate::protocol::{DeviceCommand, RetransmitRequest};
use crate::{PeerId, FRAME_SIZE, MAX_PACKET_LEN, MIX_RING_MS, SAMPLE_RATE, TAPER_SAMPLES};

use super::codec::{create_decoder, create_encoder, AudioDecoder, AudioEncoder, CodecKind};
use super::device::{DeviceInfo, Direction};
use super::mix_buffer::AdditiveMixBuffer;

/// Bound on frames queued ahead per peer channel.
const PEER_CHANNEL_DEPTH: usize = 16;

/// Buffers circulating between a callback and its worker.
const CALLBACK_POOL_DEPTH: usize = 8;

/// Token the output callback sends to request the next mixed frame.
/// `underran` reports whether the previous exchange timed out, so the
/// worker can fade the next audible frame back in.
#[derive(Debug, Clone, Copy, Default)]
pub struct PullToken {
    pub underran: bool,
}

/// Capture-side endpoints handed to the input stream callback.
pub struct CaptureEndpoint {
    pub raw_tx: Sender<Vec<f32>>,
    pub recycle_rx: Receiver<Vec<f32>>,
}

/// Playback-side endpoints handed to the output stream callback.
pub struct PlaybackEndpoint {
    pub pull_tx: Sender<PullToken>,
    pub frame_rx: Receiver<Vec<f32>>,
    pub recycle_tx: Sender<Vec<f32>>,
}

/// Everything a decoding worker knows about one subscribed peer. The
/// decoder is created lazily on the first packet, once the peer's channel
/// count is known.
struct PeerState {
    rx: Receiver<PeerFrame>,
    decoder: Option<Box<dyn AudioDecoder>>,
    decoder_channels: u16,
}

pub struct DeviceWorker {
    info: DeviceInfo,
    codec: CodecKind,
    encoder: Option<Box<dyn AudioEncoder>>,
    mix: Option<AdditiveMixBuffer>,
    peers: HashMap<PeerId, PeerState>,
    peer_order: Vec<PeerId>,

    cmd_rx: Receiver<Vec<u8>>,
    raw_rx: Option<Receiver<Vec<f32>>>,
    raw_recycle_tx: Option<Sender<Vec<f32>>>,
    pull_rx: Option<Receiver<PullToken>>,
    frame_tx: Option<Sender<Vec<f32>>>,
    frame_recycle_rx: Option<Receiver<Vec<f32>>>,
    input_tx: Sender<WorkerFrame>,
    control_tx: Sender<BrokerControl>,

    next_frame: Vec<f32>,
    encode_buf: Vec<u8>,
    decode_scratch: Vec<f32>,
    mix_scratch: Vec<f32>,
    pending_taper: bool,

    underruns: u64,
    tapers: u64,
    frames_encoded: u64,
    frames_mixed: u64,
}

impl DeviceWorker {
    /// Wire up a worker for `info`. Returns the worker, its command sender,
    /// and the endpoint for whichever callback this device direction has.
    #[allow(clippy::type_complexity)]
    pub fn build(
        info: DeviceInfo,
        codec: CodecKind,
        input_tx: Sender<WorkerFrame>,
        control_tx: Sender<BrokerControl>,
    ) -> Result<
        (
            DeviceWorker,
            Sender<Vec<u8>>,
            Option<CaptureEndpoint>,
            Option<PlaybackEndpoint>,
        ),
        super::codec::CodecError,
    > {
        let frame_len = FRAME_SIZE * info.channels as usize;
        let (cmd_tx, cmd_rx) = bounded(8);

        let mut encoder = None;
        let mut raw_rx = None;
        let mut raw_recycle_tx = None;
        let mut capture = None;
        let mut mix = None;
        let mut pull_rx = None;
        let mut frame_tx = None;
        let mut frame_recycle_rx = None;
        let mut playback = None;

        match info.direction {
            Direction::Input => {
                encoder = Some(create_encoder(codec, info.channels)?);
                let (tx, rx) = bounded(CALLBACK_POOL_DEPTH);
                let (recycle_tx, recycle_rx) = bounded(CALLBACK_POOL_DEPTH);
                for _ in 0..CALLBACK_POOL_DEPTH {
                    let _ = recycle_tx.try_send(vec![0.0; frame_len]);
                }
                raw_rx = Some(rx);
                raw_recycle_tx = Some(recycle_tx);
                capture = Some(CaptureEndpoint {
                    raw_tx: tx,
                    recycle_rx,
                });
            }
            Direction::Output => {
                mix = Some(AdditiveMixBuffer::new(
                    MIX_RING_MS * info.channels as usize * SAMPLE_RATE as usize / 1000,
                ));
                let (p_tx, p_rx) = bounded(4);
                let (f_tx, f_rx) = bounded(4);
                let (r_tx, r_rx) = bounded(CALLBACK_POOL_DEPTH);
                pull_rx = Some(p_rx);
                frame_tx = Some(f_tx);
                frame_recycle_rx = Some(r_rx);
                playback = Some(PlaybackEndpoint {
                    pull_tx: p_tx,
                    frame_rx: f_rx,
                    recycle_tx: r_tx,
                });
            }
        }

        let worker = DeviceWorker {
            codec,
            encoder,
            mix,
            peers: HashMap::new(),
            peer_order: Vec::new(),
            cmd_rx,
            raw_rx,
            raw_recycle_tx,
            pull_rx,
            frame_tx,
            frame_recycle_rx,
            input_tx,
            control_tx,
            next_frame: vec![0.0; frame_len],
            encode_buf: vec![0u8; MAX_PACKET_LEN],
            decode_scratch: vec![0.0; 2 * frame_len],
            mix_scratch: vec![0.0; frame_len],
            pending_taper: false,
            underruns: 0,
            tapers: 0,
            frames_encoded: 0,
            frames_mixed: 0,
            info,
        };
        Ok((worker, cmd_tx, capture, playback))
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let name = format!("worker-{}", self.info.id);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .expect("failed to spawn device worker")
    }

    /// The fan-in/fan-out loop. Returns once a `Shutdown` command arrives
    /// or an in-proc channel dies (fatal to this worker only).
    pub fn run(mut self) {
        info!(
            "worker for \"{}\" ({}, {}ch) running",
            self.info.name,
            self.info.direction.as_str(),
            self.info.channels
        );

        loop {
            // Select indices: 0 = command, 1 = raw or pull (by direction),
            // peers follow. Rebuilt every pass; the roster changes under us.
            let ready = {
                let mut sel = Select::new();
                sel.recv(&self.cmd_rx);
                if let Some(rx) = &self.raw_rx {
                    sel.recv(rx);
                }
                if let Some(rx) = &self.pull_rx {
                    sel.recv(rx);
                }
                for id in &self.peer_order {
                    sel.recv(&self.peers[id].rx);
                }
                sel.ready()
            };

            // The real-time path goes first regardless of which channel
            // woke us.
            if let Some(rx) = &self.pull_rx {
                match rx.try_recv() {
                    Ok(token) => {
                        self.handle_pull(token);
                        continue;
                    }
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => {
                        error!("{}: pull channel died", self.info.id);
                        break;
                    }
                }
            }

            if ready == 0 {
                match self.cmd_rx.try_recv() {
                    Ok(bytes) => {
                        if !self.handle_command(&bytes) {
                            break;
                        }
                    }
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => {
                        error!("{}: command channel died", self.info.id);
                        break;
                    }
                }
            } else if ready == 1 && self.raw_rx.is_some() {
                let rx = self.raw_rx.as_ref().unwrap();
                match rx.try_recv() {
                    Ok(frame) => self.handle_raw(frame),
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => {
                        error!("{}: raw audio channel died", self.info.id);
                        break;
                    }
                }
            } else if ready >= 2 {
                let peer = match self.peer_order.get(ready - 2) {
                    Some(id) => id.clone(),
                    None => continue,
                };
                match self.peers[&peer].rx.try_recv() {
                    Ok(frame) => self.handle_peer_frame(&peer, frame),
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => {
                        // Broker dropped our subscription; the next
                        // ClientList will clean this peer up.
                        trace!("{}: channel for {peer} closed", self.info.id);
                    }
                }
            }
        }

        self.cleanup();
    }

    fn cleanup(&mut self) {
        for peer in self.peer_order.clone() {
            self.remove_peer(&peer);
        }
        let dropped = self
            .mix
            .as_ref()
            .map(|mix| mix.dropped_samples())
            .unwrap_or(0);
        info!(
            "worker for \"{}\" done: {} encoded, {} mixed, {} underruns, {} tapers, {} samples dropped",
            self.info.name,
            self.frames_encoded,
            self.frames_mixed,
            self.underruns,
            self.tapers,
            dropped
        );
    }

    /// Returns false on shutdown.
    fn handle_command(&mut self, bytes: &[u8]) -> bool {
        match DeviceCommand::from_bytes(bytes) {
            DeviceCommand::Shutdown => {
                debug!("{}: shutdown", self.info.id);
                false
            }
            DeviceCommand::ClientList { identities } => {
                if self.info.direction == Direction::Output {
                    self.apply_client_list(identities);
                }
                true
            }
            DeviceCommand::Invalid => {
                warn!("{}: ignoring invalid command", self.info.id);
                true
            }
        }
    }

    /// Diff the new roster against current subscriptions: open a filtered
    /// channel and a decoder slot for every new identity, tear down every
    /// vanished one.
    fn apply_client_list(&mut self, identities: Vec<PeerId>) {
        for peer in &identities {
            if self.peers.contains_key(peer) {
                continue;
            }
            let (tx, rx) = bounded(PEER_CHANNEL_DEPTH);
            if self
                .control_tx
                .send(BrokerControl::Subscribe {
                    peer: peer.clone(),
                    device: self.info.id,
                    tx,
                })
                .is_err()
            {
                warn!("{}: broker gone, cannot subscribe {peer}", self.info.id);
                continue;
            }
            debug!("{}: subscribed to {peer}", self.info.id);
            self.peers.insert(
                peer.clone(),
                PeerState {
                    rx,
                    decoder: None,
                    decoder_channels: 0,
                },
            );
            self.peer_order.push(peer.clone());
        }

        let vanished: Vec<PeerId> = self
            .peer_order
            .iter()
            .filter(|id| !identities.contains(id))
            .cloned()
            .collect();
        for peer in vanished {
            self.remove_peer(&peer);
        }
    }

    fn remove_peer(&mut self, peer: &PeerId) {
        let _ = self.control_tx.send(BrokerControl::Unsubscribe {
            peer: peer.clone(),
            device: self.info.id,
        });
        self.peers.remove(peer);
        self.peer_order.retain(|id| id != peer);
        if let Some(mix) = &mut self.mix {
            mix.forget(peer);
        }
        debug!("{}: dropped {peer}", self.info.id);
    }

    /// A frame of raw captured audio: encode and publish to the broker. An
    /// encoder error drops the frame and the stream carries on.
    fn handle_raw(&mut self, frame: Vec<f32>) {
        if let Some(encoder) = &mut self.encoder {
            match encoder.encode(&frame, &mut self.encode_buf) {
                Ok(len) => {
                    self.frames_encoded += 1;
                    let msg = WorkerFrame {
                        device: self.info.id,
                        decoded_len: (frame.len() * 4) as u32,
                        channels: self.info.channels as u32,
                        payload: self.encode_buf[..len].to_vec(),
                    };
                    if self.input_tx.send(msg).is_err() {
                        warn!("{}: broker input channel closed", self.info.id);
                    }
                }
                Err(e) => warn!("{}: encode failed, frame dropped: {e}", self.info.id),
            }
        }
        if let Some(recycle) = &self.raw_recycle_tx {
            let _ = recycle.try_send(frame);
        }
    }

    /// The critical real-time exchange: ship the pre-assembled frame, then
    /// build the next one while the driver plays this one out.
    fn handle_pull(&mut self, token: PullToken) {
        let frame_len = FRAME_SIZE * self.info.channels as usize;

        let mut outgoing = self
            .frame_recycle_rx
            .as_ref()
            .and_then(|rx| rx.try_recv().ok())
            .unwrap_or_else(|| vec![0.0; frame_len]);
        outgoing.resize(frame_len, 0.0);
        std::mem::swap(&mut outgoing, &mut self.next_frame);

        if token.underran {
            self.underruns += 1;
            self.pending_taper = true;
            debug!("{}: output underrun reported by callback", self.info.id);
        }
        if self.pending_taper && outgoing.iter().any(|&s| s != 0.0) {
            apply_taper(&mut outgoing, self.info.channels);
            self.pending_taper = false;
            self.tapers += 1;
        }

        if let Some(tx) = &self.frame_tx {
            if tx.try_send(outgoing).is_err() {
                trace!("{}: callback not collecting frames", self.info.id);
            }
        }

        // Assemble the next frame from the mix ring.
        if let Some(mix) = &mut self.mix {
            self.next_frame.resize(frame_len, 0.0);
            if mix.max_readable() < frame_len {
                self.underruns += 1;
            }
            mix.read(&mut self.next_frame);
            self.frames_mixed += 1;
        }
    }

    /// Encoded audio from one subscribed peer: decode it, fold the channel
    /// layout onto ours and add it into the mix ring at the peer's write
    /// position.
    fn handle_peer_frame(&mut self, peer: &PeerId, frame: PeerFrame) {
        let src_channels = frame.channels as u16;
        let expected_samples = frame.decoded_len as usize / 4;

        let state = match self.peers.get_mut(peer) {
            Some(state) => state,
            None => return,
        };

        // Lazily create (or recreate on a layout change) this peer's
        // decoder now that its channel count is known.
        if state.decoder.is_none() || state.decoder_channels != src_channels {
            match create_decoder(self.codec, src_channels) {
                Ok(decoder) => {
                    state.decoder = Some(decoder);
                    state.decoder_channels = src_channels;
                }
                Err(e) => {
                    warn!("{}: no decoder for {peer}: {e}", self.info.id);
                    return;
                }
            }
        }

        if self.decode_scratch.len() < expected_samples {
            self.decode_scratch.resize(expected_samples, 0.0);
        }
        let decoder = state.decoder.as_mut().unwrap();
        let decoded = match decoder.decode(&frame.payload, &mut self.decode_scratch) {
            Ok(n) => n,
            Err(e) => {
                warn!("{}: decode from {peer} failed: {e}", self.info.id);
                return;
            }
        };
        if decoded != expected_samples {
            warn!(
                "{}: decoded {decoded} samples, sender promised {expected_samples}",
                self.info.id
            );
            return;
        }

        let samples = decoded / src_channels.max(1) as usize;
        let out_len = samples * self.info.channels as usize;
        if self.mix_scratch.len() < out_len {
            self.mix_scratch.resize(out_len, 0.0);
        }
        if !mixdown_channels(
            &self.decode_scratch[..decoded],
            src_channels,
            &mut self.mix_scratch[..out_len],
            self.info.channels,
        ) {
            warn!(
                "{}: cannot mix {src_channels} -> {} channels, frame dropped",
                self.info.id, self.info.channels
            );
            return;
        }

        if let Some(mix) = &mut self.mix {
            mix.write(peer, &self.mix_scratch[..out_len]);
        }
    }
}

/// Fold `input`'s channel layout onto `output`'s. Supported: identical
/// counts (copy), mono to many (replicate), many to mono (average). Returns
/// false for any other pairing.
pub fn mixdown_channels(
    input: &[f32],
    in_channels: u16,
    output: &mut [f32],
    out_channels: u16,
) -> bool {
    let in_ch = in_channels as usize;
    let out_ch = out_channels as usize;

    if in_channels == out_channels {
        output.copy_from_slice(input);
        return true;
    }
    if in_channels == 1 {
        for (i, &s) in input.iter().enumerate() {
            output[i * out_ch..(i + 1) * out_ch].fill(s);
        }
        return true;
    }
    if out_channels == 1 {
        for (i, group) in input.chunks_exact(in_ch).enumerate() {
            output[i] = group.iter().sum::<f32>() / in_ch as f32;
        }
        return true;
    }
    false
}

/// Linear fade-in over the first [`TAPER_SAMPLES`] sample groups of an
/// interleaved frame, suppressing the pop after an underrun.
pub fn apply_taper(frame: &mut [f32], channels: u16) {
    let ch = channels.max(1) as usize;
    let ramp = TAPER_SAMPLES.min(frame.len() / ch);
    for i in 0..ramp {
        let gain = i as f32 / ramp as f32;
        for s in &mut frame[i * ch..(i + 1) * ch] {
            *s *= gain;
        }
    }
}

/// The receive-path variant of a device worker: instead of per-peer mix
/// lanes it owns a timestamped packet buffer and schedules playout on the
/// sender's clock.
pub struct PlayoutWorker<D: AudioDecoder> {
    buffer: PacketBuffer<D>,
    clock: SharedClock,
    channels: u16,
    cmd_rx: Receiver<Vec<u8>>,
    packet_rx: Receiver<(u64, Vec<u8>)>,
    pull_rx: Receiver<PullToken>,
    frame_tx: Sender<Vec<f32>>,
    frame_recycle_rx: Receiver<Vec<f32>>,
    retransmit: Option<(UdpSocket, SocketAddr)>,
    consecutive_underruns: u32,
    underruns: u64,
    tapers: u64,
    played: u64,
    pending_taper: bool,
}

/// Channel endpoints for feeding a [`PlayoutWorker`].
pub struct PlayoutChannels {
    pub cmd_tx: Sender<Vec<u8>>,
    pub packet_tx: Sender<(u64, Vec<u8>)>,
    pub playback: PlaybackEndpoint,
}

impl<D: AudioDecoder> PlayoutWorker<D> {
    pub fn build(
        buffer: PacketBuffer<D>,
        clock: SharedClock,
        channels: u16,
        retransmit: Option<(UdpSocket, SocketAddr)>,
    ) -> (Self, PlayoutChannels) {
        let (cmd_tx, cmd_rx) = bounded(8);
        let (packet_tx, packet_rx) = bounded(64);
        let (pull_tx, pull_rx) = bounded(4);
        let (frame_tx, frame_rx) = bounded(4);
        let (recycle_tx, frame_recycle_rx) = bounded(CALLBACK_POOL_DEPTH);

        let worker = PlayoutWorker {
            buffer,
            clock,
            channels,
            cmd_rx,
            packet_rx,
            pull_rx,
            frame_tx,
            frame_recycle_rx,
            retransmit,
            consecutive_underruns: 0,
            underruns: 0,
            tapers: 0,
            played: 0,
            pending_taper: false,
        };
        let endpoints = PlayoutChannels {
            cmd_tx,
            packet_tx,
            playback: PlaybackEndpoint {
                pull_tx,
                frame_rx,
                recycle_tx,
            },
        };
        (worker, endpoints)
    }

    pub fn spawn(self) -> JoinHandle<()>
    where
        D: 'static,
    {
        std::thread::Builder::new()
            .name("playout".to_string())
            .spawn(move || self.run())
            .expect("failed to spawn playout worker")
    }

    pub fn run(mut self) {
        info!("playout worker running ({} channels)", self.channels);
        loop {
            let ready = {
                let mut sel = Select::new();
                sel.recv(&self.cmd_rx);
                sel.recv(&self.packet_rx);
                sel.recv(&self.pull_rx);
                sel.ready()
            };

            match self.pull_rx.try_recv() {
                Ok(token) => {
                    self.handle_pull(token);
                    continue;
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => break,
            }

            match ready {
                0 => match self.cmd_rx.try_recv() {
                    Ok(bytes) => {
                        if matches!(DeviceCommand::from_bytes(&bytes), DeviceCommand::Shutdown) {
                            break;
                        }
                    }
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => break,
                },
                1 => match self.packet_rx.try_recv() {
                    Ok((ts, payload)) => {
                        self.buffer.queue(ts, &payload);
                        self.request_missing();
                    }
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => break,
                },
                _ => {}
            }
        }
        info!(
            "playout done: {} frames played, {} underruns, {} tapers",
            self.played, self.underruns, self.tapers
        );
    }

    /// Ask the upstream peer for every slot still carrying synthesized
    /// audio, one datagram per timestamp, throttled by the buffer.
    fn request_missing(&mut self) {
        let Some((socket, upstream)) = &self.retransmit else {
            return;
        };
        for ts in self.buffer.pending_retransmits() {
            if let Err(e) = socket.send_to(&RetransmitRequest(ts).to_bytes(), *upstream) {
                warn!("retransmit request failed: {e}");
                break;
            }
        }
    }

    fn handle_pull(&mut self, token: PullToken) {
        let frame_len = FRAME_SIZE * self.channels as usize;
        let mut frame = self
            .frame_recycle_rx
            .try_recv()
            .unwrap_or_else(|_| vec![0.0; frame_len]);
        frame.resize(frame_len, 0.0);

        if token.underran {
            self.pending_taper = true;
        }

        let now = self.clock.host_time_ns();
        match self.buffer.next(now) {
            Some(slot) => {
                let ts = slot.timestamp;
                frame.copy_from_slice(slot.pcm());
                self.buffer.mark_played(ts);
                self.consecutive_underruns = 0;
                self.played += 1;
                if self.pending_taper && frame.iter().any(|&s| s != 0.0) {
                    apply_taper(&mut frame, self.channels);
                    self.pending_taper = false;
                    self.tapers += 1;
                }
            }
            None => {
                frame.fill(0.0);
                self.underruns += 1;
                self.consecutive_underruns += 1;
                self.pending_taper = true;
                // Two empty callbacks in a row: give up on the current
                // timeline and re-sync to whatever arrives next.
                if self.consecutive_underruns >= 2 {
                    self.buffer.reset_playout();
                }
            }
        }

        if self.frame_tx.try_send(frame).is_err() {
            trace!("playout callback not collecting frames");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::{PcmDecoder, PcmEncoder};
    use crate::audio::device::DeviceId;

    fn encode_frame(value: f32) -> (Vec<u8>, u32) {
        let mut enc = PcmEncoder::new(1);
        let pcm = vec![value; FRAME_SIZE];
        let mut out = vec![0u8; MAX_PACKET_LEN];
        let len = enc.encode(&pcm, &mut out).unwrap();
        out.truncate(len);
        (out, (FRAME_SIZE * 4) as u32)
    }

    fn output_worker() -> (
        DeviceWorker,
        Sender<Vec<u8>>,
        PlaybackEndpoint,
        Receiver<BrokerControl>,
        Receiver<WorkerFrame>,
    ) {
        let (input_tx, input_rx) = bounded(64);
        let (control_tx, control_rx) = bounded(64);
        let info = DeviceInfo {
            id: DeviceId(0),
            name: "test-out".to_string(),
            direction: Direction::Output,
            channels: 1,
        };
        let (worker, cmd_tx, capture, playback) =
            DeviceWorker::build(info, CodecKind::Pcm, input_tx, control_tx).unwrap();
        assert!(capture.is_none());
        (worker, cmd_tx, playback.unwrap(), control_rx, input_rx)
    }

    #[test]
    fn test_mixdown_equal_channels() {
        let input = [0.1, 0.2, 0.3, 0.4];
        let mut output = [0.0; 4];
        assert!(mixdown_channels(&input, 2, &mut output, 2));
        assert_eq!(output, input);
    }

    #[test]
    fn test_mixdown_mono_to_many() {
        let input = [0.5, -0.5];
        let mut output = [0.0; 6];
        assert!(mixdown_channels(&input, 1, &mut output, 3));
        assert_eq!(output, [0.5, 0.5, 0.5, -0.5, -0.5, -0.5]);
    }

    #[test]
    fn test_mixdown_many_to_mono() {
        let input = [0.2, 0.4, -0.6, 0.0];
        let mut output = [0.0; 2];
        assert!(mixdown_channels(&input, 2, &mut output, 1));
        assert!((output[0] - 0.3).abs() < 1e-6);
        assert!((output[1] + 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_mixdown_mono_roundtrip_is_identity() {
        // mono -> N -> mono reproduces the source exactly.
        let input: Vec<f32> = (0..16).map(|i| (i as f32) * 0.05 - 0.4).collect();
        let mut wide = vec![0.0; 16 * 4];
        let mut back = vec![0.0; 16];
        assert!(mixdown_channels(&input, 1, &mut wide, 4));
        assert!(mixdown_channels(&wide, 4, &mut back, 1));
        assert_eq!(input, back);
    }

    #[test]
    fn test_mixdown_rejects_unsupported() {
        let input = [0.0; 6];
        let mut output = [0.0; 4];
        assert!(!mixdown_channels(&input, 3, &mut output, 2));
    }

    #[test]
    fn test_taper_ramps_from_silence() {
        let mut frame = vec![1.0; FRAME_SIZE];
        apply_taper(&mut frame, 1);
        assert_eq!(frame[0], 0.0);
        assert!(frame[TAPER_SAMPLES / 2] < 0.6);
        assert_eq!(frame[TAPER_SAMPLES], 1.0);
        assert_eq!(frame[FRAME_SIZE - 1], 1.0);
    }

    #[test]
    fn test_worker_mixes_one_frame_ahead() {
        let (worker, cmd_tx, playback, control_rx, _input_rx) = output_worker();
        let handle = worker.spawn();

        // Announce one peer; the worker registers a subscription.
        let roster = DeviceCommand::ClientList {
            identities: vec![PeerId::from("peer-a")],
        };
        cmd_tx.send(roster.to_bytes()).unwrap();
        let peer_tx = match control_rx
            .recv_timeout(std::time::Duration::from_secs(1))
            .unwrap()
        {
            BrokerControl::Subscribe { peer, tx, .. } => {
                assert_eq!(peer, PeerId::from("peer-a"));
                tx
            }
            _ => panic!("expected subscription"),
        };

        // Deliver one encoded frame of 0.5s.
        let (payload, decoded_len) = encode_frame(0.5);
        peer_tx
            .send(PeerFrame {
                peer: PeerId::from("peer-a"),
                decoded_len,
                channels: 1,
                payload,
            })
            .unwrap();

        // Give the worker a moment to decode and mix.
        std::thread::sleep(std::time::Duration::from_millis(50));

        // First pull returns the frame assembled before the audio arrived:
        // silence. The peer audio rides the *next* frame.
        playback.pull_tx.send(PullToken::default()).unwrap();
        let first = playback
            .frame_rx
            .recv_timeout(std::time::Duration::from_secs(1))
            .unwrap();
        assert!(first.iter().all(|&s| s == 0.0));

        playback.pull_tx.send(PullToken::default()).unwrap();
        let second = playback
            .frame_rx
            .recv_timeout(std::time::Duration::from_secs(1))
            .unwrap();
        assert!((second[0] - 0.5).abs() < 1e-3);
        assert!((second[FRAME_SIZE - 1] - 0.5).abs() < 1e-3);

        cmd_tx.send(DeviceCommand::Shutdown.to_bytes()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_worker_roster_removal_unsubscribes() {
        let (worker, cmd_tx, _playback, control_rx, _input_rx) = output_worker();
        let handle = worker.spawn();

        let add = DeviceCommand::ClientList {
            identities: vec![PeerId::from("x")],
        };
        cmd_tx.send(add.to_bytes()).unwrap();
        match control_rx
            .recv_timeout(std::time::Duration::from_secs(1))
            .unwrap()
        {
            BrokerControl::Subscribe { peer, .. } => assert_eq!(peer, PeerId::from("x")),
            _ => panic!("expected subscription"),
        }

        let drop_all = DeviceCommand::ClientList { identities: vec![] };
        cmd_tx.send(drop_all.to_bytes()).unwrap();
        match control_rx
            .recv_timeout(std::time::Duration::from_secs(1))
            .unwrap()
        {
            BrokerControl::Unsubscribe { peer, .. } => assert_eq!(peer, PeerId::from("x")),
            _ => panic!("expected unsubscription"),
        }

        cmd_tx.send(DeviceCommand::Shutdown.to_bytes()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_input_worker_encodes_and_publishes() {
        let (input_tx, input_rx) = bounded(64);
        let (control_tx, _control_rx) = bounded(64);
        let info = DeviceInfo {
            id: DeviceId(1),
            name: "test-in".to_string(),
            direction: Direction::Input,
            channels: 1,
        };
        let (worker, cmd_tx, capture, playback) =
            DeviceWorker::build(info, CodecKind::Pcm, input_tx, control_tx).unwrap();
        assert!(playback.is_none());
        let capture = capture.unwrap();
        let handle = worker.spawn();

        let mut frame = capture.recycle_rx.recv().unwrap();
        frame.iter_mut().for_each(|s| *s = 0.25);
        capture.raw_tx.send(frame).unwrap();

        let published = input_rx
            .recv_timeout(std::time::Duration::from_secs(1))
            .unwrap();
        assert_eq!(published.device, DeviceId(1));
        assert_eq!(published.channels, 1);
        assert_eq!(published.decoded_len, (FRAME_SIZE * 4) as u32);

        let mut dec = PcmDecoder::new(1);
        let mut out = vec![0.0f32; FRAME_SIZE];
        dec.decode(&published.payload, &mut out).unwrap();
        assert!((out[0] - 0.25).abs() < 1e-3);

        cmd_tx.send(DeviceCommand::Shutdown.to_bytes()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_playout_worker_resyncs_after_two_underruns() {
        let buffer = PacketBuffer::new(PcmDecoder::new(1));
        let clock = SharedClock::new();
        let (worker, chans) = PlayoutWorker::build(buffer, clock, 1, None);
        let handle = worker.spawn();

        // No packets queued: both pulls underrun with silence.
        for _ in 0..2 {
            chans.playback.pull_tx.send(PullToken::default()).unwrap();
            let frame = chans
                .playback
                .frame_rx
                .recv_timeout(std::time::Duration::from_secs(1))
                .unwrap();
            assert!(frame.iter().all(|&s| s == 0.0));
        }

        chans.cmd_tx.send(DeviceCommand::Shutdown.to_bytes()).unwrap();
        handle.join().unwrap();
    }
}
