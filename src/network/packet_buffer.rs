//! Timestamped packet buffer with FEC synthesis and scheduled playout
//!
//! The receive path for packet streams: packets arrive in any order, each
//! carrying a presentation timestamp on the sender's clock. They are kept
//! sorted by timestamp in a fixed pool of slots. Gaps are filled immediately
//! with frames synthesized from the next packet's error-correction side
//! information; when the authoritative packet arrives late, it replaces the
//! synthesized one and everything after it is re-decoded from the decoder
//! snapshots stored alongside each slot.

use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::audio::codec::{AudioDecoder, DecoderState};
use crate::{
    DEFAULT_BUFF_TIME_MS, FRAME_PERIOD_NS, FRAME_SIZE, MAX_PACKET_LEN, PACKET_BUFFER_SLOTS,
    RETRANSMIT_THROTTLE_MS,
};

/// One pooled packet slot. Buffers are allocated once when the pool is
/// built and reused for the life of the engine.
pub struct PacketSlot {
    pub timestamp: u64,
    /// Synthesized from the next packet's FEC data rather than decoded from
    /// its own payload.
    pub fec: bool,
    encoded: Vec<u8>,
    pcm: Vec<f32>,
    /// Decoder state captured immediately before this slot was decoded.
    snapshot: Option<DecoderState>,
}

impl PacketSlot {
    fn new(channels: u16) -> Self {
        Self {
            timestamp: 0,
            fec: false,
            encoded: Vec::with_capacity(MAX_PACKET_LEN),
            pcm: vec![0.0; FRAME_SIZE * channels as usize],
            snapshot: None,
        }
    }

    pub fn pcm(&self) -> &[f32] {
        &self.pcm
    }
}

/// Fixed-size ordered packet buffer plus its decoder.
pub struct PacketBuffer<D: AudioDecoder> {
    /// Live slots, strictly ascending by timestamp.
    live: Vec<Box<PacketSlot>>,
    free: Vec<Box<PacketSlot>>,
    decoder: D,
    last_played_ts: u64,
    buff_time_ns: u64,
    last_request: Option<Instant>,
}

impl<D: AudioDecoder> PacketBuffer<D> {
    pub fn new(decoder: D) -> Self {
        Self::with_buff_time(decoder, DEFAULT_BUFF_TIME_MS)
    }

    pub fn with_buff_time(decoder: D, buff_time_ms: u64) -> Self {
        let channels = decoder.channels();
        let free = (0..PACKET_BUFFER_SLOTS)
            .map(|_| Box::new(PacketSlot::new(channels)))
            .collect();
        Self {
            live: Vec::with_capacity(PACKET_BUFFER_SLOTS),
            free,
            decoder,
            last_played_ts: 0,
            buff_time_ns: buff_time_ms * 1_000_000,
            last_request: None,
        }
    }

    pub fn queued(&self) -> usize {
        self.live.len()
    }

    pub fn last_played_ts(&self) -> u64 {
        self.last_played_ts
    }

    /// Forget the playout position so the stream re-synchronizes to
    /// whatever arrives next.
    pub fn reset_playout(&mut self) {
        self.last_played_ts = 0;
    }

    /// Index at which a packet with timestamp `ts` keeps the sequence
    /// strictly ascending.
    pub fn insertion_point(&self, ts: u64) -> usize {
        self.live.partition_point(|slot| slot.timestamp < ts)
    }

    /// Queue an arrived packet, synthesizing FEC frames for any gap before
    /// it and upgrading a previously synthesized slot when the real data
    /// shows up late.
    pub fn queue(&mut self, ts: u64, enc_data: &[u8]) {
        if enc_data.len() > MAX_PACKET_LEN {
            warn!("oversized packet ({}B) dropped", enc_data.len());
            return;
        }

        let insert_idx = self.insertion_point(ts);

        // Too old: playout has moved past this timestamp.
        if ts < self.last_played_ts && self.last_played_ts != 0 {
            trace!("stale packet {ts:#x} dropped");
            return;
        }

        // Already present?
        if let Some(slot) = self.live.get(insert_idx) {
            if slot.timestamp == ts {
                if slot.fec {
                    self.upgrade_fec_slot(insert_idx, enc_data);
                } else {
                    trace!("duplicate packet {ts:#x} dropped");
                }
                return;
            }
        }

        // Fill the gap between the previous timestamp and this one with
        // FEC-synthesized frames sourced from this packet's payload.
        let prev_ts = if insert_idx > 0 {
            self.live[insert_idx - 1].timestamp
        } else {
            self.last_played_ts
        };
        let mut insert_idx = insert_idx;
        if prev_ts != 0 {
            let skipped =
                ((ts as i64 - prev_ts as i64) / FRAME_PERIOD_NS as i64 - 1).max(0) as u64;
            // A slot stays reserved for the authoritative packet itself.
            let skipped = skipped.min(self.free.len().saturating_sub(1) as u64);
            if skipped > 0 {
                debug!(
                    "gap of {skipped} frames before {ts:#x}; synthesizing from FEC data"
                );
                // Start decoding from the state stream at the insertion
                // point if a later packet already holds it.
                if let Some(state) = self
                    .live
                    .get(insert_idx)
                    .and_then(|slot| slot.snapshot.clone())
                {
                    if let Err(e) = self.decoder.restore_state(&state) {
                        warn!("decoder restore failed: {e}");
                    }
                }
                for k in 1..=skipped {
                    let fec_ts = prev_ts + k * FRAME_PERIOD_NS;
                    if self.insert_slot(insert_idx, fec_ts, enc_data, true) {
                        insert_idx += 1;
                    }
                }
            }
        }

        self.insert_slot(insert_idx, ts, enc_data, false);
    }

    /// Place one decoded slot at `idx`. Saves the pre-decode snapshot, then
    /// decodes (in FEC mode when synthesizing). Returns false when the pool
    /// is exhausted or the decode fails; the packet is dropped, never the
    /// existing queue.
    fn insert_slot(&mut self, idx: usize, ts: u64, enc_data: &[u8], fec: bool) -> bool {
        if self.live.len() >= PACKET_BUFFER_SLOTS {
            trace!("packet buffer full, dropping {ts:#x}");
            return false;
        }
        let mut slot = match self.free.pop() {
            Some(slot) => slot,
            None => return false,
        };

        slot.timestamp = ts;
        slot.fec = fec;
        slot.encoded.clear();
        slot.encoded.extend_from_slice(enc_data);
        slot.snapshot = Some(self.decoder.save_state());
        slot.pcm.fill(0.0);

        let result = if fec {
            self.decoder.decode_fec(&slot.encoded, &mut slot.pcm)
        } else {
            self.decoder.decode(&slot.encoded, &mut slot.pcm)
        };
        if let Err(e) = result {
            // Transient decode errors drop the offending frame; the decoder
            // state advances past it.
            warn!("decode of {ts:#x} failed, frame dropped: {e}");
            self.free.push(slot);
            return false;
        }

        self.live.insert(idx, slot);
        true
    }

    /// The real packet for a previously synthesized slot arrived: install
    /// its payload, clear the flag, rewind the decoder to the slot's saved
    /// pre-decode state and re-decode it and every later slot in order.
    fn upgrade_fec_slot(&mut self, idx: usize, enc_data: &[u8]) {
        debug!(
            "late authoritative packet {ts:#x}; re-decoding {n} slots",
            ts = self.live[idx].timestamp,
            n = self.live.len() - idx
        );
        {
            let slot = &mut self.live[idx];
            slot.encoded.clear();
            slot.encoded.extend_from_slice(enc_data);
            slot.fec = false;
            if let Some(state) = slot.snapshot.clone() {
                if let Err(e) = self.decoder.restore_state(&state) {
                    warn!("decoder restore failed: {e}");
                }
            }
        }

        let mut i = idx;
        while i < self.live.len() {
            let slot = &mut self.live[i];
            slot.snapshot = Some(self.decoder.save_state());
            slot.pcm.fill(0.0);
            let result = if slot.fec {
                self.decoder.decode_fec(&slot.encoded, &mut slot.pcm)
            } else {
                self.decoder.decode(&slot.encoded, &mut slot.pcm)
            };
            match result {
                Ok(_) => i += 1,
                Err(e) => {
                    warn!(
                        "re-decode of {ts:#x} failed, frame dropped: {e}",
                        ts = slot.timestamp
                    );
                    let slot = self.live.remove(i);
                    self.free.push(slot);
                }
            }
        }
    }

    /// The next slot to play at host time `now_ns`: the first unplayed slot
    /// whose timestamp is within the playout window. A slot too far in the
    /// future yields `None` (underrun); slots too far in the past are
    /// passed over in favor of newer ones, but old audio still beats
    /// silence.
    pub fn next(&self, now_ns: u64) -> Option<&PacketSlot> {
        let mut best: Option<&PacketSlot> = None;
        for slot in &self.live {
            if slot.timestamp <= self.last_played_ts {
                continue;
            }
            // Not yet inside the window: stop looking.
            if now_ns + self.buff_time_ns < slot.timestamp {
                break;
            }
            best = Some(slot);
            // Within the window on the past side too: take it.
            if now_ns < slot.timestamp + self.buff_time_ns {
                break;
            }
        }
        best
    }

    /// Mark `ts` as played and return everything at or before it to the
    /// pool.
    pub fn mark_played(&mut self, ts: u64) {
        self.last_played_ts = ts;
        self.gc(ts);
    }

    /// Return every slot with `timestamp <= up_to` to the free list.
    pub fn gc(&mut self, up_to: u64) {
        while let Some(first) = self.live.first() {
            if first.timestamp > up_to {
                break;
            }
            let slot = self.live.remove(0);
            self.free.push(slot);
        }
    }

    /// Timestamps of unplayed slots still marked FEC.
    pub fn scan_fec(&self) -> Vec<u64> {
        self.live
            .iter()
            .filter(|slot| slot.fec && slot.timestamp > self.last_played_ts)
            .map(|slot| slot.timestamp)
            .collect()
    }

    /// FEC timestamps eligible for a retransmit request, throttled to one
    /// round per two milliseconds.
    pub fn pending_retransmits(&mut self) -> Vec<u64> {
        let timestamps = self.scan_fec();
        if timestamps.is_empty() {
            return timestamps;
        }
        let now = Instant::now();
        if let Some(last) = self.last_request {
            if now.duration_since(last).as_millis() < RETRANSMIT_THROTTLE_MS as u128 {
                return Vec::new();
            }
        }
        self.last_request = Some(now);
        timestamps
    }

    #[cfg(test)]
    fn timestamps(&self) -> Vec<u64> {
        self.live.iter().map(|slot| slot.timestamp).collect()
    }

    #[cfg(test)]
    fn slot_at_ts(&self, ts: u64) -> Option<&PacketSlot> {
        self.live.iter().find(|slot| slot.timestamp == ts).map(|v| &**v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::{AudioEncoder, PcmDecoder, PcmEncoder};

    const P: u64 = FRAME_PERIOD_NS;

    fn encode_value(value: f32) -> Vec<u8> {
        let mut enc = PcmEncoder::new(1);
        let pcm = vec![value; FRAME_SIZE];
        let mut out = vec![0u8; MAX_PACKET_LEN];
        let len = enc.encode(&pcm, &mut out).unwrap();
        out.truncate(len);
        out
    }

    fn buffer() -> PacketBuffer<PcmDecoder> {
        PacketBuffer::new(PcmDecoder::new(1))
    }

    #[test]
    fn test_timestamps_stay_ascending() {
        let mut buf = buffer();
        let data = encode_value(0.1);
        for &ts in &[5 * P, P, 3 * P, 2 * P, 4 * P, P] {
            buf.queue(ts, &data);
        }
        let stamps = buf.timestamps();
        let mut sorted = stamps.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(stamps, sorted);
    }

    #[test]
    fn test_out_of_order_playout() {
        // Arrive 1,3,2,4; play back 1,2,3,4.
        let mut buf = buffer();
        for &ts in &[P, 3 * P, 2 * P, 4 * P] {
            buf.queue(ts, &encode_value(ts as f32 / P as f32));
        }

        let mut played = Vec::new();
        for _ in 0..4 {
            let ts = buf.next(2 * P).map(|slot| slot.timestamp).unwrap();
            buf.mark_played(ts);
            played.push(ts);
        }
        assert_eq!(played, vec![P, 2 * P, 3 * P, 4 * P]);
    }

    #[test]
    fn test_gap_synthesizes_fec_slots() {
        // Timestamps 1,2,5 arrive; 3 and 4 must appear as FEC slots carrying
        // non-silent concealment.
        let mut buf = buffer();
        buf.queue(P, &encode_value(0.5));
        buf.queue(2 * P, &encode_value(0.5));
        buf.queue(5 * P, &encode_value(0.5));

        assert_eq!(
            buf.timestamps(),
            vec![P, 2 * P, 3 * P, 4 * P, 5 * P]
        );
        let fec3 = buf.slot_at_ts(3 * P).unwrap();
        let fec4 = buf.slot_at_ts(4 * P).unwrap();
        assert!(fec3.fec && fec4.fec);
        assert!(fec3.pcm().iter().any(|&s| s != 0.0));
        assert!(fec4.pcm().iter().any(|&s| s != 0.0));
        assert!(!buf.slot_at_ts(5 * P).unwrap().fec);
    }

    #[test]
    fn test_late_packet_upgrades_and_cascades() {
        let mut buf = buffer();
        buf.queue(P, &encode_value(0.25));
        // 2..=3 missing; 4 triggers synthesis.
        buf.queue(4 * P, &encode_value(0.25));
        assert!(buf.slot_at_ts(2 * P).unwrap().fec);
        assert!(buf.slot_at_ts(3 * P).unwrap().fec);

        // The real packet 2 arrives late and must supersede the synthesis.
        buf.queue(2 * P, &encode_value(0.75));
        let upgraded = buf.slot_at_ts(2 * P).unwrap();
        assert!(!upgraded.fec);
        assert!((upgraded.pcm()[0] - 0.75).abs() < 1e-3);

        // Slot 2's PCM must equal what a fresh decoder restored from slot
        // 2's snapshot would produce from the now-real bytes. For the PCM
        // codec that means: exactly the decoded payload.
        let expected = {
            let mut dec = PcmDecoder::new(1);
            let mut out = vec![0.0f32; FRAME_SIZE];
            dec.decode(&encode_value(0.75), &mut out).unwrap();
            out
        };
        assert_eq!(upgraded.pcm(), &expected[..]);

        // The cascade refreshed slot 3's concealment from the new state:
        // its first loss off a 0.75 frame fades to 0.75 * 0.85.
        let slot3 = buf.slot_at_ts(3 * P).unwrap();
        assert!(slot3.fec);
        assert!((slot3.pcm()[0] - 0.75 * 0.85).abs() < 1e-2);
    }

    #[test]
    fn test_duplicate_real_packet_dropped() {
        let mut buf = buffer();
        buf.queue(P, &encode_value(0.5));
        let before = buf.slot_at_ts(P).unwrap().pcm().to_vec();
        buf.queue(P, &encode_value(0.9));
        assert_eq!(buf.slot_at_ts(P).unwrap().pcm(), &before[..]);
        assert_eq!(buf.queued(), 1);
    }

    #[test]
    fn test_stale_packet_dropped() {
        let mut buf = buffer();
        buf.queue(5 * P, &encode_value(0.5));
        buf.mark_played(5 * P);
        buf.queue(3 * P, &encode_value(0.5));
        assert_eq!(buf.queued(), 0);
    }

    #[test]
    fn test_overflow_drops_incoming_only() {
        let mut buf = buffer();
        for i in 1..=PACKET_BUFFER_SLOTS as u64 {
            buf.queue(i * P, &encode_value(0.1));
        }
        assert_eq!(buf.queued(), PACKET_BUFFER_SLOTS);
        buf.queue((PACKET_BUFFER_SLOTS as u64 + 1) * P, &encode_value(0.1));
        assert_eq!(buf.queued(), PACKET_BUFFER_SLOTS);
        assert_eq!(buf.timestamps()[0], P);
    }

    #[test]
    fn test_gc_returns_played_slots() {
        let mut buf = buffer();
        for i in 1..=6u64 {
            buf.queue(i * P, &encode_value(0.1));
        }
        buf.gc(3 * P);
        assert_eq!(buf.timestamps(), vec![4 * P, 5 * P, 6 * P]);
        // Freed slots are reusable.
        for i in 7..=9u64 {
            buf.queue(i * P, &encode_value(0.1));
        }
        assert_eq!(buf.queued(), 6);
    }

    #[test]
    fn test_next_never_replays() {
        let mut buf = buffer();
        for i in 1..=4u64 {
            buf.queue(i * P, &encode_value(0.1));
        }
        buf.mark_played(2 * P);
        let slot = buf.next(2 * P).unwrap();
        assert!(slot.timestamp > 2 * P);
    }

    #[test]
    fn test_next_waits_for_far_future() {
        let mut buf = buffer();
        buf.queue(100 * P, &encode_value(0.1));
        // Window is 55 ms; a packet a full second ahead is not playable.
        assert!(buf.next(0).is_none());
        // Once host time reaches the window, it is.
        assert!(buf.next(100 * P - 55 * 1_000_000).is_some());
    }

    #[test]
    fn test_next_prefers_fresh_over_stale() {
        let mut buf = buffer();
        buf.queue(P, &encode_value(0.1));
        buf.queue(200 * P, &encode_value(0.2));
        // Host time far past the first packet: it is stale but the second is
        // in window, so the second wins.
        let slot = buf.next(200 * P).unwrap();
        assert_eq!(slot.timestamp, 200 * P);
    }

    #[test]
    fn test_stale_audio_beats_silence() {
        let mut buf = buffer();
        buf.queue(P, &encode_value(0.1));
        // Way past the window, nothing newer queued: still play it.
        let slot = buf.next(50 * P).unwrap();
        assert_eq!(slot.timestamp, P);
    }

    #[test]
    fn test_retransmit_scan_and_throttle() {
        let mut buf = buffer();
        buf.queue(P, &encode_value(0.1));
        buf.queue(4 * P, &encode_value(0.1));

        let first = buf.pending_retransmits();
        assert_eq!(first, vec![2 * P, 3 * P]);
        // Immediately after, the throttle suppresses the round.
        assert!(buf.pending_retransmits().is_empty());
        std::thread::sleep(std::time::Duration::from_millis(3));
        assert_eq!(buf.pending_retransmits(), vec![2 * P, 3 * P]);
    }
}
