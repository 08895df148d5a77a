//! Sample processor (spec.md §4.2): pops one inbound I/Q packet off the
//! queue, classifies and handles its sequence/timestamp state, applies
//! per-pair front-end correction and frequency translation, and dispatches
//! completed blocks to the fast-convolution filter. Grounded in
//! `original_source/radio.c`'s per-sample correction-and-translate loop
//! (lines 60-220) and spec.md §4.1/§4.2.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use proto::rtp::{Packet, PacketQueue, SeqClass, RtpSession};

use crate::correction::IqCorrection;
use crate::filter::FilterMaster;
use crate::frontend::FrontEndStatus;
use crate::osc::Oscillator;
use crate::Complex32;

/// Timestamp gaps larger than this many samples (one nominal second at
/// 192 kHz) are not filled; the packet is discarded and the expected
/// timestamp jumps instead (spec.md §4.2, "Gap filling").
pub const MAX_FILLABLE_GAP: u32 = 192_000;

/// Counters a status publisher can read lock-free (spec.md §4.1
/// "[ADDED]" `RtpReceiverStats`), mirroring the teacher's `Counts<Count>`
/// pattern in `statistics.rs`.
#[derive(Default)]
pub struct ProcessorStats {
    pub blocks_dispatched: AtomicU64,
    pub gaps_filled: AtomicU64,
    pub gaps_discarded: AtomicU64,
    pub packets: AtomicU64,
    pub samples: AtomicU64,
    pub drops: AtomicU64,
    pub duplicates: AtomicU64,
    pub resets: AtomicU64,
}

/// Converts an interleaved I/Q payload to complex samples scaled to
/// ±1.0. `payload_type` selects 16-bit little-endian or 8-bit signed
/// interleaved decoding (spec.md §4.1).
pub fn decode_iq_payload(payload_type: u8, payload: &[u8]) -> Vec<Complex32> {
    match payload_type {
        proto::rtp::PT_IQ_16 => payload
            .chunks_exact(4)
            .map(|pair| {
                let i = i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0;
                let q = i16::from_le_bytes([pair[2], pair[3]]) as f32 / 32768.0;
                Complex32::new(i, q)
            })
            .collect(),
        proto::rtp::PT_IQ_8 => payload
            .chunks_exact(2)
            .map(|pair| {
                let i = pair[0] as i8 as f32 / 128.0;
                let q = pair[1] as i8 as f32 / 128.0;
                Complex32::new(i, q)
            })
            .collect(),
        _ => Vec::new(),
    }
}

pub struct SampleProcessor {
    queue: Arc<PacketQueue>,
    master: Arc<FilterMaster>,
    session: RtpSession,
    expected_timestamp: u32,

    correction: IqCorrection,
    front_end: FrontEndStatus,
    second_lo: Arc<Oscillator>,
    doppler: Option<Arc<Oscillator>>,

    sample_rate_hz: f32,
    block_buf: Vec<Complex32>,
    block_pos: usize,

    pub stats: Arc<ProcessorStats>,
}

impl SampleProcessor {
    pub fn new(
        queue: Arc<PacketQueue>,
        master: Arc<FilterMaster>,
        second_lo: Arc<Oscillator>,
        doppler: Option<Arc<Oscillator>>,
        front_end: FrontEndStatus,
        sample_rate_hz: f32,
    ) -> Self {
        let l = master.input_len();
        Self {
            queue,
            master,
            session: RtpSession::default(),
            expected_timestamp: 0,
            correction: IqCorrection::new(),
            front_end,
            second_lo,
            doppler,
            sample_rate_hz,
            block_buf: vec![Complex32::new(0.0, 0.0); l],
            block_pos: 0,
            stats: Arc::new(ProcessorStats::default()),
        }
    }

    pub fn set_front_end_status(&mut self, status: FrontEndStatus) {
        self.front_end = status;
    }

    /// Processes exactly one inbound packet, blocking until one is
    /// available.
    pub fn process_one(&mut self) {
        let (packet, _from) = self.queue.pop_blocking();
        self.handle_packet(&packet);
    }

    fn handle_packet(&mut self, packet: &Packet) {
        let class = self
            .session
            .accept(packet.header.sequence, packet.header.ssrc, packet.payload.len());
        self.publish_session_stats();

        if matches!(class, SeqClass::Duplicate) {
            return;
        }
        if matches!(class, SeqClass::Reset) {
            self.expected_timestamp = packet.header.timestamp;
        }

        // Signed reinterpretation of the wrapped timestamp delta, matching
        // `RtpSession`'s signed sequence-number classification in
        // `proto::rtp` (`seq.wrapping_sub(...) as i16 as i32`) — an
        // unsigned delta would misclassify a genuinely backward timestamp
        // as an enormous forward gap and move `expected_timestamp`
        // backward, violating spec.md §8's "timestamps are never moved
        // backward" invariant.
        let signed_gap = packet.header.timestamp.wrapping_sub(self.expected_timestamp) as i32;

        if signed_gap > 0 && signed_gap as u32 > MAX_FILLABLE_GAP {
            // Oversized forward gap: spec.md §4.2 "gaps larger than this
            // limit cause the packet to be discarded and the expected
            // timestamp to jump" — the packet's own samples are not
            // processed.
            self.expected_timestamp = packet.header.timestamp;
            self.stats.gaps_discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if signed_gap > 0 {
            self.fill_gap(signed_gap as u32);
            self.stats.gaps_filled.fetch_add(1, Ordering::Relaxed);
        }
        // signed_gap <= 0: a reordered or jittered packet at/behind the
        // expected timestamp; processed without filling, and
        // `expected_timestamp` is never moved backward for it (see
        // `advance_expected_timestamp`).

        let samples = decode_iq_payload(packet.header.payload_type, &packet.payload);
        for raw in samples {
            self.push_sample(raw);
        }
        self.advance_expected_timestamp(
            packet.header.timestamp.wrapping_add(self.last_payload_samples(packet)),
        );
    }

    /// Advances `expected_timestamp` to `candidate` unless doing so would
    /// move it backward (spec.md §8 invariant).
    fn advance_expected_timestamp(&mut self, candidate: u32) {
        if candidate.wrapping_sub(self.expected_timestamp) as i32 >= 0 {
            self.expected_timestamp = candidate;
        }
    }

    fn last_payload_samples(&self, packet: &Packet) -> u32 {
        match packet.header.payload_type {
            proto::rtp::PT_IQ_16 => (packet.payload.len() / 4) as u32,
            proto::rtp::PT_IQ_8 => (packet.payload.len() / 2) as u32,
            _ => 0,
        }
    }

    /// Inserts `gap` zero samples and advances every oscillator the same
    /// number of steps so phase stays continuous across the loss.
    fn fill_gap(&mut self, gap: u32) {
        for _ in 0..gap {
            self.push_sample(Complex32::new(0.0, 0.0));
        }
    }

    /// Mirrors the session's running counters into the atomic snapshot a
    /// status publisher on another thread can read lock-free.
    fn publish_session_stats(&self) {
        self.stats.packets.store(self.session.packets, Ordering::Relaxed);
        self.stats.drops.store(self.session.drops, Ordering::Relaxed);
        self.stats
            .duplicates
            .store(self.session.duplicates, Ordering::Relaxed);
        self.stats.resets.store(self.session.resets, Ordering::Relaxed);
    }

    fn push_sample(&mut self, raw: Complex32) {
        self.stats.samples.fetch_add(1, Ordering::Relaxed);
        let corrected = self.correction.apply(raw) * self.front_end.gain_normalization();

        let lo = self.second_lo.step();
        let translated = if let Some(doppler) = &self.doppler {
            corrected * lo * doppler.step()
        } else {
            corrected * lo
        };

        self.block_buf[self.block_pos] = translated;
        self.block_pos += 1;

        if self.block_pos == self.block_buf.len() {
            self.dispatch_block();
        }
    }

    fn dispatch_block(&mut self) {
        self.master.write_block(&self.block_buf);
        self.correction
            .update_block(self.block_buf.len() as u32, self.sample_rate_hz);
        self.second_lo.renormalize_now();
        if let Some(doppler) = &self.doppler {
            doppler.renormalize_now();
        }
        self.block_pos = 0;
        self.stats.blocks_dispatched.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::rtp::RtpHeader;

    fn front_end() -> FrontEndStatus {
        FrontEndStatus {
            timestamp_ns: 0,
            tuner_freq_hz: 1_000_000.0,
            sample_rate_hz: 8000.0,
            lna_gain_db: 0,
            mixer_gain_db: 0,
            if_gain_db: 0,
        }
    }

    #[test]
    fn decodes_iq16_to_unit_scaled_complex() {
        let payload = vec![0xff, 0x7f, 0x00, 0x80]; // i=32767, q=-32768
        let samples = decode_iq_payload(proto::rtp::PT_IQ_16, &payload);
        assert_eq!(samples.len(), 1);
        assert!((samples[0].re - 0.99997).abs() < 1e-3);
        assert!((samples[0].im - (-1.0)).abs() < 1e-3);
    }

    #[test]
    fn full_block_triggers_dispatch() {
        let master = Arc::new(FilterMaster::new(4, 3));
        let queue = Arc::new(PacketQueue::new());
        let lo = Arc::new(Oscillator::new(8000.0));

        let mut processor = SampleProcessor::new(queue, master.clone(), lo, None, front_end(), 8000.0);

        let mut payload = Vec::new();
        for _ in 0..4 {
            payload.extend_from_slice(&1000i16.to_le_bytes());
            payload.extend_from_slice(&(-1000i16).to_le_bytes());
        }
        let packet = Packet {
            header: RtpHeader::new(proto::rtp::PT_IQ_16, 0, 0, 1),
            payload,
        };
        processor.handle_packet(&packet);

        assert_eq!(master.blocknum(), 1);
        assert_eq!(processor.stats.blocks_dispatched.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn large_gap_jumps_expected_timestamp_instead_of_filling() {
        let master = Arc::new(FilterMaster::new(64, 17));
        let queue = Arc::new(PacketQueue::new());
        let lo = Arc::new(Oscillator::new(8000.0));
        let mut processor = SampleProcessor::new(queue, master, lo, None, front_end(), 8000.0);

        let packet = Packet {
            header: RtpHeader::new(proto::rtp::PT_IQ_16, 0, 500_000, 1),
            payload: vec![0u8; 4],
        };
        processor.handle_packet(&packet);
        assert_eq!(processor.stats.gaps_discarded.load(Ordering::Relaxed), 1);
        assert_eq!(processor.stats.gaps_filled.load(Ordering::Relaxed), 0);
        assert_eq!(processor.stats.samples.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn backward_timestamp_does_not_move_expected_timestamp_backward() {
        let master = Arc::new(FilterMaster::new(64, 17));
        let queue = Arc::new(PacketQueue::new());
        let lo = Arc::new(Oscillator::new(8000.0));
        let mut processor = SampleProcessor::new(queue, master, lo, None, front_end(), 8000.0);

        processor.expected_timestamp = 10_000;
        let packet = Packet {
            header: RtpHeader::new(proto::rtp::PT_IQ_16, 0, 1_000, 1),
            payload: vec![0u8; 4],
        };
        processor.handle_packet(&packet);

        assert_eq!(processor.stats.gaps_discarded.load(Ordering::Relaxed), 0);
        assert_eq!(processor.stats.gaps_filled.load(Ordering::Relaxed), 0);
        assert!(processor.expected_timestamp >= 10_000);
        assert_eq!(processor.stats.samples.load(Ordering::Relaxed), 1);
    }
}
