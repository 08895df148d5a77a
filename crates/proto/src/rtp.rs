//! RTP header parsing, the ordered packet queue and per-session sequence
//! tracking.
//!
//! Payload type numbers 97/98/111 are private to this deployment, not
//! IANA-assigned (spec.md Design Notes, "Fixed RTP payload type numbers").

use std::collections::VecDeque;
use std::net::SocketAddr;

use parking_lot::{Condvar, Mutex};

/// 16-bit little-endian interleaved I/Q samples from the tuner daemon.
pub const PT_IQ_16: u8 = 97;
/// 8-bit signed interleaved I/Q samples from the tuner daemon.
pub const PT_IQ_8: u8 = 98;
/// Legacy 24-byte fixed status header, stripped and ignored if present.
pub const PT_STATUS_LEGACY: u8 = 111;
/// PCM stereo output, 16-bit big-endian, 48 kHz.
pub const PT_PCM_STEREO: u8 = 10;
/// PCM mono output, 16-bit big-endian, 48 kHz.
pub const PT_PCM_MONO: u8 = 11;

const RTP_VERSION: u8 = 2;
const HEADER_LEN: usize = 12;
const LEGACY_STATUS_LEN: usize = 24;

/// A parsed, host-layout RTP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
        }
    }

    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    /// Packs the header into 12 network-order bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = (self.version << 6) | ((self.padding as u8) << 5) | ((self.extension as u8) << 4) | self.csrc_count;
        buf[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7f);
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        buf
    }

    fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }

        let version = (buf[0] >> 6) & 0x03;
        let padding = (buf[0] & 0x20) != 0;
        let extension = (buf[0] & 0x10) != 0;
        let csrc_count = buf[0] & 0x0f;
        let marker = (buf[1] & 0x80) != 0;
        let payload_type = buf[1] & 0x7f;
        let sequence = u16::from_be_bytes([buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        Some(Self {
            version,
            padding,
            extension,
            csrc_count,
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
        })
    }
}

/// An owned, parsed inbound datagram: header plus the I/Q payload bytes with
/// padding, extension header and any legacy status header already stripped.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: RtpHeader,
    pub payload: Vec<u8>,
}

/// Rejects a datagram that is too short, the wrong version, or an
/// unsupported payload type; otherwise returns the parsed packet with
/// padding, extensions and the legacy status header already stripped.
///
/// Accepted payload types are `PT_IQ_16` and `PT_IQ_8`.
pub fn parse_iq_datagram(buf: &[u8]) -> Option<Packet> {
    let header = RtpHeader::parse(buf)?;
    if header.version != RTP_VERSION {
        return None;
    }
    if header.payload_type != PT_IQ_16 && header.payload_type != PT_IQ_8 {
        return None;
    }

    let mut offset = HEADER_LEN + 4 * header.csrc_count as usize;
    if buf.len() < offset {
        return None;
    }

    if header.extension {
        if buf.len() < offset + 4 {
            return None;
        }
        let ext_words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        offset += 4 + ext_words * 4;
        if buf.len() < offset {
            return None;
        }
    }

    let mut end = buf.len();
    if header.padding {
        let pad = *buf.last()? as usize;
        if pad == 0 || pad > end - offset {
            return None;
        }
        end -= pad;
    }

    // A legacy fixed status header may immediately follow the RTP header;
    // it is stripped and ignored (spec.md Input wire format).
    if end - offset >= LEGACY_STATUS_LEN && header.payload_type == PT_STATUS_LEGACY {
        offset += LEGACY_STATUS_LEN;
    }

    Some(Packet {
        header,
        payload: buf[offset..end].to_vec(),
    })
}

/// Result of classifying an inbound sequence number against the expected
/// one for a session (spec.md §3, "RTP session state" invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqClass {
    /// Non-negative forward step of magnitude <= 10; `gap` samples were lost.
    Forward { gap: u16 },
    /// Reverse jump of magnitude <= 10: a dropped duplicate.
    Duplicate,
    /// Jump of magnitude > 10 in either direction: treat as a new source.
    Reset,
}

const RESET_THRESHOLD: i32 = 10;

/// Per-stream RTP session state (spec.md §3).
pub struct RtpSession {
    pub initialized: bool,
    pub last_seq: u16,
    pub last_timestamp: u32,
    pub ssrc: Option<u32>,
    pub packets: u64,
    pub bytes: u64,
    pub drops: u64,
    pub duplicates: u64,
    pub resets: u64,
}

impl Default for RtpSession {
    fn default() -> Self {
        Self {
            initialized: false,
            last_seq: 0,
            last_timestamp: 0,
            ssrc: None,
            packets: 0,
            bytes: 0,
            drops: 0,
            duplicates: 0,
            resets: 0,
        }
    }
}

impl RtpSession {
    /// Classifies `seq` against the session's expected next sequence number
    /// and updates `last_seq`/counters accordingly. Does not touch
    /// `last_timestamp`; the sample processor owns that once it has decided
    /// how many samples the gap represents.
    pub fn accept(&mut self, seq: u16, ssrc: u32, payload_len: usize) -> SeqClass {
        self.packets += 1;
        self.bytes += payload_len as u64;

        if !self.initialized {
            self.initialized = true;
            self.last_seq = seq;
            self.ssrc = Some(ssrc);
            return SeqClass::Forward { gap: 0 };
        }

        if self.ssrc != Some(ssrc) {
            self.reset(seq, ssrc);
            return SeqClass::Reset;
        }

        // Wrapping signed distance from last_seq to seq, in [-32768, 32767].
        let delta = seq.wrapping_sub(self.last_seq) as i16 as i32;

        let class = if (0..=RESET_THRESHOLD).contains(&delta) {
            SeqClass::Forward { gap: delta as u16 }
        } else if (-RESET_THRESHOLD..0).contains(&delta) {
            SeqClass::Duplicate
        } else {
            SeqClass::Reset
        };

        match class {
            SeqClass::Forward { gap } => {
                self.drops += gap.saturating_sub(1) as u64;
                self.last_seq = seq;
            }
            SeqClass::Duplicate => {
                self.duplicates += 1;
            }
            SeqClass::Reset => {
                self.reset(seq, ssrc);
            }
        }

        class
    }

    fn reset(&mut self, seq: u16, ssrc: u32) {
        self.resets += 1;
        self.initialized = true;
        self.last_seq = seq;
        self.last_timestamp = 0;
        self.ssrc = Some(ssrc);
    }

    /// The sequence number expected for the next packet: `last_seq + 1 mod
    /// 2^16` (spec.md §8 invariant).
    pub fn expected_seq(&self) -> u16 {
        self.last_seq.wrapping_add(1)
    }
}

/// Singly-ordered packet queue: packets are inserted in ascending sequence
/// number order and consumed exactly once by the sample processor. The
/// queue is expected to stay short because the sender is on the local
/// network (spec.md §4.1), so a linear insertion walk is appropriate.
#[derive(Default)]
pub struct PacketQueue {
    inner: Mutex<VecDeque<(u16, Packet, SocketAddr)>>,
    ready: Condvar,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a packet in ascending sequence-number order and signals any
    /// waiting consumer.
    pub fn push(&self, packet: Packet, from: SocketAddr) {
        let seq = packet.header.sequence;
        let mut queue = self.inner.lock();

        let pos = queue
            .iter()
            .position(|(s, _, _)| seq.wrapping_sub(*s) as i16 as i32 <= 0)
            .unwrap_or(queue.len());

        queue.insert(pos, (seq, packet, from));
        self.ready.notify_one();
    }

    /// Blocks until a packet is available, then removes and returns the
    /// head of the queue (lowest sequence number).
    pub fn pop_blocking(&self) -> (Packet, SocketAddr) {
        let mut queue = self.inner.lock();
        while queue.is_empty() {
            self.ready.wait(&mut queue);
        }
        let (_, packet, from) = queue.pop_front().expect("queue non-empty after wait");
        (packet, from)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = RtpHeader::new(PT_IQ_16, 1000, 48000, 0xdead_beef).with_marker(true);
        let bytes = header.to_bytes();
        let parsed = RtpHeader::parse(&bytes).unwrap();
        assert_eq!(header, parsed);
    }

    #[test]
    fn rejects_short_and_wrong_version() {
        assert!(parse_iq_datagram(&[0u8; 8]).is_none());

        let mut buf = vec![0u8; 16];
        buf[0] = 0b0100_0000; // version 1
        buf[1] = PT_IQ_16;
        assert!(parse_iq_datagram(&buf).is_none());
    }

    #[test]
    fn rejects_unknown_payload_type() {
        let mut buf = vec![0u8; 16];
        buf[0] = 0b1000_0000;
        buf[1] = 5;
        assert!(parse_iq_datagram(&buf).is_none());
    }

    #[test]
    fn accepts_iq_16_and_strips_nothing_extra() {
        let header = RtpHeader::new(PT_IQ_16, 1000, 0, 1);
        let mut buf = header.to_bytes().to_vec();
        buf.extend_from_slice(&[1, 0, 0, 0]); // one interleaved sample {1,0}
        let packet = parse_iq_datagram(&buf).unwrap();
        assert_eq!(packet.payload, vec![1, 0, 0, 0]);
    }

    #[test]
    fn sequence_expected_wraps() {
        let mut session = RtpSession::default();
        session.accept(0xffff, 1, 0);
        assert_eq!(session.expected_seq(), 0x0000);
    }

    #[test]
    fn forward_gap_increments_drops() {
        let mut session = RtpSession::default();
        session.accept(1000, 1, 0);
        let class = session.accept(1002, 1, 0);
        assert_eq!(class, SeqClass::Forward { gap: 2 });
        assert_eq!(session.drops, 1);
    }

    #[test]
    fn small_reverse_jump_is_duplicate() {
        let mut session = RtpSession::default();
        session.accept(1000, 1, 0);
        session.accept(1001, 1, 0);
        let class = session.accept(999, 1, 0);
        assert_eq!(class, SeqClass::Duplicate);
        assert_eq!(session.duplicates, 1);
    }

    #[test]
    fn large_jump_resets_session() {
        let mut session = RtpSession::default();
        session.accept(1000, 1, 0);
        let class = session.accept(5000, 1, 0);
        assert_eq!(class, SeqClass::Reset);
        assert_eq!(session.resets, 1);
    }

    #[test]
    fn wrap_not_treated_as_large_reverse_jump() {
        let mut session = RtpSession::default();
        session.accept(0xfffe, 1, 0);
        let class = session.accept(0x0000, 1, 0);
        assert_eq!(class, SeqClass::Forward { gap: 2 });
    }

    #[test]
    fn queue_orders_by_sequence() {
        let queue = PacketQueue::new();
        let addr: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        for seq in [1002u16, 1000, 1001] {
            queue.push(
                Packet {
                    header: RtpHeader::new(PT_IQ_16, seq, 0, 1),
                    payload: vec![],
                },
                addr,
            );
        }

        let (p0, _) = queue.pop_blocking();
        let (p1, _) = queue.pop_blocking();
        let (p2, _) = queue.pop_blocking();
        assert_eq!(
            [p0.header.sequence, p1.header.sequence, p2.header.sequence],
            [1000, 1001, 1002]
        );
    }
}
