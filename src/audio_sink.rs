//! Bridges a demodulator's PCM output to the output multicast group
//! (spec.md §4.7). `proto::pcm` owns framing and silence suppression;
//! this module owns the socket send and publishes lock-free counters for
//! the status publisher, mirroring `dsp::processor::ProcessorStats`'s
//! pattern of an `Arc<...>` of atomics read from another thread.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dsp::demod::AudioSink;
use proto::pcm::{AudioOutputSession, Channels};

#[derive(Default)]
pub struct PcmSinkStats {
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
    pub timestamp: AtomicU32,
}

/// One demodulator's RTP audio output. Lives on the demodulator's own
/// `std::thread` (see `crate::demod_runtime`); `stats` is the handle
/// other threads use to read its counters for the status stream.
pub struct PcmSink {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    session: AudioOutputSession,
    pub stats: Arc<PcmSinkStats>,
}

impl PcmSink {
    pub fn new(socket: Arc<UdpSocket>, dest: SocketAddr, channels: Channels, ssrc: u32) -> Self {
        Self {
            socket,
            dest,
            session: AudioOutputSession::new(channels, ssrc),
            stats: Arc::new(PcmSinkStats::default()),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.session.ssrc
    }
}

impl AudioSink for PcmSink {
    fn write(&mut self, samples: &[f32], _channels: u16) {
        let framed = self.session.frame(samples);
        self.stats
            .timestamp
            .store(self.session.timestamp(), Ordering::Relaxed);

        if let Some(packet) = framed.packet {
            self.stats.packets.fetch_add(1, Ordering::Relaxed);
            self.stats.bytes.fetch_add(packet.len() as u64, Ordering::Relaxed);
            if let Err(e) = self.socket.send_to(&packet, self.dest) {
                log::warn!("pcm output send failed: dest={}, err={}", self.dest, e);
            }
        }
    }
}
