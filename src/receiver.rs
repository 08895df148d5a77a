//! The mutable center of `radiod`'s RF state: the oscillator pair, the
//! pre-detection filter's shared master, the active demodulator, and the
//! glue tying them to the status/command TLV protocol (spec.md §3 "Per-
//! channel state", §4.8, §8).

use std::hash::{Hash, Hasher};
use std::net::UdpSocket;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use dsp::demod::agc::AgcParams;
use dsp::demod::am::AmDemodulator;
use dsp::demod::fm::FmDemodulator;
use dsp::demod::linear::LinearDemodulator;
use dsp::demod::{DemodSnapshot, Demodulator};
use dsp::filter::{FilterMaster, FilterSlave, OutputType};
use dsp::frontend::FrontEndStatus;
use dsp::osc::Oscillator;
use dsp::processor::{ProcessorStats, SampleProcessor};
use proto::frontend_status::retune_command;
use proto::pcm::Channels;
use proto::rtp::PacketQueue;
use proto::tlv::{Command, DeltaCache, Tag, Value};

use crate::audio_sink::{PcmSink, PcmSinkStats};
use crate::config::Config;
use crate::demod_runtime::DemodRuntime;
use crate::modetable::{self, DemodKind, ModeEntry};

/// Nominal front-end sample rate assumed until a real status report from
/// the tuner daemon updates it (spec.md §8 test case 1 uses 192 kHz).
const DEFAULT_SAMPLE_RATE_HZ: f64 = 192_000.0;

struct ReceiverState {
    mode: &'static ModeEntry,
    tuner_freq_hz: f64,
    low_hz: f32,
    high_hz: f32,
    kaiser_beta: f32,
    shift_hz: f64,
    lna_gain_db: u8,
    mixer_gain_db: u8,
    if_gain_db: u8,
    /// Per-field overrides of the active mode's own isb/pll/square/
    /// channel-count defaults, set by the command path (spec.md §4.8:
    /// "ISB/PLL/square/flat options, and channel count"). `None` means
    /// "use the mode table's default".
    isb_override: Option<bool>,
    pll_override: Option<bool>,
    square_override: Option<bool>,
    channels_override: Option<u16>,
    delta_cache: DeltaCache,
}

pub struct Receiver {
    config: Arc<Config>,
    master: Arc<FilterMaster>,
    second_lo: Arc<Oscillator>,
    doppler_lo: Option<Arc<Oscillator>>,
    sample_rate_hz: f64,

    processor: Arc<Mutex<SampleProcessor>>,
    processor_stats: Arc<ProcessorStats>,

    output_socket: Arc<UdpSocket>,
    tuner_socket: UdpSocket,

    demod: Mutex<DemodRuntime>,
    pcm_stats: Mutex<Arc<PcmSinkStats>>,
    ssrc: std::sync::atomic::AtomicU32,
    state: Mutex<ReceiverState>,
}

/// Derives a pseudo-random SSRC from the process id and wall clock
/// (spec.md §6: "a random value is chosen at startup if unset"). No
/// cryptographic property is required here, just low collision odds
/// between two receivers started close together.
fn random_ssrc() -> u32 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::process::id().hash(&mut hasher);
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
        .hash(&mut hasher);
    hasher.finish() as u32
}

impl Receiver {
    pub fn new(config: Arc<Config>, queue: Arc<PacketQueue>) -> anyhow::Result<Self> {
        let mode = modetable::find(&config.demod.mode).unwrap_or_else(modetable::default_mode);
        let sample_rate_hz = DEFAULT_SAMPLE_RATE_HZ;

        let master = Arc::new(FilterMaster::new(config.filter.blocksize, config.filter.impulse_len));
        let second_lo = Arc::new(Oscillator::new(sample_rate_hz));
        let doppler_lo = config
            .doppler
            .command
            .as_ref()
            .map(|_| Arc::new(Oscillator::new(sample_rate_hz)));

        let front_end = FrontEndStatus {
            timestamp_ns: 0,
            tuner_freq_hz: config.demod.frequency_hz,
            sample_rate_hz,
            lna_gain_db: 0,
            mixer_gain_db: 0,
            if_gain_db: 0,
        };

        let processor = Arc::new(Mutex::new(SampleProcessor::new(
            queue,
            master.clone(),
            second_lo.clone(),
            doppler_lo.clone(),
            front_end,
            sample_rate_hz as f32,
        )));
        let processor_stats = processor.lock().stats.clone();

        let output_socket = Arc::new(UdpSocket::bind("0.0.0.0:0")?);
        if let std::net::SocketAddr::V4(addr) = config.network.output_group {
            output_socket.set_multicast_ttl_v4(config.network.ttl)?;
            let _ = addr;
        }

        let tuner_socket = UdpSocket::bind("0.0.0.0:0")?;
        if let std::net::SocketAddr::V4(_) = config.network.input_group {
            tuner_socket.set_multicast_ttl_v4(config.network.ttl)?;
        }

        let state = Mutex::new(ReceiverState {
            mode,
            tuner_freq_hz: config.demod.frequency_hz,
            low_hz: config.filter.low_hz.unwrap_or(mode.low_hz),
            high_hz: config.filter.high_hz.unwrap_or(mode.high_hz),
            kaiser_beta: config.filter.kaiser_beta,
            shift_hz: config.demod.shift_hz,
            lna_gain_db: 0,
            mixer_gain_db: 0,
            if_gain_db: 0,
            isb_override: None,
            pll_override: None,
            square_override: None,
            channels_override: None,
            delta_cache: DeltaCache::new(),
        });

        let receiver = Self {
            config,
            master,
            second_lo,
            doppler_lo,
            sample_rate_hz,
            processor,
            processor_stats,
            output_socket,
            tuner_socket,
            demod: Mutex::new(DemodRuntime::new(
                Box::new(NullDemod),
                Box::new(NullSink),
            )),
            pcm_stats: Mutex::new(Arc::new(PcmSinkStats::default())),
            ssrc: std::sync::atomic::AtomicU32::new(0),
            state,
        };

        // Tuner is assumed to start already centered on the requested
        // frequency, so LO2 begins at 0 (spec.md §3: `receiver_freq =
        // tuner_freq - second_LO_freq`).
        receiver.second_lo.set_freq_hz(0.0);
        receiver.rebuild_demod();
        Ok(receiver)
    }

    pub fn processor(&self) -> Arc<Mutex<SampleProcessor>> {
        self.processor.clone()
    }

    /// Sets the receiver frequency. If the second LO would have to move
    /// outside `[-samplerate/2, samplerate/2]` to reach it, the first LO
    /// (the tuner) is retuned instead and the second LO resets near zero
    /// (spec.md §8 boundary: "LO2 must remain within ±samplerate/2; an
    /// out-of-range commanded frequency triggers a retune of the first
    /// LO").
    pub fn set_frequency(&self, receiver_freq_hz: f64) {
        let mut state = self.state.lock();
        let half_rate = self.sample_rate_hz / 2.0;
        let wanted_lo2 = state.tuner_freq_hz - receiver_freq_hz;

        if wanted_lo2.abs() > half_rate {
            self.send_retune(receiver_freq_hz);
            state.tuner_freq_hz = receiver_freq_hz;
            self.second_lo.set_freq_hz(0.0);
            log::info!(
                "LO2 out of range for {receiver_freq_hz} Hz, retuning first LO instead"
            );
        } else {
            self.second_lo.set_freq_hz(wanted_lo2);
        }
    }

    /// Updates the Doppler oscillator's frequency from the optional
    /// Doppler-tracking child process (spec.md §5 "Doppler tracker").
    /// A no-op when no Doppler oscillator was configured.
    pub fn set_doppler_frequency(&self, freq_hz: f64) {
        if let Some(doppler) = &self.doppler_lo {
            doppler.set_freq_hz(freq_hz);
        }
    }

    fn send_retune(&self, frequency_hz: f64) {
        let bytes = retune_command(frequency_hz);
        if let Err(e) = self.tuner_socket.send_to(&bytes, self.config.tuner_command_addr()) {
            log::error!("tuner retune command send failed: {e}");
        }
    }

    /// Applies a decoded command from the inbound command stream
    /// (spec.md §4.8/§7).
    pub fn apply_command(&self, command: Command) {
        match command {
            Command::SetFrequency(hz) => self.set_frequency(hz),
            Command::SetFilterEdges { low, high } => {
                {
                    let mut state = self.state.lock();
                    state.low_hz = low;
                    state.high_hz = high;
                }
                self.rebuild_demod();
            }
            Command::SetKaiserBeta(beta) => {
                {
                    let mut state = self.state.lock();
                    state.kaiser_beta = beta;
                }
                self.rebuild_demod();
            }
            Command::SetLnaGain(v) => self.update_front_end(|s| s.lna_gain_db = v),
            Command::SetMixerGain(v) => self.update_front_end(|s| s.mixer_gain_db = v),
            Command::SetIfGain(v) => self.update_front_end(|s| s.if_gain_db = v),
            Command::SetDemodMode(index) => {
                if let Some(mode) = modetable::MODE_TABLE.get(index as usize) {
                    {
                        let mut state = self.state.lock();
                        state.mode = mode;
                        state.low_hz = mode.low_hz;
                        state.high_hz = mode.high_hz;
                        state.shift_hz = mode.shift_hz;
                        state.isb_override = None;
                        state.pll_override = None;
                        state.square_override = None;
                        state.channels_override = None;
                    }
                    self.rebuild_demod();
                }
            }
            Command::SetIndependentSideband(v) => {
                {
                    let mut state = self.state.lock();
                    state.isb_override = Some(v);
                }
                self.rebuild_demod();
            }
            Command::SetPllEnabled(v) => {
                {
                    let mut state = self.state.lock();
                    state.pll_override = Some(v);
                }
                self.rebuild_demod();
            }
            Command::SetSquareEnabled(v) => {
                {
                    let mut state = self.state.lock();
                    state.square_override = Some(v);
                }
                self.rebuild_demod();
            }
            Command::SetOutputChannels(v) => {
                {
                    let mut state = self.state.lock();
                    state.channels_override = Some(v as u16);
                }
                self.rebuild_demod();
            }
        }
    }

    fn update_front_end(&self, f: impl FnOnce(&mut ReceiverState)) {
        let mut state = self.state.lock();
        f(&mut state);
        let front_end = FrontEndStatus {
            timestamp_ns: 0,
            tuner_freq_hz: state.tuner_freq_hz,
            sample_rate_hz: self.sample_rate_hz,
            lna_gain_db: state.lna_gain_db,
            mixer_gain_db: state.mixer_gain_db,
            if_gain_db: state.if_gain_db,
        };
        drop(state);
        self.processor.lock().set_front_end_status(front_end);
    }

    /// Tears down the active demodulator and filter slave and builds a
    /// new pair from the receiver's current mode/filter-edge/Kaiser-beta
    /// state (spec.md §5: mode switch must leave exactly one active
    /// demodulator).
    fn rebuild_demod(&self) {
        let (mode, low, high, beta, shift, isb, pll, square, mode_channels) = {
            let state = self.state.lock();
            (
                state.mode,
                state.low_hz,
                state.high_hz,
                state.kaiser_beta,
                state.shift_hz,
                state.isb_override.unwrap_or(state.mode.isb),
                state.pll_override.unwrap_or(state.mode.pll),
                state.square_override.unwrap_or(state.mode.square),
                state.channels_override.unwrap_or(state.mode.channels),
            )
        };

        let n = self.master.fft_len();
        let decimate = if n % mode.decimate == 0 {
            mode.decimate
        } else {
            log::warn!(
                "decimation ratio {} does not divide filter length {n}, falling back to 1",
                mode.decimate
            );
            1
        };

        let out_type = if isb {
            OutputType::CrossConj
        } else {
            OutputType::Complex
        };
        let slave = FilterSlave::new(self.master.clone(), decimate, out_type);
        slave.set_filter(self.sample_rate_hz as f32, low, high, beta);

        let decimated_rate_hz = self.sample_rate_hz as f32 / decimate as f32;
        let sample_time_s = 1.0 / decimated_rate_hz;

        let channels = if isb || mode_channels == 2 {
            Channels::Stereo
        } else {
            Channels::Mono
        };
        let ssrc = self.config.output_ssrc.unwrap_or_else(random_ssrc);
        let sink = PcmSink::new(
            self.output_socket.clone(),
            self.config.network.output_group,
            channels,
            ssrc,
        );
        *self.pcm_stats.lock() = sink.stats.clone();
        self.ssrc.store(ssrc, Ordering::Relaxed);

        let demod: Box<dyn Demodulator> = match mode.demod {
            DemodKind::Am => Box::new(AmDemodulator::new(slave, AgcParams::default(), sample_time_s)),
            DemodKind::Fm => Box::new(FmDemodulator::new(slave, decimated_rate_hz, mode.flat)),
            DemodKind::Linear => {
                let linear_config = mode.linear_config(
                    decimated_rate_hz,
                    self.config.demod.loop_bw_hz,
                    pll,
                    square,
                    isb,
                    mode_channels,
                );
                let linear = LinearDemodulator::new(slave, linear_config, AgcParams::default());
                linear.set_post_detection_shift_hz(shift);
                Box::new(linear)
            }
        };

        self.demod.lock().replace(demod, Box::new(sink));
    }

    /// Builds the current set of status fields for the periodic TLV
    /// publication (spec.md §4.8). Caller runs this through the
    /// receiver's `DeltaCache` to suppress unchanged fields.
    pub fn status_fields(&self) -> Vec<(Tag, Value)> {
        let state = self.state.lock();
        let demod_snapshot: DemodSnapshot = self.demod.lock().snapshot();
        let pcm_stats = self.pcm_stats.lock().clone();

        let mut fields = vec![
            (Tag::InputSourceSocket, Value::Addr(self.config.network.input_group)),
            (Tag::InputDestSocket, Value::Addr(self.config.network.input_group)),
            (Tag::InputPackets, Value::Int(self.processor_stats.packets.load(Ordering::Relaxed))),
            (Tag::InputSamples, Value::Int(self.processor_stats.samples.load(Ordering::Relaxed))),
            (Tag::InputDrops, Value::Int(self.processor_stats.drops.load(Ordering::Relaxed))),
            (Tag::InputDupes, Value::Int(self.processor_stats.duplicates.load(Ordering::Relaxed))),
            (Tag::InputSamprate, Value::Int(self.sample_rate_hz as u64)),
            (Tag::OutputDestSocket, Value::Addr(self.config.network.output_group)),
            (Tag::OutputSsrc, Value::Int(pcm_stats.packets.load(Ordering::Relaxed).min(u32::MAX as u64))),
            (Tag::OutputTtl, Value::Byte(self.config.network.ttl as u8)),
            (Tag::OutputPackets, Value::Int(pcm_stats.packets.load(Ordering::Relaxed))),
            (Tag::RadioFrequency, Value::Double(state.tuner_freq_hz - self.second_lo.freq_hz())),
            (Tag::FirstLoFrequency, Value::Double(state.tuner_freq_hz)),
            (Tag::SecondLoFrequency, Value::Double(self.second_lo.freq_hz())),
            (Tag::ShiftFrequency, Value::Double(state.shift_hz)),
            (Tag::LnaGain, Value::Byte(state.lna_gain_db)),
            (Tag::MixerGain, Value::Byte(state.mixer_gain_db)),
            (Tag::IfGain, Value::Byte(state.if_gain_db)),
            (Tag::LowEdge, Value::Float(state.low_hz)),
            (Tag::HighEdge, Value::Float(state.high_hz)),
            (Tag::KaiserBeta, Value::Float(state.kaiser_beta)),
            (Tag::FilterBlocksize, Value::Int(self.config.filter.blocksize as u64)),
            (Tag::FilterFirLength, Value::Int(self.config.filter.impulse_len as u64)),
            (Tag::RadioMode, Value::Str(state.mode.name.to_string())),
            (
                Tag::IndependentSideband,
                Value::Byte(state.isb_override.unwrap_or(state.mode.isb) as u8),
            ),
            (
                Tag::OutputChannels,
                Value::Byte(state.channels_override.unwrap_or(state.mode.channels) as u8),
            ),
            (Tag::DemodSnr, Value::Float(demod_snapshot.snr)),
            (Tag::BasebandPower, Value::Float(demod_snapshot.baseband_power)),
            (Tag::DemodGain, Value::Float(demod_snapshot.gain)),
            (Tag::FreqOffset, Value::Float(demod_snapshot.freq_offset_hz)),
            (Tag::PeakDeviation, Value::Float(demod_snapshot.peak_deviation_hz)),
            (Tag::PllLock, Value::Byte(demod_snapshot.pll_locked as u8)),
            (
                Tag::PllSquare,
                Value::Byte(state.square_override.unwrap_or(state.mode.square) as u8),
            ),
        ];

        if let Some(pl) = demod_snapshot.pl_tone_hz {
            fields.push((Tag::PlTone, Value::Float(pl)));
        }
        if let Some(doppler) = &self.doppler_lo {
            fields.push((Tag::DopplerFrequency, Value::Double(doppler.freq_hz())));
        }

        fields
    }

    /// Encodes the next publication against the receiver's delta cache.
    pub fn publish_status(&self) -> Vec<u8> {
        let fields = self.status_fields();
        self.state.lock().delta_cache.encode(&fields)
    }

    /// The active audio output session's SSRC, for the RTCP sender report.
    pub fn ssrc(&self) -> u32 {
        self.ssrc.load(Ordering::Relaxed)
    }

    /// Cumulative PCM output packet/byte counts, for the RTCP sender
    /// report (spec.md §4.9).
    pub fn pcm_totals(&self) -> (u64, u64) {
        let stats = self.pcm_stats.lock();
        (
            stats.packets.load(Ordering::Relaxed),
            stats.bytes.load(Ordering::Relaxed),
        )
    }

    /// Current output audio timestamp, used to derive the RTCP sender
    /// report's RTP timestamp companion to the wall-clock NTP time.
    pub fn audio_timestamp(&self) -> u32 {
        self.pcm_stats.lock().timestamp.load(Ordering::Relaxed)
    }
}

/// Placeholder active demodulator before the first `rebuild_demod()`
/// call installs the real one, so `DemodRuntime` always owns a thread.
struct NullDemod;
impl Demodulator for NullDemod {
    fn run_once(&mut self, _sink: &mut dyn dsp::demod::AudioSink) {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
}

struct NullSink;
impl dsp::demod::AudioSink for NullSink {
    fn write(&mut self, _samples: &[f32], _channels: u16) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::rtp::PacketQueue;

    fn receiver() -> Receiver {
        let config = Arc::new(Config::default());
        Receiver::new(config, Arc::new(PacketQueue::new())).unwrap()
    }

    #[test]
    fn small_retune_moves_second_lo_only() {
        let receiver = receiver();
        let initial_tuner = receiver.state.lock().tuner_freq_hz;
        receiver.set_frequency(initial_tuner + 1000.0);
        assert_eq!(receiver.state.lock().tuner_freq_hz, initial_tuner);
        assert!((receiver.second_lo.freq_hz() - (-1000.0)).abs() < 1e-6);
    }

    #[test]
    fn out_of_range_retune_moves_first_lo_and_resets_second() {
        let receiver = receiver();
        let initial_tuner = receiver.state.lock().tuner_freq_hz;
        let far = initial_tuner + receiver.sample_rate_hz;
        receiver.set_frequency(far);
        assert_eq!(receiver.state.lock().tuner_freq_hz, far);
        assert_eq!(receiver.second_lo.freq_hz(), 0.0);
    }

    #[test]
    fn status_fields_report_current_mode_name() {
        let receiver = receiver();
        let fields = receiver.status_fields();
        let mode_field = fields.iter().find(|(tag, _)| *tag == Tag::RadioMode).unwrap();
        assert_eq!(mode_field.1, Value::Str("usb".to_string()));
    }

    #[test]
    fn isb_and_square_commands_override_mode_defaults() {
        let receiver = receiver();

        let isb_field = |r: &Receiver| {
            r.status_fields()
                .into_iter()
                .find(|(tag, _)| *tag == Tag::IndependentSideband)
                .unwrap()
                .1
        };
        let square_field = |r: &Receiver| {
            r.status_fields()
                .into_iter()
                .find(|(tag, _)| *tag == Tag::PllSquare)
                .unwrap()
                .1
        };

        assert_eq!(isb_field(&receiver), Value::Byte(0));
        assert_eq!(square_field(&receiver), Value::Byte(0));

        receiver.apply_command(Command::SetIndependentSideband(true));
        receiver.apply_command(Command::SetSquareEnabled(true));
        assert_eq!(isb_field(&receiver), Value::Byte(1));
        assert_eq!(square_field(&receiver), Value::Byte(1));

        // Switching mode clears the overrides back to that mode's defaults.
        if let Some(index) = modetable::MODE_TABLE.iter().position(|m| m.name == "usb") {
            receiver.apply_command(Command::SetDemodMode(index as u8));
        }
        assert_eq!(isb_field(&receiver), Value::Byte(0));
        assert_eq!(square_field(&receiver), Value::Byte(0));
    }
}
