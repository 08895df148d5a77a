//! The three demodulator subsystems (spec.md §4.4–§4.6): AM envelope
//! detection, FM phase discrimination with squelch and PL-tone
//! measurement, and coherent Linear (PLL) demodulation.

pub mod agc;
pub mod am;
pub mod fm;
pub mod linear;

use std::sync::atomic::AtomicBool;

/// Destination for demodulated PCM frames, decoupling a demodulator from
/// how audio actually leaves the process (RTP framing lives in
/// `proto::pcm`).
pub trait AudioSink: Send {
    fn write(&mut self, samples: &[f32], channels: u16);
}

/// A point-in-time snapshot of a demodulator's status-worthy fields
/// (spec.md §4.8: "demodulator-specific fields" in the periodic status
/// report). Every demodulator exposes the fields relevant to it and
/// leaves the rest at their default; the status publisher picks the
/// fields that apply to the active mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct DemodSnapshot {
    pub snr: f32,
    pub baseband_power: f32,
    pub gain: f32,
    pub freq_offset_hz: f32,
    pub peak_deviation_hz: f32,
    pub pl_tone_hz: Option<f32>,
    pub pll_locked: bool,
    pub squelch_open: bool,
}

/// One iteration of a demodulator's main loop: block on the next filtered
/// block, demodulate it, and publish audio plus whatever status fields
/// changed. Each concrete demodulator runs this in its own `std::thread`
/// until `cancel` is observed set, matching spec.md §5's "exactly one
/// active demodulator" lifecycle and §9's cancellation-token guidance.
pub trait Demodulator: Send {
    fn run_once(&mut self, sink: &mut dyn AudioSink);

    /// Reports the fields this demodulator contributes to the status
    /// stream. Demodulators that don't track a given field (e.g. AM has
    /// no PLL lock) leave it at `DemodSnapshot`'s default.
    fn snapshot(&self) -> DemodSnapshot {
        DemodSnapshot::default()
    }

    fn run(&mut self, cancel: &AtomicBool, sink: &mut dyn AudioSink) {
        while !cancel.load(std::sync::atomic::Ordering::Relaxed) {
            self.run_once(sink);
        }
    }
}

/// Signal-to-noise estimate shared by every demodulator's status report,
/// computed the same way as `compute_n0`/`demod->snr` in the C sources:
/// clamped to zero since smoothed inputs can be momentarily inconsistent.
pub fn clamp_snr(snr: f32) -> f32 {
    snr.max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_snr_floors_negative_values() {
        assert_eq!(clamp_snr(-3.0), 0.0);
        assert_eq!(clamp_snr(4.0), 4.0);
    }
}
