//! Linear (coherent) demodulator: coarse-FFT carrier acquisition, a
//! second-order PLL with lock hysteresis, and a manual AGC identical in
//! structure to the AM demodulator's (spec.md §4.6). Grounded in
//! `original_source/linear.c`.

use std::f32::consts::TAU;

use crate::fft::FftPlan;
use crate::filter::FilterSlave;
use crate::osc::Oscillator;
use crate::Complex32;

use super::agc::{Agc, AgcParams};
use super::AudioSink;

/// Ring buffer length for coarse acquisition (spec.md §4.6: "size 2^16").
const RING_LEN: usize = 1 << 16;
/// Coarse search band, Hz, doubled in squaring mode.
const COARSE_SEARCH_HZ: f32 = 300.0;

#[derive(Debug, Clone, Copy)]
pub struct LinearConfig {
    pub squaring: bool,
    pub stereo: bool,
    /// Whether carrier-tracking PLL acquisition runs at all. When false
    /// (plain USB/LSB/IQ), the coarse/fine oscillators stay fixed and no
    /// coherent SNR is computed — matching `original_source/linear.c`'s
    /// `if (demod->opt.pll) { ... }` gate, which keeps a non-PLL mode from
    /// locking onto an in-band voice/tone component and shifting the
    /// whole passband.
    pub pll: bool,
    pub loop_bw_hz: f32,
    pub sample_rate_hz: f32,
}

pub struct LinearDemodulator {
    filter: FilterSlave,
    config: LinearConfig,

    ring: Vec<Complex32>,
    ring_ptr: usize,
    ring_new: usize,
    coarse_fft: FftPlan,

    coarse_osc: Oscillator,
    fine_osc: Oscillator,
    post_shift_osc: Oscillator,

    // PI loop state.
    integrator_phase: f64,
    ramp_hz: f64,

    lock_counter: i64,
    lock_limit: i64,
    locked: bool,

    agc: Agc,
    snr: f32,
}

impl LinearDemodulator {
    pub fn new(filter: FilterSlave, config: LinearConfig, agc_params: AgcParams) -> Self {
        let sample_time = 1.0 / config.sample_rate_hz;
        let lock_limit = config.sample_rate_hz as i64; // 1 second worth of (decimated) blocks-of-samples
        Self {
            filter,
            config,
            ring: vec![Complex32::new(0.0, 0.0); RING_LEN],
            ring_ptr: 0,
            ring_new: 0,
            coarse_fft: FftPlan::new(RING_LEN),
            coarse_osc: Oscillator::new(config.sample_rate_hz as f64),
            fine_osc: Oscillator::new(config.sample_rate_hz as f64),
            post_shift_osc: Oscillator::new(config.sample_rate_hz as f64),
            integrator_phase: 0.0,
            ramp_hz: 0.0,
            lock_counter: 0,
            lock_limit,
            locked: false,
            agc: Agc::new(agc_params, sample_time),
            snr: 0.0,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn snr(&self) -> f32 {
        self.snr
    }

    pub fn set_post_detection_shift_hz(&self, hz: f64) {
        self.post_shift_osc.set_freq_hz(hz);
    }

    fn ring_push(&mut self, sample: Complex32) {
        let value = if self.config.squaring { sample * sample } else { sample };
        self.ring[self.ring_ptr] = value;
        self.ring_ptr = (self.ring_ptr + 1) % RING_LEN;
        self.ring_new = (self.ring_new + 1).min(RING_LEN);
    }

    /// Coarse acquisition: find the strongest bin in the search band and
    /// re-tune the coarse oscillator toward it, resetting the PLL
    /// integrator.
    fn coarse_acquire(&mut self) {
        if self.ring_new < RING_LEN / 2 {
            return;
        }
        self.ring_new = 0;

        let mut buf = self.ring.clone();
        self.coarse_fft.forward(&mut buf);

        let search_hz = if self.config.squaring {
            2.0 * COARSE_SEARCH_HZ
        } else {
            COARSE_SEARCH_HZ
        };
        let bin_hz = self.config.sample_rate_hz / RING_LEN as f32;
        let search_bins = (search_hz / bin_hz).ceil() as i64;

        let mut best_bin = 0i64;
        let mut best_energy = 0.0f32;
        for offset in -search_bins..=search_bins {
            let bin = offset.rem_euclid(RING_LEN as i64) as usize;
            let energy = buf[bin].norm_sqr();
            if energy > best_energy {
                best_energy = energy;
                best_bin = offset;
            }
        }

        let mut offset_hz = best_bin as f32 * bin_hz;
        if self.config.squaring {
            offset_hz /= 2.0;
        }
        self.coarse_osc.set_freq_hz(offset_hz as f64);
        self.integrator_phase = 0.0;
        self.ramp_hz = 0.0;
    }

    fn update_lock(&mut self, snr_above_threshold: bool) {
        if snr_above_threshold {
            self.lock_counter += 1;
        } else {
            self.lock_counter -= 1;
        }
        self.lock_counter = self.lock_counter.clamp(-self.lock_limit, self.lock_limit);

        if self.lock_counter >= self.lock_limit {
            self.locked = true;
            self.ramp_hz = 0.0;
        } else if self.lock_counter <= -self.lock_limit {
            self.locked = false;
        }
    }

    /// Advances the fine PI loop from one block's accumulated phase error
    /// and steps the fine oscillator's frequency accordingly.
    fn run_pll(&mut self, accum: Complex32, block_time_s: f64) {
        let mut phase = accum.arg() as f64;
        if self.config.squaring {
            phase *= 0.5;
        }

        if !self.locked {
            self.ramp_hz = self.config.loop_bw_hz as f64;
        }

        let wn = self.config.loop_bw_hz as f64 * std::f64::consts::TAU;
        let zeta = std::f64::consts::FRAC_1_SQRT_2;
        let kp = 2.0 * zeta * wn;
        let ki = wn * wn;

        self.integrator_phase += (phase * ki) * block_time_s + self.ramp_hz * block_time_s;
        let freq_hz = (phase * kp + self.integrator_phase) / TAU as f64;
        self.fine_osc.set_freq_hz(freq_hz);
    }
}

impl super::Demodulator for LinearDemodulator {
    fn snapshot(&self) -> super::DemodSnapshot {
        super::DemodSnapshot {
            snr: self.snr,
            gain: self.agc.gain(),
            pll_locked: self.locked,
            ..Default::default()
        }
    }

    fn run_once(&mut self, sink: &mut dyn AudioSink) {
        let block = self.filter.next_block();
        let olen = block.len();
        let block_time_s = olen as f64 / self.config.sample_rate_hz as f64;

        // Single pass: the coarse/fine oscillators are stepped here and
        // `corrected` immediately closes the loop by feeding the same
        // oscillator-corrected value into the phase-error accumulator and
        // the amplitude sums used for SNR/AGC, matching
        // `original_source/linear.c`'s `filter->output.c[n] *=
        // step_osc(&coarse) * step_osc(&fine);` applied in place before
        // both the phase accumulator and the amplitude sums read the
        // sample. Only runs when this mode tracks a carrier at all
        // (spec.md §4.6; `LinearConfig::pll`); otherwise the samples pass
        // through with fixed oscillators and no coherent SNR.
        let mut corrected: Vec<Complex32> = Vec::with_capacity(olen);

        if self.config.pll {
            let mut accum = Complex32::new(0.0, 0.0);
            let mut sum_i_sq = 0.0f32;
            let mut sum_q_sq = 0.0f32;

            for sample in &block {
                self.ring_push(*sample);

                let coarse = self.coarse_osc.step();
                let fine = self.fine_osc.step();
                let tracked = sample * coarse * fine;

                accum += if self.config.squaring { tracked * tracked } else { tracked };
                sum_i_sq += tracked.re * tracked.re;
                sum_q_sq += tracked.im * tracked.im;
                corrected.push(tracked);
            }

            self.snr = super::clamp_snr(if sum_q_sq > 0.0 { sum_i_sq / sum_q_sq - 1.0 } else { 0.0 });
            self.update_lock(self.snr > 2.0);

            if !self.locked {
                self.coarse_acquire();
            }
            self.run_pll(accum, block_time_s);
        } else {
            self.snr = f32::NAN;
            corrected.extend_from_slice(&block);
        }

        let mut sum_i_sq = 0.0f32;
        let mut sum_q_sq = 0.0f32;
        for sample in &corrected {
            sum_i_sq += sample.re * sample.re;
            sum_q_sq += sample.im * sample.im;
        }
        let peak = (sum_i_sq + sum_q_sq).sqrt() / olen as f32;

        let mut samples = Vec::with_capacity(olen * if self.config.stereo { 2 } else { 1 });
        for sample in &corrected {
            let post = self.post_shift_osc.step();
            let shifted = sample * post;
            let magnitude = shifted.norm();
            let gained_i = self.agc.apply(shifted.re, peak.max(magnitude));

            if self.config.stereo {
                samples.push(gained_i);
                samples.push(shifted.im * self.agc.gain());
            } else {
                samples.push(gained_i);
            }
        }

        let channels = if self.config.stereo { 2 } else { 1 };
        sink.write(&samples, channels);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::filter::{FilterMaster, OutputType};

    struct VecSink(Vec<f32>);
    impl AudioSink for VecSink {
        fn write(&mut self, samples: &[f32], _channels: u16) {
            self.0.extend_from_slice(samples);
        }
    }

    #[test]
    fn mono_output_is_one_sample_per_input() {
        use super::super::Demodulator;

        let master = Arc::new(FilterMaster::new(64, 17));
        let filter = FilterSlave::new(master.clone(), 1, OutputType::Complex);
        filter.set_filter(8000.0, -4000.0, 4000.0, 3.0);

        let config = LinearConfig {
            squaring: false,
            stereo: false,
            pll: true,
            loop_bw_hz: 50.0,
            sample_rate_hz: 8000.0,
        };
        let mut demod = LinearDemodulator::new(filter, config, AgcParams::default());
        let mut sink = VecSink(Vec::new());

        master.write_block(&vec![Complex32::new(1.0, 0.0); 64]);
        demod.run_once(&mut sink);
        assert_eq!(sink.0.len(), 64);
    }

    #[test]
    fn stereo_output_is_two_samples_per_input() {
        use super::super::Demodulator;

        let master = Arc::new(FilterMaster::new(64, 17));
        let filter = FilterSlave::new(master.clone(), 1, OutputType::CrossConj);
        filter.set_filter(8000.0, -4000.0, 4000.0, 3.0);

        let config = LinearConfig {
            squaring: false,
            stereo: true,
            pll: true,
            loop_bw_hz: 50.0,
            sample_rate_hz: 8000.0,
        };
        let mut demod = LinearDemodulator::new(filter, config, AgcParams::default());
        let mut sink = VecSink(Vec::new());

        master.write_block(&vec![Complex32::new(1.0, 0.0); 64]);
        demod.run_once(&mut sink);
        assert_eq!(sink.0.len(), 128);
    }

    #[test]
    fn lock_counter_saturates_within_limit() {
        let master = Arc::new(FilterMaster::new(64, 17));
        let filter = FilterSlave::new(master, 1, OutputType::Complex);
        let config = LinearConfig {
            squaring: false,
            stereo: false,
            pll: true,
            loop_bw_hz: 50.0,
            sample_rate_hz: 100.0,
        };
        let mut demod = LinearDemodulator::new(filter, config, AgcParams::default());
        for _ in 0..500 {
            demod.update_lock(true);
        }
        assert!(demod.is_locked());
        for _ in 0..500 {
            demod.update_lock(false);
        }
        assert!(!demod.is_locked());
    }

    #[test]
    fn non_pll_mode_leaves_snr_nan_and_never_locks() {
        use super::super::Demodulator;

        let master = Arc::new(FilterMaster::new(64, 17));
        let filter = FilterSlave::new(master.clone(), 1, OutputType::Complex);
        filter.set_filter(8000.0, -4000.0, 4000.0, 3.0);

        let config = LinearConfig {
            squaring: false,
            stereo: false,
            pll: false,
            loop_bw_hz: 50.0,
            sample_rate_hz: 8000.0,
        };
        let mut demod = LinearDemodulator::new(filter, config, AgcParams::default());
        let mut sink = VecSink(Vec::new());

        for _ in 0..10 {
            master.write_block(&vec![Complex32::new(1.0, 0.0); 64]);
            demod.run_once(&mut sink);
        }

        assert!(demod.snr().is_nan());
        assert!(!demod.is_locked());
    }
}
