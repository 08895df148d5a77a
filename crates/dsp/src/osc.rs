//! Complex numerically-controlled oscillator (spec.md §3, "Complex
//! oscillator"). Grounded in `original_source/osc.c`: a unit-magnitude
//! phasor advanced each step by `phasor_step`, itself advanced each step
//! by `phasor_step_step` to implement a constant-rate sweep, renormalized
//! every `RENORM_RATE` steps to control amplitude drift.

use parking_lot::Mutex;

use crate::Complex32;

/// Renormalize the phasor this often to prevent amplitude drift.
pub const RENORM_RATE: u32 = 16384;

#[derive(Debug, Clone, Copy)]
struct OscState {
    freq: f64,
    rate: f64,
    phasor: Complex32,
    phasor_step: Complex32,
    phasor_step_step: Complex32,
    steps: u32,
}

impl Default for OscState {
    fn default() -> Self {
        Self {
            freq: 0.0,
            rate: 0.0,
            phasor: Complex32::new(1.0, 0.0),
            phasor_step: Complex32::new(1.0, 0.0),
            phasor_step_step: Complex32::new(1.0, 0.0),
            steps: 0,
        }
    }
}

/// Returns `true` if `phasor` looks like a properly initialized unit
/// phasor rather than NaN or a collapsed-to-zero value (mirrors
/// `original_source/osc.c`'s `is_phasor_init`).
fn is_phasor_init(phasor: Complex32) -> bool {
    !phasor.re.is_nan() && !phasor.im.is_nan() && phasor.norm_sqr() >= 0.9
}

/// A complex oscillator stepped at the sample rate. Parameters (`freq`,
/// `rate`) are changed under the internal mutex by any thread; the phasor
/// itself is stepped only by the owning thread (spec.md §3 lifecycle),
/// which still takes the same lock for the short critical section so a
/// concurrent `set` is never torn.
pub struct Oscillator {
    state: Mutex<OscState>,
    sample_rate: f64,
}

impl Oscillator {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            state: Mutex::new(OscState::default()),
            sample_rate,
        }
    }

    /// Whether the oscillator has ever been given a nonzero frequency or
    /// sweep rate (used to gate optional oscillators like Doppler, which
    /// should contribute nothing to the translation chain until armed).
    pub fn is_active(&self) -> bool {
        is_phasor_init(self.state.lock().phasor)
    }

    /// Sets frequency and sweep rate in cycles/sample and
    /// cycles/sample^2. A NaN or collapsed phasor is treated as
    /// uninitialized and reset to magnitude 1 without a phase jump;
    /// otherwise the current phase is preserved across a frequency change.
    pub fn set_cycles_per_sample(&self, freq: f64, rate: f64) {
        let mut state = self.state.lock();
        if !is_phasor_init(state.phasor) {
            state.phasor = Complex32::new(1.0, 0.0);
            state.steps = 0;
        }
        state.freq = freq;
        state.rate = rate;
        state.phasor_step = cycles_to_phasor(freq);
        state.phasor_step_step = if rate != 0.0 {
            cycles_to_phasor(rate)
        } else {
            Complex32::new(1.0, 0.0)
        };
    }

    /// Sets frequency in Hz given the oscillator's sample rate.
    pub fn set_freq_hz(&self, freq_hz: f64) {
        self.set_cycles_per_sample(freq_hz / self.sample_rate, 0.0);
    }

    pub fn freq_hz(&self) -> f64 {
        self.state.lock().freq * self.sample_rate
    }

    /// Advances the oscillator one sample, returning the phasor value
    /// *before* the step (the phase to apply to this sample).
    pub fn step(&self) -> Complex32 {
        let mut state = self.state.lock();

        if state.phasor.re.is_nan() || state.phasor.im.is_nan() {
            state.phasor = Complex32::new(1.0, 0.0);
            state.steps = 0;
        }

        let out = state.phasor;

        if state.freq != 0.0 {
            state.phasor *= state.phasor_step;
            if state.rate != 0.0 {
                state.phasor_step *= state.phasor_step_step;
            }
        }

        state.steps += 1;
        if state.steps == RENORM_RATE {
            renormalize(&mut state);
        }

        out
    }

    /// Advances the oscillator `n` steps without retrieving intermediate
    /// values, used to keep phase continuous across a gap-filled packet
    /// loss (spec.md §4.2, "Gap filling").
    pub fn advance(&self, n: u32) {
        for _ in 0..n {
            self.step();
        }
    }

    /// Renormalizes the phasor to unit magnitude now, regardless of the
    /// step counter (called once per filter block in the sample
    /// processor, matching `original_source/radio.c`'s per-block
    /// renormalization in addition to osc.c's periodic one).
    pub fn renormalize_now(&self) {
        renormalize(&mut self.state.lock());
    }
}

fn renormalize(state: &mut OscState) {
    state.steps = 0;
    let mag = state.phasor.norm();
    if mag > 0.0 {
        state.phasor /= mag;
    }
    let step_mag = state.phasor_step.norm();
    if state.rate != 0.0 && step_mag > 0.0 {
        state.phasor_step /= step_mag;
    }
}

fn cycles_to_phasor(cycles: f64) -> Complex32 {
    let angle = 2.0 * std::f64::consts::PI * cycles;
    Complex32::new(angle.cos() as f32, angle.sin() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_unit_magnitude() {
        let osc = Oscillator::new(48000.0);
        assert_eq!(osc.step(), Complex32::new(1.0, 0.0));
    }

    #[test]
    fn zero_frequency_holds_phase() {
        let osc = Oscillator::new(48000.0);
        for _ in 0..100 {
            assert_eq!(osc.step(), Complex32::new(1.0, 0.0));
        }
    }

    #[test]
    fn stays_near_unit_magnitude_after_many_steps() {
        let osc = Oscillator::new(48000.0);
        osc.set_freq_hz(1000.0);
        for _ in 0..(RENORM_RATE * 3) {
            let phasor = osc.step();
            assert!((phasor.norm() - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn advance_matches_repeated_step() {
        let a = Oscillator::new(48000.0);
        let b = Oscillator::new(48000.0);
        a.set_freq_hz(250.0);
        b.set_freq_hz(250.0);

        for _ in 0..50 {
            a.step();
        }
        b.advance(50);

        let pa = a.step();
        let pb = b.step();
        assert!((pa - pb).norm() < 1e-4);
    }

    #[test]
    fn nan_phasor_reinitializes() {
        let osc = Oscillator::new(48000.0);
        {
            let mut state = osc.state.lock();
            state.phasor = Complex32::new(f32::NAN, 0.0);
            state.freq = 0.0;
        }
        assert_eq!(osc.step(), Complex32::new(1.0, 0.0));
    }
}
