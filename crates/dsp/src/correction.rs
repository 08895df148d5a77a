//! I/Q front-end correction: DC offset, amplitude imbalance and phase
//! skew estimation and cancellation (spec.md §3 "I/Q correction state"
//! and §4.2 "Sample conversion"). Grounded in `original_source/radio.c`'s
//! per-sample correction loop and its per-block IIR parameter update.

use crate::Complex32;

/// Time constant, in seconds, of the DC-offset smoothing recursion.
pub const DC_ALPHA_TIME_CONSTANT: f32 = 1.0;

/// Smoothed DC means, amplitude imbalance and phase-skew estimate applied
/// to every incoming sample before it reaches the filter.
pub struct IqCorrection {
    dc_i: f32,
    dc_q: f32,
    imbalance: f32,
    sin_phi: f32,

    // Gains derived from `imbalance`/`sin_phi`, recomputed once per block.
    gain_i: f32,
    gain_q: f32,
    sec_phi: f32,
    tan_phi: f32,

    // Per-pair accumulators, reset every block.
    sum_i: f32,
    sum_q: f32,
    sum_i_sq: f32,
    sum_q_sq: f32,
    sum_iq: f32,
    count: u32,
}

impl Default for IqCorrection {
    fn default() -> Self {
        Self {
            dc_i: 0.0,
            dc_q: 0.0,
            imbalance: 1.0,
            sin_phi: 0.0,
            gain_i: 1.0,
            gain_q: 1.0,
            sec_phi: 1.0,
            tan_phi: 0.0,
            sum_i: 0.0,
            sum_q: 0.0,
            sum_i_sq: 0.0,
            sum_q_sq: 0.0,
            sum_iq: 0.0,
            count: 0,
        }
    }
}

impl IqCorrection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the current correction to one raw sample and accumulates
    /// the per-pair statistics used to update the estimate at block end.
    /// Order matches spec.md §4.2: DC subtract, imbalance gain, phase
    /// rotation.
    pub fn apply(&mut self, raw: Complex32) -> Complex32 {
        let mut i = raw.re - self.dc_i;
        let mut q = raw.im - self.dc_q;

        self.sum_i += raw.re;
        self.sum_q += raw.im;
        self.sum_i_sq += i * i;
        self.sum_q_sq += q * q;

        i *= self.gain_i;
        q *= self.gain_q;
        self.sum_iq += i * q;

        let q_corrected = self.sec_phi * q - self.tan_phi * i;

        Complex32::new(i, q_corrected)
    }

    /// Updates the smoothed estimates from one block's accumulated
    /// statistics and resets the accumulators. `block_len` is the number
    /// of samples just processed; `sample_rate` is used to scale the
    /// smoothing time constant.
    pub fn update_block(&mut self, block_len: u32, sample_rate: f32) {
        if block_len == 0 {
            return;
        }

        let n = block_len as f32;
        let mut smooth = n / (sample_rate * DC_ALPHA_TIME_CONSTANT);
        if !smooth.is_finite() {
            smooth = n;
        }
        let dc_alpha = smooth;

        self.dc_i += dc_alpha * (self.sum_i - n * self.dc_i) / n.max(1.0);
        self.dc_q += dc_alpha * (self.sum_q - n * self.dc_q) / n.max(1.0);

        if self.sum_q_sq > 0.0 {
            self.imbalance += smooth * ((self.sum_i_sq / self.sum_q_sq) - self.imbalance);
        }

        let block_energy = 0.5 * (self.sum_i_sq + self.sum_q_sq);
        if block_energy > 0.0 {
            let dpn = self.sum_iq / block_energy;
            self.sin_phi += smooth * (dpn - self.sin_phi);
        }

        self.gain_i = (0.5 * (1.0 + self.imbalance)).max(0.0).sqrt();
        self.gain_q = (0.5 * (1.0 + 1.0 / self.imbalance)).max(0.0).sqrt();
        self.sec_phi = 1.0 / (1.0 - self.sin_phi * self.sin_phi).max(1e-6).sqrt();
        self.tan_phi = self.sin_phi * self.sec_phi;

        self.sum_i = 0.0;
        self.sum_q = 0.0;
        self.sum_i_sq = 0.0;
        self.sum_q_sq = 0.0;
        self.sum_iq = 0.0;
        self.count = 0;
    }

    pub fn dc_i(&self) -> f32 {
        self.dc_i
    }

    pub fn dc_q(&self) -> f32 {
        self.dc_q
    }

    pub fn imbalance(&self) -> f32 {
        self.imbalance
    }

    pub fn sin_phi(&self) -> f32 {
        self.sin_phi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_correction_is_identity() {
        let mut correction = IqCorrection::new();
        let out = correction.apply(Complex32::new(0.5, -0.25));
        assert!((out.re - 0.5).abs() < 1e-6);
        assert!((out.im - (-0.25)).abs() < 1e-6);
    }

    #[test]
    fn dc_offset_converges_toward_mean() {
        let mut correction = IqCorrection::new();
        for _ in 0..200 {
            for _ in 0..240 {
                correction.apply(Complex32::new(0.1, 0.1));
            }
            correction.update_block(240, 192_000.0);
        }
        assert!((correction.dc_i() - 0.1).abs() < 0.02);
        assert!((correction.dc_q() - 0.1).abs() < 0.02);
    }
}
