//! Thin wrapper over `rustfft` giving the filter and demodulator modules a
//! cached forward/inverse complex FFT plan, mirroring the persistent FFTW
//! plans `original_source/filter.c` keeps alive for the life of a filter.

use std::sync::Arc;

use rustfft::num_complex::Complex as RustfftComplex;
use rustfft::{Fft as _, FftPlanner};

use crate::Complex32;

/// A cached pair of forward/inverse FFT plans for a fixed transform size.
pub struct FftPlan {
    len: usize,
    forward: Arc<dyn rustfft::Fft<f32>>,
    inverse: Arc<dyn rustfft::Fft<f32>>,
}

impl FftPlan {
    pub fn new(len: usize) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        Self {
            len,
            forward: planner.plan_fft_forward(len),
            inverse: planner.plan_fft_inverse(len),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Forward transform in place. `buf.len()` must equal `self.len()`.
    pub fn forward(&self, buf: &mut [Complex32]) {
        let mut scratch = to_rustfft(buf);
        self.forward.process(&mut scratch);
        from_rustfft(&scratch, buf);
    }

    /// Inverse transform in place, unnormalized (matches FFTW's convention:
    /// callers divide by `len()` themselves, as `original_source/filter.c`
    /// folds the 1/N scale into the precomputed filter response instead).
    pub fn inverse(&self, buf: &mut [Complex32]) {
        let mut scratch = to_rustfft(buf);
        self.inverse.process(&mut scratch);
        from_rustfft(&scratch, buf);
    }
}

fn to_rustfft(buf: &[Complex32]) -> Vec<RustfftComplex<f32>> {
    buf.iter().map(|c| RustfftComplex::new(c.re, c.im)).collect()
}

fn from_rustfft(scratch: &[RustfftComplex<f32>], buf: &mut [Complex32]) {
    for (dst, src) in buf.iter_mut().zip(scratch) {
        *dst = Complex32::new(src.re, src.im);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_then_inverse_recovers_input_up_to_scale() {
        let plan = FftPlan::new(8);
        let original: Vec<Complex32> = (0..8)
            .map(|i| Complex32::new(i as f32, -(i as f32)))
            .collect();

        let mut buf = original.clone();
        plan.forward(&mut buf);
        plan.inverse(&mut buf);

        for (a, b) in buf.iter().zip(&original) {
            let scaled = Complex32::new(a.re / 8.0, a.im / 8.0);
            assert!((scaled - b).norm() < 1e-3);
        }
    }

    #[test]
    fn dc_input_produces_energy_only_in_bin_zero() {
        let plan = FftPlan::new(4);
        let mut buf = vec![Complex32::new(1.0, 0.0); 4];
        plan.forward(&mut buf);
        assert!((buf[0].re - 4.0).abs() < 1e-4);
        for bin in &buf[1..] {
            assert!(bin.norm() < 1e-4);
        }
    }
}
