//! Overlap-save filter slave (output) side (spec.md §4.3): a decimating
//! output filter sharing one master's spectrum with a private frequency
//! response and decimation ratio.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::kaiser::{design_deemphasis_response, design_response, noise_gain};
use super::master::FilterMaster;
use crate::fft::FftPlan;
use crate::Complex32;

/// How a slave's frequency-domain output is assembled from the master's
/// spectrum. Pre-detection filters in this receiver always take complex
/// I/Q input, so only the complex-output forms are needed (spec.md §4.1:
/// "Output type is cross-conjugate if ISB is enabled, otherwise complex").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    Complex,
    /// Independent-sideband: lower sideband folded onto the real channel,
    /// upper sideband onto the imaginary channel.
    CrossConj,
    /// Single-channel real-valued output, used for filtering stages whose
    /// input is already real (post-detection audio). The response
    /// installed for this output type must itself be Hermitian-symmetric
    /// (see `design_deemphasis_response`) for the imaginary part of the
    /// result to vanish; only the real component is meaningful to a
    /// caller using this type.
    Real,
}

struct SlaveResponse {
    bins: Vec<Complex32>,
    noise_gain: f32,
}

/// One decimated output tap on a [`FilterMaster`]. Cheap to create; many
/// slaves (e.g. one per active demodulator) can share a master.
pub struct FilterSlave {
    master: Arc<FilterMaster>,
    decimate: usize,
    out_type: OutputType,
    n_dec: usize,
    l_dec: usize,
    ifft: FftPlan,
    response: Mutex<SlaveResponse>,
    last_seen: AtomicU64,
}

impl FilterSlave {
    pub fn new(master: Arc<FilterMaster>, decimate: usize, out_type: OutputType) -> Self {
        let n = master.fft_len();
        assert!(
            n % decimate == 0,
            "FFT size {n} not divisible by decimation ratio {decimate}"
        );
        let n_dec = n / decimate;
        let l_dec = master.input_len() / decimate;

        Self {
            master,
            decimate,
            out_type,
            n_dec,
            l_dec,
            ifft: FftPlan::new(n_dec),
            response: Mutex::new(SlaveResponse {
                bins: vec![Complex32::new(0.0, 0.0); n_dec],
                noise_gain: f32::NAN,
            }),
            last_seen: AtomicU64::new(0),
        }
    }

    pub fn decimate(&self) -> usize {
        self.decimate
    }

    pub fn output_len(&self) -> usize {
        self.l_dec
    }

    pub fn out_type(&self) -> OutputType {
        self.out_type
    }

    pub fn noise_gain(&self) -> f32 {
        self.response.lock().noise_gain
    }

    /// Designs and atomically installs a new passband response for
    /// `[low_hz, high_hz]` at the master's sample rate, windowed by a
    /// length-`impulse_len` Kaiser response. Mirrors `set_filter()`.
    pub fn set_filter(&self, sample_rate_hz: f32, low_hz: f32, high_hz: f32, kaiser_beta: f32) {
        let impulse_len_dec = (self.master.impulse_len() - 1) / self.decimate + 1;
        let halve = matches!(self.out_type, OutputType::CrossConj);
        let bins = design_response(
            self.n_dec,
            impulse_len_dec,
            sample_rate_hz / self.decimate as f32,
            low_hz,
            high_hz,
            kaiser_beta,
            halve,
        );
        let gain = noise_gain(&bins, halve);

        let mut response = self.response.lock();
        response.bins = bins;
        response.noise_gain = gain;
    }

    /// Designs and installs a de-emphasis shelf response in place of the
    /// usual passband mask, for `OutputType::Real` slaves used in FM's
    /// post-detection audio path.
    pub fn set_deemphasis_filter(
        &self,
        sample_rate_hz: f32,
        corner_hz: f32,
        upper_hz: f32,
        kaiser_beta: f32,
    ) {
        let impulse_len_dec = (self.master.impulse_len() - 1) / self.decimate + 1;
        let bins = design_deemphasis_response(
            self.n_dec,
            impulse_len_dec,
            sample_rate_hz / self.decimate as f32,
            corner_hz,
            upper_hz,
            kaiser_beta,
        );
        let gain = noise_gain(&bins, false);

        let mut response = self.response.lock();
        response.bins = bins;
        response.noise_gain = gain;
    }

    /// Blocks until the master publishes a new block this slave hasn't
    /// consumed yet, applies this slave's response, and returns the
    /// `output_len()` time-domain samples remaining after discarding the
    /// overlap-save aliasing region.
    pub fn next_block(&self) -> Vec<Complex32> {
        let last = self.last_seen.load(Ordering::Acquire);
        let (blocknum, master_fd) = self.master.wait_for_block(last);
        self.last_seen.store(blocknum, Ordering::Release);

        let n = master_fd.len();
        let n_dec = self.n_dec;
        let response = self.response.lock();

        let mut f = vec![Complex32::new(0.0, 0.0); n_dec];
        for (p, slot) in f.iter_mut().enumerate().take(n_dec / 2 + 1) {
            *slot = response.bins[p] * master_fd[p];
        }
        {
            let mut src = n;
            let mut dst = n_dec;
            while dst > n_dec / 2 + 1 {
                src -= 1;
                dst -= 1;
                f[dst] = response.bins[dst] * master_fd[src];
            }
        }
        drop(response);

        if self.out_type == OutputType::CrossConj {
            for p in 1..n_dec / 2 {
                let dn = n_dec - p;
                let pos = f[p];
                let neg = f[dn];
                f[p] = pos + neg.conj();
                f[dn] = neg - pos.conj();
            }
        }

        self.ifft.inverse(&mut f);

        let discard = n_dec - self.l_dec;
        f.split_off(discard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slave_output_length_matches_decimated_block() {
        let master = Arc::new(FilterMaster::new(64, 17));
        let slave = FilterSlave::new(master.clone(), 2, OutputType::Complex);
        assert_eq!(slave.output_len(), 32);

        slave.set_filter(8000.0, -2000.0, 2000.0, 3.0);

        let block = vec![Complex32::new(1.0, 0.0); 64];
        master.write_block(&block);

        let out = slave.next_block();
        assert_eq!(out.len(), 32);
    }

    #[test]
    fn dc_passband_passes_dc_input_with_gain_near_unity() {
        let master = Arc::new(FilterMaster::new(64, 17));
        let slave = FilterSlave::new(master.clone(), 1, OutputType::Complex);
        slave.set_filter(8000.0, -4000.0, 4000.0, 0.0);

        for _ in 0..4 {
            master.write_block(&vec![Complex32::new(1.0, 0.0); 64]);
        }
        let out = slave.next_block();
        for sample in &out {
            assert!((sample.re - 1.0).abs() < 0.2, "sample={sample:?}");
        }
    }

    #[test]
    fn cross_conj_output_folds_sidebands() {
        let master = Arc::new(FilterMaster::new(64, 17));
        let slave = FilterSlave::new(master.clone(), 2, OutputType::CrossConj);
        slave.set_filter(8000.0, -2000.0, 2000.0, 3.0);

        master.write_block(&vec![Complex32::new(1.0, 0.0); 64]);
        let out = slave.next_block();
        assert_eq!(out.len(), 32);
        assert!(out.iter().all(|c| c.re.is_finite() && c.im.is_finite()));
    }
}
