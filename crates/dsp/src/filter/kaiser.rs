//! Kaiser window design and frequency-response shaping, grounded in
//! `original_source/filter.c`'s `i0`/`make_kaiser`/`window_filter`.

use crate::fft::FftPlan;
use crate::Complex32;

/// Modified Bessel function of the first kind, order 0, via the series
/// `original_source/filter.c`'s `i0()` truncates once a term becomes
/// negligible relative to the running sum.
fn bessel_i0(x: f32) -> f32 {
    let t = 0.25 * x * x;
    let mut sum = 1.0 + t;
    let mut term = t;
    for k in 2..40u32 {
        term *= t / (k * k) as f32;
        sum += term;
        if term < 1e-12 * sum {
            break;
        }
    }
    sum
}

/// Computes a length-`m` Kaiser window with shape factor `beta`.
pub fn kaiser_window(m: usize, beta: f32) -> Vec<f32> {
    let mut window = vec![0.0f32; m];
    if m == 0 {
        return window;
    }
    if m == 1 {
        window[0] = 1.0;
        return window;
    }

    let numc = std::f32::consts::PI * beta;
    let inv_denom = 1.0 / bessel_i0(numc);
    let pc = 2.0 / (m - 1) as f32;

    for n in 0..m / 2 {
        let p = pc * n as f32 - 1.0;
        let value = bessel_i0(numc * (1.0 - p * p).max(0.0).sqrt()) * inv_denom;
        window[n] = value;
        window[m - 1 - n] = value;
    }
    if m % 2 == 1 {
        window[(m - 1) / 2] = 1.0;
    }
    window
}

/// Shapes a length-`n` frequency-domain mask into a causal, time-limited
/// filter response: round-trips to the time domain, applies a centered
/// length-`m` Kaiser window, zero-pads, and transforms back. Matches
/// `original_source/filter.c`'s `window_filter()`.
pub fn window_response(m: usize, response: &mut [Complex32], beta: f32) {
    let n = response.len();
    if n == 0 {
        return;
    }
    let fft = FftPlan::new(n);

    fft.inverse(response);

    let window = kaiser_window(m, beta);
    let gain = 1.0 / n as f32;

    let mut shifted = vec![Complex32::new(0.0, 0.0); n];
    for (out_n, slot) in shifted.iter_mut().enumerate().take(m) {
        let src = (out_n + n - m / 2) % n;
        *slot = response[src] * window[out_n] * gain;
    }
    response.copy_from_slice(&shifted);

    fft.forward(response);
}

/// Builds a length-`n_dec` frequency-domain passband mask for `[low, high]`
/// Hz at decimated sample rate `dsamprate_hz`, windows it with a length-`m`
/// Kaiser response, and returns the finished frequency-domain filter
/// response ready to install on a slave. Mirrors `set_filter()`.
pub fn design_response(
    n_dec: usize,
    m_dec: usize,
    dsamprate_hz: f32,
    low_hz: f32,
    high_hz: f32,
    kaiser_beta: f32,
    halve_for_isb: bool,
) -> Vec<Complex32> {
    let mut gain = 1.0 / n_dec as f32;
    if halve_for_isb {
        gain *= std::f32::consts::FRAC_1_SQRT_2;
    }

    let mut response = vec![Complex32::new(0.0, 0.0); n_dec];
    for (n, slot) in response.iter_mut().enumerate() {
        let f = if n <= n_dec / 2 {
            n as f32 * dsamprate_hz / n_dec as f32
        } else {
            (n as f32 - n_dec as f32) * dsamprate_hz / n_dec as f32
        };
        if f >= low_hz && f <= high_hz {
            *slot = Complex32::new(gain, 0.0);
        }
    }

    window_response(m_dec, &mut response, kaiser_beta);
    response
}

/// Builds a length-`n_dec` de-emphasis shelf response: unity gain below
/// `corner_hz`, rolling off as `corner_hz / |f|` up to `upper_hz`, zero
/// above it. Used for FM's post-detection audio de-emphasis, in place of
/// the single-pole IIR `original_source/fm.c`'s `deemphasis()` uses,
/// restated as a fast-convolution response so it runs on the same
/// `FilterSlave` machinery as every other filtering stage here.
pub fn design_deemphasis_response(
    n_dec: usize,
    m_dec: usize,
    dsamprate_hz: f32,
    corner_hz: f32,
    upper_hz: f32,
    kaiser_beta: f32,
) -> Vec<Complex32> {
    let mut response = vec![Complex32::new(0.0, 0.0); n_dec];
    for (n, slot) in response.iter_mut().enumerate() {
        let f = if n <= n_dec / 2 {
            n as f32 * dsamprate_hz / n_dec as f32
        } else {
            (n as f32 - n_dec as f32) * dsamprate_hz / n_dec as f32
        };
        let af = f.abs();
        if af <= corner_hz {
            *slot = Complex32::new(1.0 / n_dec as f32, 0.0);
        } else if af <= upper_hz {
            *slot = Complex32::new(corner_hz / af / n_dec as f32, 0.0);
        }
    }

    window_response(m_dec, &mut response, kaiser_beta);
    response
}

/// Sum of squared response magnitudes, scaled to undo the FFT/IFFT
/// round-trip's 1/N amplitude scaling and the extra 1/sqrt(2) amplitude
/// split used for real/cross-conjugate outputs. Mirrors `noise_gain()`.
pub fn noise_gain(response: &[Complex32], halve_for_isb: bool) -> f32 {
    let n_dec = response.len() as f32;
    let sum: f32 = response.iter().map(|c| c.norm_sqr()).sum();
    if halve_for_isb {
        2.0 * n_dec * sum
    } else {
        n_dec * sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kaiser_window_is_symmetric_and_unity_at_endpoints_for_beta_zero() {
        let window = kaiser_window(9, 0.0);
        assert_eq!(window.len(), 9);
        for i in 0..9 {
            assert!((window[i] - window[8 - i]).abs() < 1e-5);
        }
        assert!((window[4] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn passband_mask_is_nonzero_only_inside_edges() {
        let response = design_response(64, 17, 8000.0, 100.0, 2000.0, 3.0, false);
        assert_eq!(response.len(), 64);
        assert!(response.iter().any(|c| c.norm() > 0.0));
    }

    #[test]
    fn noise_gain_is_positive_for_nontrivial_passband() {
        let response = design_response(64, 17, 8000.0, 100.0, 2000.0, 3.0, false);
        let gain = noise_gain(&response, false);
        assert!(gain > 0.0);
        assert!(gain.is_finite());
    }
}
