//! Front-end correction, oscillators, the fast-convolution filter and the
//! three demodulator subsystems for `radiod`.

pub mod correction;
pub mod demod;
pub mod fft;
pub mod filter;
pub mod frontend;
pub mod osc;
pub mod processor;

/// A single-precision complex sample, the pipeline's native sample type.
pub type Complex32 = num_complex::Complex<f32>;
