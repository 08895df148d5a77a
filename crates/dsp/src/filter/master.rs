//! Overlap-save filter master (input) side (spec.md §4.3). Holds the
//! length-N overlap-save buffer and publishes a new frequency-domain block
//! to its slaves every L input samples.

use parking_lot::{Condvar, Mutex};

use crate::fft::FftPlan;
use crate::Complex32;

struct MasterState {
    /// Length N = L + M - 1 time-domain buffer: the last M-1 samples of
    /// the previous block followed by the current block's L samples.
    buffer: Vec<Complex32>,
    /// Frequency-domain transform of `buffer`, valid after `write_block`.
    fdomain: Vec<Complex32>,
    blocknum: u64,
}

/// The shared input side of a fast-convolution filter: one master feeds
/// any number of [`FilterSlave`](super::slave::FilterSlave)s.
pub struct FilterMaster {
    l: usize,
    m: usize,
    n: usize,
    fft: FftPlan,
    state: Mutex<MasterState>,
    cond: Condvar,
}

impl FilterMaster {
    /// `l` is the input block size, `m` the impulse response length.
    pub fn new(l: usize, m: usize) -> Self {
        let n = l + m - 1;
        Self {
            l,
            m,
            n,
            fft: FftPlan::new(n),
            state: Mutex::new(MasterState {
                buffer: vec![Complex32::new(0.0, 0.0); n],
                fdomain: vec![Complex32::new(0.0, 0.0); n],
                blocknum: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn input_len(&self) -> usize {
        self.l
    }

    pub fn impulse_len(&self) -> usize {
        self.m
    }

    pub fn fft_len(&self) -> usize {
        self.n
    }

    pub fn blocknum(&self) -> u64 {
        self.state.lock().blocknum
    }

    /// Writes one complete block of `l` new samples, performs the
    /// overlap-save shift, runs the forward transform, and wakes any
    /// slave waiting on a new block.
    pub fn write_block(&self, block: &[Complex32]) {
        assert_eq!(block.len(), self.l, "filter master block length mismatch");

        let mut state = self.state.lock();
        let overlap = self.m - 1;
        state.buffer.copy_within(self.l.., 0);
        state.buffer[overlap..].copy_from_slice(block);

        state.fdomain.copy_from_slice(&state.buffer);
        self.fft.forward(&mut state.fdomain);

        state.blocknum += 1;
        self.cond.notify_all();
    }

    /// Blocks until `blocknum()` exceeds `last_seen`, then returns the new
    /// block number together with a copy of its frequency-domain data.
    pub fn wait_for_block(&self, last_seen: u64) -> (u64, Vec<Complex32>) {
        let mut state = self.state.lock();
        self.cond.wait_while(&mut state, |s| s.blocknum == last_seen);
        (state.blocknum, state.fdomain.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_block_increments_sequence_and_keeps_overlap() {
        let master = FilterMaster::new(4, 3);
        assert_eq!(master.fft_len(), 6);
        assert_eq!(master.blocknum(), 0);

        let block = vec![
            Complex32::new(1.0, 0.0),
            Complex32::new(2.0, 0.0),
            Complex32::new(3.0, 0.0),
            Complex32::new(4.0, 0.0),
        ];
        master.write_block(&block);
        assert_eq!(master.blocknum(), 1);

        let (blocknum, fdomain) = master.wait_for_block(0);
        assert_eq!(blocknum, 1);
        assert_eq!(fdomain.len(), 6);
    }
}
