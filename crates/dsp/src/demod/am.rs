//! AM envelope demodulator (spec.md §4.4). Grounded in
//! `original_source/am.c`'s `demod_am` thread.

use crate::filter::FilterSlave;

use super::agc::{Agc, AgcParams};
use super::AudioSink;

/// Smoothing coefficient for the carrier DC-removal filter, matching
/// `original_source/am.c`'s `DC_filter_coeff`.
const DC_FILTER_COEFF: f32 = 0.0001;

pub struct AmDemodulator {
    filter: FilterSlave,
    agc: Agc,
    dc_filter: f32,
    bb_power: f32,
}

impl AmDemodulator {
    pub fn new(filter: FilterSlave, agc_params: AgcParams, sample_time_s: f32) -> Self {
        Self {
            filter,
            agc: Agc::new(agc_params, sample_time_s),
            dc_filter: 0.0,
            bb_power: 0.0,
        }
    }

    pub fn baseband_power(&self) -> f32 {
        self.bb_power
    }

    pub fn agc_gain(&self) -> f32 {
        self.agc.gain()
    }
}

impl super::Demodulator for AmDemodulator {
    fn snapshot(&self) -> super::DemodSnapshot {
        super::DemodSnapshot {
            baseband_power: self.bb_power,
            gain: self.agc.gain(),
            ..Default::default()
        }
    }

    fn run_once(&mut self, sink: &mut dyn AudioSink) {
        let block = self.filter.next_block();
        let mut samples = Vec::with_capacity(block.len());
        let mut signal = 0.0f32;

        for sample in &block {
            let sampsq = sample.norm_sqr();
            signal += sampsq;
            let envelope = sampsq.sqrt();

            self.dc_filter += DC_FILTER_COEFF * (envelope - self.dc_filter);
            samples.push(self.agc.apply(envelope - self.dc_filter, self.dc_filter));
        }

        self.bb_power = signal / (2.0 * block.len() as f32);
        sink.write(&samples, 1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::filter::{FilterMaster, OutputType};
    use crate::Complex32;

    struct VecSink(Vec<f32>);
    impl AudioSink for VecSink {
        fn write(&mut self, samples: &[f32], _channels: u16) {
            self.0.extend_from_slice(samples);
        }
    }

    #[test]
    fn envelope_of_constant_carrier_settles_near_zero_after_dc_removal() {
        use super::super::Demodulator;

        let master = Arc::new(FilterMaster::new(64, 17));
        let filter = FilterSlave::new(master.clone(), 1, OutputType::Complex);
        filter.set_filter(8000.0, -4000.0, 4000.0, 3.0);

        let mut demod = AmDemodulator::new(filter, AgcParams::default(), 1.0 / 8000.0);
        let mut sink = VecSink(Vec::new());

        for _ in 0..50 {
            master.write_block(&vec![Complex32::new(1.0, 0.0); 64]);
            demod.run_once(&mut sink);
        }

        let tail_avg: f32 = sink.0[sink.0.len() - 64..].iter().map(|s| s.abs()).sum::<f32>() / 64.0;
        assert!(tail_avg < 0.5, "tail_avg={tail_avg}");
    }
}
