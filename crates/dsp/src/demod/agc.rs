//! Manual/automatic gain control shared by the AM and Linear demodulators
//! (spec.md §4.4, §4.6). Grounded in `original_source/am.c`'s AGC loop and
//! `original_source/radio.h`'s `agc` field group.

/// `10^(db/20)`, converting a decibel value to a linear voltage ratio.
pub fn db_to_voltage(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

#[derive(Debug, Clone, Copy)]
pub struct AgcParams {
    /// Linear-voltage headroom below full scale the AGC holds the peak to.
    pub headroom: f32,
    pub hangtime_s: f32,
    /// dB/s, must be positive.
    pub recovery_rate_db_s: f32,
}

impl Default for AgcParams {
    /// -15 dB headroom, 1.1 s hang, 20 dB/s recovery: typical manual-AGC
    /// operating defaults for this class of receiver (no bundled default
    /// mode table ships the exact production values, so these are
    /// reasonable stand-ins rather than values lifted verbatim).
    fn default() -> Self {
        Self {
            headroom: db_to_voltage(-15.0),
            hangtime_s: 1.1,
            recovery_rate_db_s: 20.0,
        }
    }
}

/// Per-sample manual AGC: spec.md §4.4/§9's resolved open question treats
/// an uninitialized (NaN or non-positive) gain as equivalent to 80 dB, and
/// preserves the overshoot clamp that snaps gain down whenever the
/// smoothed peak estimate would exceed headroom.
pub struct Agc {
    params: AgcParams,
    gain: f32,
    hangcount: u32,
    hangmax: u32,
    recovery_factor: f32,
}

impl Agc {
    pub fn new(params: AgcParams, sample_time_s: f32) -> Self {
        let hangmax = (params.hangtime_s / sample_time_s).round().max(0.0) as u32;
        let recovery_factor = db_to_voltage(params.recovery_rate_db_s * sample_time_s);
        Self {
            params,
            gain: db_to_voltage(80.0),
            hangcount: 0,
            hangmax,
            recovery_factor,
        }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Applies the current gain to `magnitude` (the DC/carrier-removed
    /// envelope or complex magnitude) and updates gain state from the
    /// smoothed peak estimate `peak`.
    pub fn apply(&mut self, value: f32, peak: f32) -> f32 {
        if !self.gain.is_finite() || self.gain <= 0.0 {
            self.gain = self.params.headroom / peak.max(f32::MIN_POSITIVE);
        } else if self.gain * peak > self.params.headroom {
            self.gain = self.params.headroom / peak.max(f32::MIN_POSITIVE);
            self.hangcount = self.hangmax;
        } else if self.hangcount != 0 {
            self.hangcount -= 1;
        } else {
            self.gain *= self.recovery_factor;
        }
        value * self.gain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_clamps_down_when_peak_would_overshoot_headroom() {
        let params = AgcParams::default();
        let mut agc = Agc::new(params, 1.0 / 48_000.0);
        let out = agc.apply(1.0, 1.0);
        assert!(out.is_finite());
        assert!(agc.gain() * 1.0 <= params.headroom * 1.0001);
    }

    #[test]
    fn gain_recovers_slowly_once_hang_expires() {
        let params = AgcParams {
            headroom: db_to_voltage(-15.0),
            hangtime_s: 0.0,
            recovery_rate_db_s: 20.0,
        };
        let mut agc = Agc::new(params, 1.0 / 48_000.0);
        agc.apply(1.0, 1.0);
        let gain_before = agc.gain();
        agc.apply(0.01, 0.01);
        assert!(agc.gain() >= gain_before);
    }
}
