//! The legacy 24-byte front-end status structure (spec.md §6: "a legacy
//! 24-byte fixed status header may follow the RTP header"; "Tuner
//! commands: ... payload is a 24-byte little-endian status structure").
//! Grounded in `original_source/sdr.h`'s `struct status` /
//! `ntoh_status`/`hton_status`, which this receiver both reads (as the
//! optional header riding behind an RTP I/Q packet) and writes (as the
//! tuner command payload sent to the input group's port+1).

/// Sentinel gain byte meaning "leave this gain stage unchanged" (spec.md
/// §6: "setting a gain byte to 0xFF means don't change").
pub const GAIN_NO_CHANGE: u8 = 0xff;

const LEN: usize = 24;

/// One front-end status/command record: nanosecond GPS-epoch timestamp,
/// tuner frequency in Hz, sample rate in Hz, and the three analog gain
/// bytes. The wire layout is little-endian throughout, matching
/// `original_source/sdr.h`'s unguarded pointer casts on a little-endian
/// host.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrontEndWire {
    pub timestamp_ns: i64,
    pub frequency_hz: f64,
    pub sample_rate_hz: u32,
    pub lna_gain: u8,
    pub mixer_gain: u8,
    pub if_gain: u8,
}

impl FrontEndWire {
    pub fn to_bytes(&self) -> [u8; LEN] {
        let mut buf = [0u8; LEN];
        buf[0..8].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        buf[8..16].copy_from_slice(&self.frequency_hz.to_le_bytes());
        buf[16..20].copy_from_slice(&self.sample_rate_hz.to_le_bytes());
        buf[20] = self.lna_gain;
        buf[21] = self.mixer_gain;
        buf[22] = self.if_gain;
        buf[23] = 0; // unused, padding to 24 bytes
        buf
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < LEN {
            return None;
        }
        Some(Self {
            timestamp_ns: i64::from_le_bytes(buf[0..8].try_into().ok()?),
            frequency_hz: f64::from_le_bytes(buf[8..16].try_into().ok()?),
            sample_rate_hz: u32::from_le_bytes(buf[16..20].try_into().ok()?),
            lna_gain: buf[20],
            mixer_gain: buf[21],
            if_gain: buf[22],
        })
    }
}

/// Builds a tuner-command payload that asks for `frequency_hz` and leaves
/// every gain stage unchanged (spec.md §6). Callers that do want to
/// change a gain stage should construct `FrontEndWire` directly.
pub fn retune_command(frequency_hz: f64) -> [u8; LEN] {
    FrontEndWire {
        timestamp_ns: 0,
        frequency_hz,
        sample_rate_hz: 0,
        lna_gain: GAIN_NO_CHANGE,
        mixer_gain: GAIN_NO_CHANGE,
        if_gain: GAIN_NO_CHANGE,
    }
    .to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let status = FrontEndWire {
            timestamp_ns: 123_456_789,
            frequency_hz: 146_520_000.0,
            sample_rate_hz: 192_000,
            lna_gain: 10,
            mixer_gain: 20,
            if_gain: 5,
        };
        let bytes = status.to_bytes();
        assert_eq!(FrontEndWire::parse(&bytes), Some(status));
    }

    #[test]
    fn retune_command_leaves_gains_unchanged() {
        let bytes = retune_command(14_250_000.0);
        let parsed = FrontEndWire::parse(&bytes).unwrap();
        assert_eq!(parsed.frequency_hz, 14_250_000.0);
        assert_eq!(parsed.lna_gain, GAIN_NO_CHANGE);
        assert_eq!(parsed.mixer_gain, GAIN_NO_CHANGE);
        assert_eq!(parsed.if_gain, GAIN_NO_CHANGE);
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(FrontEndWire::parse(&[0u8; 10]).is_none());
    }
}
