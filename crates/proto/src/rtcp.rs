//! RTCP sender-report + SDES compound packet encoding (spec.md §4.9).
//!
//! Only the encode side is implemented: `radiod` originates reports, it
//! never needs to parse ones it receives. Wire layout matches RFC 3550
//! §6.4.1 (SR) and §6.5 (SDES).

use bytes::{BufMut, BytesMut};

const RTCP_VERSION: u8 = 2;
const PT_SR: u8 = 200;
const PT_SDES: u8 = 202;
const SDES_CNAME: u8 = 1;
const SDES_NAME: u8 = 2;
const SDES_EMAIL: u8 = 3;
const SDES_TOOL: u8 = 8;

/// Sender-report payload: NTP wallclock time, the corresponding RTP
/// timestamp, and the sender's cumulative packet/octet counts.
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_time: u64,
    pub rtp_time: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderReport {
    fn write(&self, buf: &mut BytesMut) {
        let header_byte = (RTCP_VERSION << 6) | 0 /* RC = 0, no reception reports */;
        buf.put_u8(header_byte);
        buf.put_u8(PT_SR);
        buf.put_u16((6 - 1) as u16); // length in 32-bit words minus one
        buf.put_u32(self.ssrc);
        buf.put_u64(self.ntp_time);
        buf.put_u32(self.rtp_time);
        buf.put_u32(self.packet_count);
        buf.put_u32(self.octet_count);
    }
}

/// A source-description chunk's textual items.
#[derive(Default, Clone)]
pub struct SourceDescription {
    pub cname: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub tool: Option<String>,
}

impl SourceDescription {
    fn write(&self, ssrc: u32, buf: &mut BytesMut) {
        let start = buf.len();
        buf.put_u8(0); // placeholder for header byte (version/padding/SC)
        buf.put_u8(PT_SDES);
        buf.put_u16(0); // placeholder for length

        let body_start = buf.len();
        buf.put_u32(ssrc);

        write_item(buf, SDES_CNAME, &self.cname);
        if let Some(name) = &self.name {
            write_item(buf, SDES_NAME, name);
        }
        if let Some(email) = &self.email {
            write_item(buf, SDES_EMAIL, email);
        }
        if let Some(tool) = &self.tool {
            write_item(buf, SDES_TOOL, tool);
        }
        buf.put_u8(0); // item-list terminator

        while (buf.len() - body_start) % 4 != 0 {
            buf.put_u8(0);
        }

        let words = ((buf.len() - body_start) / 4) as u16;
        buf[start] = (RTCP_VERSION << 6) | 1 /* SC = 1 */;
        buf[start + 2..start + 4].copy_from_slice(&(words).to_be_bytes());
    }
}

fn write_item(buf: &mut BytesMut, kind: u8, text: &str) {
    let bytes = text.as_bytes();
    let len = bytes.len().min(255) as u8;
    buf.put_u8(kind);
    buf.put_u8(len);
    buf.put_slice(&bytes[..len as usize]);
}

/// Encodes the compound SR+SDES packet emitted once per second.
pub fn encode_compound(sr: &SenderReport, sdes: &SourceDescription) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(128);
    sr.write(&mut buf);
    sdes.write(sr.ssrc, &mut buf);
    buf.to_vec()
}

/// Converts a `SystemTime`-derived `(secs, nanos)` pair since the NTP epoch
/// (1900-01-01) into a 64-bit fixed-point NTP timestamp.
pub fn ntp_timestamp(secs_since_1900: u64, nanos: u32) -> u64 {
    let frac = ((nanos as u64) << 32) / 1_000_000_000;
    (secs_since_1900 << 32) | frac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sr_header_fields_are_well_formed() {
        let sr = SenderReport {
            ssrc: 0x1234_5678,
            ntp_time: 0xdead_beef_0000_0001,
            rtp_time: 48000,
            packet_count: 10,
            octet_count: 2000,
        };
        let sdes = SourceDescription {
            cname: "radiod@host".into(),
            name: Some("radiod".into()),
            email: None,
            tool: Some("radiod/0.1".into()),
        };
        let packet = encode_compound(&sr, &sdes);

        assert_eq!(packet[0] >> 6, RTCP_VERSION);
        assert_eq!(packet[1], PT_SR);
        let sr_words = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        let sr_len = (sr_words + 1) * 4;
        assert_eq!(&packet[4..8], &sr.ssrc.to_be_bytes());

        let sdes_off = sr_len;
        assert_eq!(packet[sdes_off] >> 6, RTCP_VERSION);
        assert_eq!(packet[sdes_off] & 0x1f, 1);
        assert_eq!(packet[sdes_off + 1], PT_SDES);
    }

    #[test]
    fn ntp_timestamp_packs_fraction() {
        let ts = ntp_timestamp(1, 500_000_000);
        assert_eq!(ts >> 32, 1);
        assert!((ts & 0xffff_ffff) > 0);
    }
}
