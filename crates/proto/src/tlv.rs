//! Status/command TLV protocol (spec.md §4.8): a compact
//! type/length/value encoding used for both the periodic status stream
//! and the inbound command stream, plus a per-type delta cache so only
//! changed fields are retransmitted.
//!
//! Wire shape: one command/response byte (0 = response, 1 = command),
//! then a sequence of `{type: 1, length: 1, value: length}` records
//! terminated by a single type byte of `EOL` (0). Integers are big-endian
//! with leading zero bytes suppressed; floats/doubles are encoded as their
//! IEEE-754 bit pattern through the same integer path; strings are raw
//! bytes with a length byte; addresses carry a leading length byte (6 for
//! an IPv4 address+port, 10 for the IPv6 v4-mapped form).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use ahash::AHashMap;

/// Field tags, matching the original deployment's `status_type` ordering.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Eol = 0,
    GpsTime,
    Commands,
    InputSourceSocket,
    InputDestSocket,
    InputSsrc,
    InputSamprate,
    InputPackets,
    InputSamples,
    InputDrops,
    InputDupes,
    OutputDestSocket,
    OutputSsrc,
    OutputTtl,
    OutputSamprate,
    OutputPackets,
    RadioFrequency,
    FirstLoFrequency,
    SecondLoFrequency,
    ShiftFrequency,
    DopplerFrequency,
    DopplerFrequencyRate,
    LnaGain,
    MixerGain,
    IfGain,
    DcIOffset,
    DcQOffset,
    IqImbalance,
    IqPhase,
    LowEdge,
    HighEdge,
    KaiserBeta,
    FilterBlocksize,
    FilterFirLength,
    NoiseBandwidth,
    IfPower,
    BasebandPower,
    NoiseDensity,
    RadioMode,
    DemodMode,
    IndependentSideband,
    DemodSnr,
    DemodGain,
    FreqOffset,
    PeakDeviation,
    PlTone,
    PllLock,
    PllSquare,
    PllPhase,
    OutputChannels,
}

impl Tag {
    fn from_u8(v: u8) -> Option<Tag> {
        use Tag::*;
        const TABLE: &[Tag] = &[
            Eol,
            GpsTime,
            Commands,
            InputSourceSocket,
            InputDestSocket,
            InputSsrc,
            InputSamprate,
            InputPackets,
            InputSamples,
            InputDrops,
            InputDupes,
            OutputDestSocket,
            OutputSsrc,
            OutputTtl,
            OutputSamprate,
            OutputPackets,
            RadioFrequency,
            FirstLoFrequency,
            SecondLoFrequency,
            ShiftFrequency,
            DopplerFrequency,
            DopplerFrequencyRate,
            LnaGain,
            MixerGain,
            IfGain,
            DcIOffset,
            DcQOffset,
            IqImbalance,
            IqPhase,
            LowEdge,
            HighEdge,
            KaiserBeta,
            FilterBlocksize,
            FilterFirLength,
            NoiseBandwidth,
            IfPower,
            BasebandPower,
            NoiseDensity,
            RadioMode,
            DemodMode,
            IndependentSideband,
            DemodSnr,
            DemodGain,
            FreqOffset,
            PeakDeviation,
            PlTone,
            PllLock,
            PllSquare,
            PllPhase,
            OutputChannels,
        ];
        TABLE.get(v as usize).copied()
    }
}

/// A decoded TLV value. The encoder always picks the narrowest integer
/// encoding that holds the value (leading zero bytes suppressed); the
/// decoder widens back out to `u64`/`f64` regardless of how many bytes
/// were on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Int(u64),
    Float(f32),
    Double(f64),
    Str(String),
    Addr(SocketAddr),
}

/// One parsed `command/response, {type,len,value}*, EOL` message.
pub struct Message {
    pub is_command: bool,
    pub fields: Vec<(Tag, Value)>,
}

/// Appends a big-endian integer with leading zero bytes suppressed (but at
/// least one byte emitted for zero itself).
fn push_int(buf: &mut Vec<u8>, tag: Tag, value: u64) {
    let bytes = value.to_be_bytes();
    let first_nonzero = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
    let trimmed = &bytes[first_nonzero..];
    buf.push(tag as u8);
    buf.push(trimmed.len() as u8);
    buf.extend_from_slice(trimmed);
}

fn push_bytes(buf: &mut Vec<u8>, tag: Tag, bytes: &[u8]) {
    buf.push(tag as u8);
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
}

fn push_addr(buf: &mut Vec<u8>, tag: Tag, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            let mut payload = Vec::with_capacity(6);
            payload.extend_from_slice(&v4.ip().octets());
            payload.extend_from_slice(&v4.port().to_be_bytes());
            push_bytes(buf, tag, &payload);
        }
        SocketAddr::V6(v6) => {
            // v4-mapped form: 10 bytes, matching the original wire format.
            let mut payload = Vec::with_capacity(10);
            payload.extend_from_slice(&v6.ip().octets()[6..]);
            payload.extend_from_slice(&v6.port().to_be_bytes());
            push_bytes(buf, tag, &payload);
        }
    }
}

/// Encodes one TLV value for `tag` and appends it to `buf`.
pub fn encode_field(buf: &mut Vec<u8>, tag: Tag, value: &Value) {
    match value {
        Value::Byte(b) => push_int(buf, tag, *b as u64),
        Value::Int(v) => push_int(buf, tag, *v),
        Value::Float(f) => push_int(buf, tag, f.to_bits() as u64),
        Value::Double(d) => push_int(buf, tag, d.to_bits()),
        Value::Str(s) => push_bytes(buf, tag, s.as_bytes()),
        Value::Addr(addr) => push_addr(buf, tag, *addr),
    }
}

/// Encodes a full message: command/response byte, fields, EOL.
pub fn encode_message(is_command: bool, fields: &[(Tag, Value)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + fields.len() * 6);
    buf.push(is_command as u8);
    for (tag, value) in fields {
        encode_field(&mut buf, *tag, value);
    }
    buf.push(Tag::Eol as u8);
    buf
}

fn decode_int(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for &b in bytes {
        value = (value << 8) | b as u64;
    }
    value
}

fn decode_addr(bytes: &[u8]) -> Option<SocketAddr> {
    match bytes.len() {
        6 => {
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        10 => {
            let mut octets = [0u8; 16];
            octets[10] = 0xff;
            octets[11] = 0xff;
            octets[12..16].copy_from_slice(&bytes[0..4]);
            let port = u16::from_be_bytes([bytes[8], bytes[9]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

/// Decodes a raw TLV value as whichever scalar kind the caller expects to
/// find at this tag. Strings and addresses are distinguished from integers
/// by tag semantics known to the caller, not by the wire encoding itself
/// (the original protocol has no in-band type discriminant beyond length).
fn decode_as(bytes: &[u8], tag: Tag) -> Value {
    match tag {
        Tag::RadioMode => Value::Str(String::from_utf8_lossy(bytes).into_owned()),
        Tag::InputSourceSocket | Tag::InputDestSocket | Tag::OutputDestSocket => {
            decode_addr(bytes).map(Value::Addr).unwrap_or(Value::Int(decode_int(bytes)))
        }
        Tag::KaiserBeta | Tag::LowEdge | Tag::HighEdge | Tag::NoiseBandwidth | Tag::IfPower
        | Tag::BasebandPower | Tag::NoiseDensity | Tag::DemodSnr | Tag::DemodGain
        | Tag::FreqOffset | Tag::PeakDeviation | Tag::PlTone | Tag::PllPhase
        | Tag::IqImbalance | Tag::IqPhase | Tag::DcIOffset | Tag::DcQOffset => {
            if bytes.len() <= 4 {
                Value::Float(f32::from_bits(decode_int(bytes) as u32))
            } else {
                Value::Double(f64::from_bits(decode_int(bytes)))
            }
        }
        _ => {
            if bytes.len() <= 1 {
                Value::Byte(bytes.first().copied().unwrap_or(0))
            } else {
                Value::Int(decode_int(bytes))
            }
        }
    }
}

/// Parses a full message. Malformed or truncated records are skipped and
/// the remainder of the packet is processed (spec.md §7); an unrecognized
/// type byte also terminates the scan at the nearest `EOL`-shaped
/// boundary it can find, since there is no way to know its length
/// semantics.
pub fn decode_message(buf: &[u8]) -> Option<Message> {
    let (&cmd_byte, mut rest) = buf.split_first()?;
    let is_command = cmd_byte != 0;
    let mut fields = Vec::new();

    loop {
        let (&type_byte, after_type) = rest.split_first()?;
        if type_byte == Tag::Eol as u8 {
            break;
        }

        let Some(tag) = Tag::from_u8(type_byte) else {
            // Unknown type: we cannot know its length, so we cannot safely
            // resynchronize. Stop parsing but keep what we already decoded.
            break;
        };

        let Some((&len_byte, after_len)) = after_type.split_first() else {
            break;
        };
        let len = len_byte as usize;
        if after_len.len() < len {
            break;
        }

        let value_bytes = &after_len[..len];
        fields.push((tag, decode_as(value_bytes, tag)));
        rest = &after_len[len..];
    }

    Some(Message { is_command, fields })
}

/// Per-type cache of the last transmitted raw value, used to suppress
/// unchanged fields between publications (spec.md §4.8).
#[derive(Default)]
pub struct DeltaCache {
    last: AHashMap<Tag, Vec<u8>>,
    ticks: u32,
}

/// Number of publications between forced full (non-delta) frames.
const FULL_FRAME_PERIOD: u32 = 10;

impl DeltaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes `fields` against the cache: on the `FULL_FRAME_PERIOD`th
    /// call every field is emitted regardless of change; otherwise a field
    /// is omitted if its raw encoding is byte-for-byte identical to the
    /// last transmission.
    pub fn encode(&mut self, fields: &[(Tag, Value)]) -> Vec<u8> {
        let force_full = self.ticks % FULL_FRAME_PERIOD == 0;
        self.ticks = self.ticks.wrapping_add(1);

        let mut buf = Vec::with_capacity(16 + fields.len() * 6);
        buf.push(0u8); // response

        for (tag, value) in fields {
            let mut encoded = Vec::new();
            encode_field(&mut encoded, *tag, value);
            let raw_value = &encoded[2..];

            let changed = force_full
                || self
                    .last
                    .get(tag)
                    .map(|prev| prev.as_slice() != raw_value)
                    .unwrap_or(true);

            if changed {
                buf.extend_from_slice(&encoded);
                self.last.insert(*tag, raw_value.to_vec());
            }
        }

        buf.push(Tag::Eol as u8);
        buf
    }
}

/// Commands recognized on the inbound command stream (spec.md §4.8,
/// "recognized commands set receiver frequency, filter edges, gain
/// parameters, demodulator mode, Kaiser β, ISB/PLL/square/flat options,
/// and channel count"). Unrecognized TLV types are ignored by
/// `decode_message` already; this enum narrows the recognized tags down
/// to the ones the receiver acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetFrequency(f64),
    SetFilterEdges { low: f32, high: f32 },
    SetKaiserBeta(f32),
    SetLnaGain(u8),
    SetMixerGain(u8),
    SetIfGain(u8),
    SetDemodMode(u8),
    SetIndependentSideband(bool),
    SetPllEnabled(bool),
    SetSquareEnabled(bool),
    SetOutputChannels(u8),
}

/// Maps a decoded message's fields to the `Command`s the receiver
/// understands, skipping fields it does not recognize.
pub fn commands_from_message(message: &Message) -> Vec<Command> {
    let mut commands = Vec::new();
    let mut low = None;
    let mut high = None;

    for (tag, value) in &message.fields {
        match (tag, value) {
            (Tag::RadioFrequency, Value::Double(hz)) => commands.push(Command::SetFrequency(*hz)),
            (Tag::RadioFrequency, Value::Float(hz)) => {
                commands.push(Command::SetFrequency(*hz as f64))
            }
            (Tag::RadioFrequency, Value::Int(hz)) => commands.push(Command::SetFrequency(*hz as f64)),
            (Tag::LowEdge, Value::Float(v)) => low = Some(*v),
            (Tag::HighEdge, Value::Float(v)) => high = Some(*v),
            (Tag::KaiserBeta, Value::Float(v)) => commands.push(Command::SetKaiserBeta(*v)),
            (Tag::LnaGain, Value::Byte(v)) => commands.push(Command::SetLnaGain(*v)),
            (Tag::MixerGain, Value::Byte(v)) => commands.push(Command::SetMixerGain(*v)),
            (Tag::IfGain, Value::Byte(v)) => commands.push(Command::SetIfGain(*v)),
            (Tag::DemodMode, Value::Byte(v)) => commands.push(Command::SetDemodMode(*v)),
            (Tag::IndependentSideband, Value::Byte(v)) => {
                commands.push(Command::SetIndependentSideband(*v != 0))
            }
            (Tag::PllSquare, Value::Byte(v)) => commands.push(Command::SetSquareEnabled(*v != 0)),
            (Tag::OutputChannels, Value::Byte(v)) => commands.push(Command::SetOutputChannels(*v)),
            _ => {}
        }
    }

    if let (Some(low), Some(high)) = (low, high) {
        commands.push(Command::SetFilterEdges { low, high });
    }

    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        for value in [
            Value::Byte(7),
            Value::Int(123_456_789),
            Value::Float(3.5),
            Value::Double(-12.25),
            Value::Str("usb".to_string()),
        ] {
            let mut buf = Vec::new();
            encode_field(&mut buf, Tag::DemodGain, &value);
            let len = buf[1] as usize;
            let decoded = match &value {
                Value::Str(_) => Value::Str(String::from_utf8(buf[2..2 + len].to_vec()).unwrap()),
                Value::Byte(_) | Value::Int(_) => {
                    if len <= 1 {
                        Value::Byte(*buf.get(2).unwrap_or(&0))
                    } else {
                        Value::Int(decode_int(&buf[2..2 + len]))
                    }
                }
                Value::Float(_) => Value::Float(f32::from_bits(decode_int(&buf[2..2 + len]) as u32)),
                Value::Double(_) => Value::Double(f64::from_bits(decode_int(&buf[2..2 + len]))),
                Value::Addr(_) => unreachable!(),
            };

            match (&value, &decoded) {
                (Value::Byte(a), Value::Byte(b)) => assert_eq!(a, b),
                (Value::Int(a), Value::Int(b)) => assert_eq!(a, b),
                (Value::Float(a), Value::Float(b)) => assert_eq!(a, b),
                (Value::Double(a), Value::Double(b)) => assert_eq!(a, b),
                (Value::Str(a), Value::Str(b)) => assert_eq!(a, b),
                other => panic!("kind mismatch: {other:?}"),
            }
        }
    }

    #[test]
    fn message_round_trip_and_eol_length() {
        let fields = vec![
            (Tag::RadioFrequency, Value::Double(146e6)),
            (Tag::FilterBlocksize, Value::Int(3840)),
            (Tag::LowEdge, Value::Float(-5000.0)),
            (Tag::HighEdge, Value::Float(5000.0)),
        ];
        let encoded = encode_message(false, &fields);
        let decoded = decode_message(&encoded).unwrap();
        assert!(!decoded.is_command);
        assert_eq!(decoded.fields.len(), fields.len());
        for ((tag, value), (dtag, dvalue)) in fields.iter().zip(decoded.fields.iter()) {
            assert_eq!(tag, dtag);
            assert_eq!(value, dvalue);
        }
    }

    #[test]
    fn unchanged_fields_compact_to_two_bytes() {
        let fields = vec![
            (Tag::RadioFrequency, Value::Double(146e6)),
            (Tag::FilterBlocksize, Value::Int(3840)),
            (Tag::LowEdge, Value::Float(-5000.0)),
            (Tag::HighEdge, Value::Float(5000.0)),
        ];

        let mut cache = DeltaCache::new();
        let _first = cache.encode(&fields);
        let second = cache.encode(&fields);
        assert_eq!(second.len(), 2);
        assert_eq!(second, vec![0u8, Tag::Eol as u8]);
    }

    #[test]
    fn every_tenth_publication_is_full() {
        let fields = vec![(Tag::RadioFrequency, Value::Double(146e6))];
        let mut cache = DeltaCache::new();
        let mut last_full_len = 0;
        for i in 0..10 {
            let frame = cache.encode(&fields);
            if i == 9 {
                last_full_len = frame.len();
            }
        }
        assert!(last_full_len > 2);
    }

    #[test]
    fn truncated_record_is_skipped_without_panic() {
        let mut buf = vec![0u8]; // response, no fields
        buf.push(Tag::RadioFrequency as u8);
        buf.push(200); // claims 200 bytes of value, but none follow
        let decoded = decode_message(&buf).unwrap();
        assert!(decoded.fields.is_empty());
    }

    #[test]
    fn mode_no_op_preserves_frequency_and_edges() {
        // Setting demod mode to its current value must not itself carry a
        // frequency or filter-edge field, so commands_from_message should
        // not synthesize spurious SetFrequency/SetFilterEdges calls.
        let message = Message {
            is_command: true,
            fields: vec![(Tag::DemodMode, Value::Byte(1))],
        };
        let commands = commands_from_message(&message);
        assert_eq!(commands, vec![Command::SetDemodMode(1)]);
    }
}
