//! Wire protocols for `radiod`: RTP framing and the packet queue, RTCP
//! sender reports, the status/command TLV codec, and the legacy
//! key/value persistent state file.

pub mod frontend_status;
pub mod pcm;
pub mod rtcp;
pub mod rtp;
pub mod state_file;
pub mod tlv;

pub use rtp::{Packet, PacketQueue, RtpHeader, RtpSession};
