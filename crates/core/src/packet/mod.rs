//! Minimal RTP/RTCP packet helpers (RFC 3550).
//!
//! The session engine never looks inside media payloads. It needs just
//! enough of the packet layout to:
//!
//! - tell the two packet families on a negotiated transport apart
//!   ([`PacketKind`]),
//! - stamp outgoing media with an RTP fixed header ([`rtp::RtpHeader`]),
//! - read the sender SSRC of inbound control reports and answer them
//!   with a sender report, and say goodbye with a BYE ([`rtcp`]).

pub mod rtcp;
pub mod rtp;

/// Logical channel of a packet on a negotiated transport.
///
/// Interleaved transports map an even/odd channel pair to
/// `Media`/`Control`; UDP transports use the RTP/RTCP port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// RTP media packets.
    Media,
    /// RTCP control/statistics packets.
    Control,
}
