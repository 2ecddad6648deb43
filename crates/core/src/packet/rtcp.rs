use std::time::{SystemTime, UNIX_EPOCH};

/// RTCP packet types (RFC 3550 §12.1).
pub const SENDER_REPORT: u8 = 200;
pub const RECEIVER_REPORT: u8 = 201;
pub const SOURCE_DESCRIPTION: u8 = 202;
pub const GOODBYE: u8 = 203;
pub const APP: u8 = 204;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Common header of the first packet in an RTCP compound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportHeader {
    pub packet_type: u8,
    /// Report/source count (low five bits of the first byte).
    pub count: u8,
    pub sender_ssrc: u32,
}

impl ReportHeader {
    /// Sender and receiver reports carry reception statistics that the
    /// session worker acknowledges.
    pub fn is_report(&self) -> bool {
        matches!(self.packet_type, SENDER_REPORT | RECEIVER_REPORT)
    }

    pub fn is_goodbye(&self) -> bool {
        self.packet_type == GOODBYE
    }
}

/// Parse the common header and sender SSRC of an RTCP packet.
pub fn parse_header(packet: &[u8]) -> Option<ReportHeader> {
    if packet.len() < 8 || packet[0] >> 6 != 2 {
        return None;
    }
    let packet_type = packet[1];
    if !(SENDER_REPORT..=APP).contains(&packet_type) {
        return None;
    }
    Some(ReportHeader {
        packet_type,
        count: packet[0] & 0x1f,
        sender_ssrc: u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]),
    })
}

/// Current wall clock as a 64-bit NTP timestamp.
pub fn ntp_now() -> u64 {
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let seconds = since_unix.as_secs() + NTP_UNIX_OFFSET;
    let fraction = ((since_unix.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (seconds << 32) | fraction
}

/// Sender report without reception blocks (RFC 3550 §6.4.1).
pub fn sender_report(ssrc: u32, ntp: u64, rtp_timestamp: u32, packets: u32, octets: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(28);
    packet.push(2 << 6);
    packet.push(SENDER_REPORT);
    // Length in 32-bit words minus one.
    packet.extend_from_slice(&6u16.to_be_bytes());
    packet.extend_from_slice(&ssrc.to_be_bytes());
    packet.extend_from_slice(&ntp.to_be_bytes());
    packet.extend_from_slice(&rtp_timestamp.to_be_bytes());
    packet.extend_from_slice(&packets.to_be_bytes());
    packet.extend_from_slice(&octets.to_be_bytes());
    packet
}

/// BYE for a single source (RFC 3550 §6.6).
pub fn goodbye(ssrc: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8);
    packet.push((2 << 6) | 1);
    packet.push(GOODBYE);
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet.extend_from_slice(&ssrc.to_be_bytes());
    packet
}

/// Receiver report without reception blocks, as sent by a client that has
/// nothing to report yet.
pub fn empty_receiver_report(ssrc: u32) -> Vec<u8> {
    let mut packet = Vec::with_capacity(8);
    packet.push(2 << 6);
    packet.push(RECEIVER_REPORT);
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet.extend_from_slice(&ssrc.to_be_bytes());
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_report_layout() {
        let sr = sender_report(0x0102_0304, 0x1111_2222_3333_4444, 90_000, 10, 1400);
        assert_eq!(sr.len(), 28);
        assert_eq!(u16::from_be_bytes([sr[2], sr[3]]) as usize, sr.len() / 4 - 1);

        let header = parse_header(&sr).unwrap();
        assert_eq!(header.packet_type, SENDER_REPORT);
        assert_eq!(header.sender_ssrc, 0x0102_0304);
        assert!(header.is_report());
        assert_eq!(&sr[8..16], &0x1111_2222_3333_4444u64.to_be_bytes());
    }

    #[test]
    fn goodbye_layout() {
        let bye = goodbye(42);
        assert_eq!(bye.len(), 8);
        let header = parse_header(&bye).unwrap();
        assert!(header.is_goodbye());
        assert_eq!(header.count, 1);
        assert_eq!(header.sender_ssrc, 42);
    }

    #[test]
    fn rejects_rtp_and_short_packets() {
        // RTP packet with payload type 96 is not RTCP.
        let rtp = [0x80, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        assert_eq!(parse_header(&rtp), None);
        assert_eq!(parse_header(&[0x80, RECEIVER_REPORT]), None);
    }

    #[test]
    fn receiver_report_is_a_report() {
        let rr = empty_receiver_report(7);
        assert!(parse_header(&rr).unwrap().is_report());
    }

    #[test]
    fn ntp_clock_is_after_1900_offset() {
        assert!(ntp_now() >> 32 > NTP_UNIX_OFFSET);
    }
}
