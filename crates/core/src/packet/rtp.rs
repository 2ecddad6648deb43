/// RTP fixed header writer (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Keeps the wrapping sequence number and the media clock for one stream.
/// Version is always 2. Padding, extension, and CSRC count are always 0.
#[derive(Debug)]
pub struct RtpHeader {
    /// RTP payload type (7-bit, RFC 3551).
    pub pt: u8,
    /// Synchronization source identifier (RFC 3550 §8.1).
    pub ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

/// Length of the fixed header.
pub const HEADER_LEN: usize = 12;

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self {
            pt,
            ssrc,
            sequence: 0,
            timestamp: 0,
        }
    }

    /// Sequence number the next [`write`](Self::write) will use.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Serialize a 12-byte fixed header and advance the sequence number.
    pub fn write(&mut self, marker: bool) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0] = 2 << 6;
        header[1] = ((marker as u8) << 7) | (self.pt & 0x7f);
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }

    /// Header followed by `payload`, as one packet.
    pub fn packet(&mut self, marker: bool, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.extend_from_slice(&self.write(marker));
        packet.extend_from_slice(payload);
        packet
    }

    /// Advance the media clock, e.g. by `90000 / fps` per video frame.
    pub fn advance_timestamp(&mut self, increment: u32) {
        self.timestamp = self.timestamp.wrapping_add(increment);
    }
}

/// SSRC of an RTP packet, if `packet` is long enough and version 2.
pub fn ssrc(packet: &[u8]) -> Option<u32> {
    if packet.len() < HEADER_LEN || packet[0] >> 6 != 2 {
        return None;
    }
    Some(u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header() -> RtpHeader {
        RtpHeader::new(96, 0xAABBCCDD)
    }

    #[test]
    fn version_and_payload_type() {
        let mut h = make_header();
        let buf = h.write(false);
        assert_eq!(buf[0] >> 6, 2);
        assert_eq!(buf[1] & 0x7f, 96);
    }

    #[test]
    fn marker_bit() {
        let mut h = make_header();
        assert_eq!(h.write(false)[1] & 0x80, 0);
        assert_eq!(h.write(true)[1] & 0x80, 0x80);
    }

    #[test]
    fn sequence_wraps() {
        let mut h = make_header();
        h.sequence = u16::MAX;
        let buf = h.write(false);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), u16::MAX);
        assert_eq!(h.sequence(), 0);
    }

    #[test]
    fn packet_carries_ssrc_and_payload() {
        let mut h = make_header();
        h.advance_timestamp(3000);
        let packet = h.packet(true, b"frame");
        assert_eq!(ssrc(&packet), Some(0xAABBCCDD));
        assert_eq!(&packet[4..8], &3000u32.to_be_bytes());
        assert_eq!(&packet[HEADER_LEN..], b"frame");
    }

    #[test]
    fn ssrc_rejects_short_packets() {
        assert_eq!(ssrc(&[0x80, 96, 0, 1]), None);
    }
}
