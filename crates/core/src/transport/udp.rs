use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::{Result, RtspError};

const EPHEMERAL_ATTEMPTS: usize = 32;

/// A bound RTP/RTCP socket pair (RFC 3550 §11: RTP on an even port,
/// RTCP on the next odd port).
///
/// Each negotiated UDP transport owns its own pair; dropping it closes
/// both sockets.
#[derive(Debug)]
pub struct UdpPair {
    pub rtp: UdpSocket,
    pub rtcp: UdpSocket,
}

impl UdpPair {
    /// Bind `rtp_port` and `rtp_port + 1` on `ip`.
    pub fn bind(ip: IpAddr, rtp_port: u16) -> io::Result<Self> {
        let rtcp_port = rtp_port
            .checked_add(1)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no port after 65535"))?;
        let rtp = UdpSocket::bind(SocketAddr::new(ip, rtp_port))?;
        let rtcp = UdpSocket::bind(SocketAddr::new(ip, rtcp_port))?;
        Ok(Self { rtp, rtcp })
    }

    /// Bind an OS-chosen even port and its successor.
    pub fn bind_ephemeral(ip: IpAddr) -> Result<Self> {
        for _ in 0..EPHEMERAL_ATTEMPTS {
            let rtp = UdpSocket::bind(SocketAddr::new(ip, 0))?;
            let port = rtp.local_addr()?.port();
            if port % 2 != 0 || port == u16::MAX {
                continue;
            }
            let rtcp = match UdpSocket::bind(SocketAddr::new(ip, port + 1)) {
                Ok(socket) => socket,
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(e.into()),
            };
            return Ok(Self { rtp, rtcp });
        }
        Err(RtspError::PortRangeExhausted)
    }

    /// `(rtp, rtcp)` local ports.
    pub fn ports(&self) -> Result<(u16, u16)> {
        Ok((self.rtp.local_addr()?.port(), self.rtcp.local_addr()?.port()))
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.rtp.set_read_timeout(timeout)?;
        self.rtcp.set_read_timeout(timeout)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn ephemeral_pair_is_even_odd() {
        let pair = UdpPair::bind_ephemeral(IpAddr::V4(Ipv4Addr::LOCALHOST)).unwrap();
        let (rtp, rtcp) = pair.ports().unwrap();
        assert_eq!(rtp % 2, 0);
        assert_eq!(rtcp, rtp + 1);
    }

    #[test]
    fn bind_rejects_last_port() {
        assert!(UdpPair::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), u16::MAX).is_err());
    }
}
