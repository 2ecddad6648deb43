use std::fmt;
use std::str::FromStr;

use crate::error::{ParseErrorKind, Result, RtspError};

/// Default interleaved channel pair assumed when a peer gives neither ports
/// nor channels.
pub const DEFAULT_INTERLEAVED: (u8, u8) = (0, 1);

/// Delivery mode of a negotiated transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CastMode {
    #[default]
    Unicast,
    Multicast,
}

/// Negotiated RTP/RTCP transport parameters (RFC 2326 §12.39).
///
/// Exactly one addressing scheme is in use per negotiated context: either
/// an interleaved channel pair (`RTP/AVP/TCP`) or UDP port pairs.
///
/// ## Wire format example
///
/// ```text
/// Client → Server:
///   Transport: RTP/AVP;unicast;client_port=8000-8001
///
/// Server → Client:
///   Transport: RTP/AVP;unicast;client_port=8000-8001;server_port=5000-5001;ssrc=2864434397
///
/// Client → Server (interleaved):
///   Transport: RTP/AVP/TCP;unicast;interleaved=0-1
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportDescriptor {
    pub mode: CastMode,
    /// `interleaved=rtp-rtcp` channel ids on the control connection.
    pub interleaved: Option<(u8, u8)>,
    /// `client_port=rtp-rtcp`; also carries the group ports for multicast.
    pub client_port: Option<(u16, u16)>,
    /// `server_port=rtp-rtcp`.
    pub server_port: Option<(u16, u16)>,
    /// Synchronization source of the sender.
    pub ssrc: Option<u32>,
    /// Multicast time-to-live.
    pub ttl: Option<u8>,
    pub source: Option<String>,
    pub destination: Option<String>,
    /// `mode="PLAY"` parameter (unquoted here).
    pub play_mode: Option<String>,
}

impl TransportDescriptor {
    /// Unicast UDP request with the client's receive ports.
    pub fn udp(client_rtp: u16, client_rtcp: u16) -> Self {
        Self {
            client_port: Some((client_rtp, client_rtcp)),
            ..Self::default()
        }
    }

    /// Unicast TCP-interleaved request on the given channel pair.
    pub fn interleaved(rtp_channel: u8, rtcp_channel: u8) -> Self {
        Self {
            interleaved: Some((rtp_channel, rtcp_channel)),
            ..Self::default()
        }
    }

    pub fn is_interleaved(&self) -> bool {
        self.interleaved.is_some()
    }

    pub fn is_multicast(&self) -> bool {
        self.mode == CastMode::Multicast
    }

    /// Build the `Transport` header value.
    pub fn build(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        parts.push(if self.is_interleaved() {
            "RTP/AVP/TCP".to_string()
        } else {
            "RTP/AVP".to_string()
        });
        parts.push(match self.mode {
            CastMode::Unicast => "unicast".to_string(),
            CastMode::Multicast => "multicast".to_string(),
        });
        if let Some(destination) = &self.destination {
            parts.push(format!("destination={}", destination));
        }
        if let Some(source) = &self.source {
            parts.push(format!("source={}", source));
        }
        if let Some((rtp, rtcp)) = self.interleaved {
            parts.push(format!("interleaved={}-{}", rtp, rtcp));
        }
        if let Some((rtp, rtcp)) = self.client_port {
            parts.push(format!("client_port={}-{}", rtp, rtcp));
        }
        if let Some((rtp, rtcp)) = self.server_port {
            parts.push(format!("server_port={}-{}", rtp, rtcp));
        }
        if let Some(ssrc) = self.ssrc {
            parts.push(format!("ssrc={}", ssrc));
        }
        if let Some(ttl) = self.ttl {
            parts.push(format!("ttl={}", ttl));
        }
        if let Some(mode) = &self.play_mode {
            parts.push(format!("mode=\"{}\"", mode));
        }

        parts.join(";")
    }

    /// Parse a `Transport` header value.
    ///
    /// Unknown parameters are ignored. Malformed values of known parameters
    /// are an error. A unicast transport that names neither a port pair nor
    /// an interleaved channel pair is taken to be TCP-interleaved on
    /// [`DEFAULT_INTERLEAVED`]: some servers signal interleaving that way,
    /// and a lone `server_port=5000` is not a usable pair.
    ///
    /// ```
    /// use rtsp::session::transport::TransportDescriptor;
    ///
    /// let t = TransportDescriptor::parse("RTP/AVP;unicast;client_port=8000-8001").unwrap();
    /// assert_eq!(t.client_port, Some((8000, 8001)));
    ///
    /// let t = TransportDescriptor::parse("RTP/AVP;unicast;server_port=5000").unwrap();
    /// assert_eq!(t.interleaved, Some((0, 1)));
    /// assert_eq!(t.server_port, None);
    /// ```
    pub fn parse(header: &str) -> Result<Self> {
        if header.trim().is_empty() {
            return Err(invalid());
        }

        let mut transport = TransportDescriptor::default();

        for part in header.split(';') {
            let part = part.trim();
            if part.is_empty() || part.starts_with("RTP/") {
                continue;
            }

            let (key, value) = match part.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (part, ""),
            };

            match key.to_ascii_lowercase().as_str() {
                "unicast" => transport.mode = CastMode::Unicast,
                "multicast" => transport.mode = CastMode::Multicast,
                "interleaved" => {
                    transport.interleaved = match parse_range::<u8>(value)? {
                        (rtp, Some(rtcp)) => Some((rtp, rtcp)),
                        (rtp, None) => Some((rtp, rtp.wrapping_add(1))),
                    }
                }
                "client_port" => transport.client_port = parse_pair(value)?,
                "server_port" => transport.server_port = parse_pair(value)?,
                "ssrc" => transport.ssrc = Some(parse_ssrc(value)?),
                "ttl" => transport.ttl = Some(value.parse().map_err(|_| invalid())?),
                "mode" => transport.play_mode = Some(value.trim_matches('"').to_string()),
                "source" => transport.source = Some(value.to_string()),
                "destination" => transport.destination = Some(value.to_string()),
                other => tracing::trace!(parameter = other, "ignoring transport parameter"),
            }
        }

        if transport.mode == CastMode::Unicast
            && transport.interleaved.is_none()
            && transport.client_port.is_none()
            && transport.server_port.is_none()
        {
            transport.interleaved = Some(DEFAULT_INTERLEAVED);
        }

        Ok(transport)
    }
}

impl fmt::Display for TransportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}

impl FromStr for TransportDescriptor {
    type Err = RtspError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn invalid() -> RtspError {
    RtspError::parse(ParseErrorKind::InvalidTransport)
}

fn parse_range<T: FromStr>(value: &str) -> Result<(T, Option<T>)> {
    match value.split_once('-') {
        Some((first, second)) => Ok((
            first.trim().parse().map_err(|_| invalid())?,
            Some(second.trim().parse().map_err(|_| invalid())?),
        )),
        None => Ok((value.parse().map_err(|_| invalid())?, None)),
    }
}

/// A single port is syntactically valid but is not a pair.
fn parse_pair(value: &str) -> Result<Option<(u16, u16)>> {
    Ok(match parse_range::<u16>(value)? {
        (rtp, Some(rtcp)) => Some((rtp, rtcp)),
        (_, None) => None,
    })
}

/// Decimal first, then hexadecimal (RFC 2326 says hex; many servers send decimal).
fn parse_ssrc(value: &str) -> Result<u32> {
    if let Ok(ssrc) = value.parse::<u32>() {
        return Ok(ssrc);
    }
    let hex = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u32::from_str_radix(hex, 16).map_err(|_| invalid())
}
