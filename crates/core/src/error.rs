//! Error types for the RTSP session engine.

use std::fmt;

use crate::protocol::{Method, RtspMessage};
use crate::session::SessionState;

/// Errors that can occur in the RTSP session engine.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Transport**: [`Io`](Self::Io), [`Timeout`](Self::Timeout),
///   [`ConnectionClosed`](Self::ConnectionClosed). Never retried inside the
///   crate; retry policy belongs to the caller.
/// - **Protocol**: [`Parse`](Self::Parse), [`Protocol`](Self::Protocol),
///   [`Status`](Self::Status). The connection should be considered unusable.
/// - **Negotiation**: [`Negotiation`](Self::Negotiation), raised only after
///   the UDP to TCP-interleaved fallback has been tried.
/// - **Authentication**: [`Unauthorized`](Self::Unauthorized).
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound),
///   [`SessionNotPlaying`](Self::SessionNotPlaying),
///   [`TransportNotConfigured`](Self::TransportNotConfigured),
///   [`InvalidState`](Self::InvalidState).
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning),
///   [`PortRangeExhausted`](Self::PortRangeExhausted).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No response arrived within the configured read timeout.
    #[error("timed out waiting for the peer")]
    Timeout,

    /// The peer closed the control connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Failed to parse an RTSP message or header (RFC 2326 §6, §7, §12).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// The peer violated the protocol (missing CSeq, sequence mismatch, ...).
    #[error("protocol violation: {description}")]
    Protocol {
        description: String,
        message: Option<Box<RtspMessage>>,
    },

    /// The peer answered with a non-success status code.
    #[error("{method} failed: {status} {reason}")]
    Status {
        method: Method,
        status: u16,
        reason: String,
    },

    /// Transport negotiation failed even after falling back to TCP.
    #[error("transport negotiation failed: {0}")]
    Negotiation(String),

    /// The server requires credentials that were missing or rejected.
    #[error("unauthorized")]
    Unauthorized,

    /// A control method was attempted in a state that does not allow it.
    #[error("{method} not valid in state {state:?}")]
    InvalidState { method: Method, state: SessionState },

    /// The URL is not a usable `rtsp://` URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// No session with the given ID exists in the [`SessionManager`](crate::session::SessionManager).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// SETUP has not been completed for this session.
    #[error("transport not configured for session: {0}")]
    TransportNotConfigured(String),

    /// Attempted to send media to a session that is not in the Playing state.
    #[error("session not in playing state: {0}")]
    SessionNotPlaying(String),

    /// [`Server::start`](crate::Server::start) has not been called yet.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Server-side UDP port allocation found no free pair in 5000–65534.
    #[error("port range exhausted (no free RTP/RTCP pair)")]
    PortRangeExhausted,
}

impl RtspError {
    pub(crate) fn parse(kind: ParseErrorKind) -> Self {
        RtspError::Parse { kind }
    }

    pub(crate) fn protocol(description: impl Into<String>, message: Option<RtspMessage>) -> Self {
        RtspError::Protocol {
            description: description.into(),
            message: message.map(Box::new),
        }
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty (no start line).
    EmptyMessage,
    /// Start line was neither `Method URI Version` nor `Version Status Reason`.
    InvalidStartLine,
    /// Version was not of the form `RTSP/<major>.<minor>`.
    InvalidVersion,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was not a number or exceeded the body limit.
    InvalidContentLength,
    /// The header block grew past the limit without a terminating blank line.
    HeaderTooLarge,
    /// A `Transport` header could not be parsed.
    InvalidTransport,
    /// An interleaved payload does not fit the 16-bit length field.
    PayloadTooLarge,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::InvalidStartLine => write!(f, "invalid start line"),
            Self::InvalidVersion => write!(f, "invalid protocol version"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid Content-Length"),
            Self::HeaderTooLarge => write!(f, "header block too large"),
            Self::InvalidTransport => write!(f, "invalid Transport header"),
            Self::PayloadTooLarge => write!(f, "interleaved payload too large"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
