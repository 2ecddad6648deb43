//! Text side of the control connection (RFC 2326).
//!
//! Requests and responses share one model, [`RtspMessage`], so the client
//! state machine and the server dispatcher parse and serialize through the
//! same code:
//!
//! ```text
//! SETUP rtsp://host/live/track1 RTSP/1.0\r\n      start line
//! CSeq: 3\r\n                                     headers, case-insensitive
//! Transport: RTP/AVP/TCP;interleaved=0-1\r\n
//! \r\n                                            end of headers
//! ```
//!
//! A body follows only when `Content-Length` announces one. Everything
//! binary on the same connection belongs to [`crate::transport::demux`].
//!
//! Server dispatch lives in [`handler`]; it answers OPTIONS, DESCRIBE,
//! SETUP, PLAY, PAUSE, TEARDOWN and GET_PARAMETER and rejects anything
//! else with 405. [`auth`] covers HTTP Basic on both ends and [`sdp`] the
//! single-track description served by DESCRIBE.

pub mod auth;
pub mod handler;
pub mod headers;
pub mod message;
pub mod method;
pub mod sdp;

pub use auth::Credentials;
pub use handler::MethodHandler;
pub use headers::Headers;
pub use message::{RtspMessage, StartLine};
pub use method::Method;
