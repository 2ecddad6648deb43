//! Network transport layer for RTSP signaling and RTP/RTCP delivery.
//!
//! A control connection is a duplex TCP byte stream that carries RTSP
//! messages and, once a session negotiates `RTP/AVP/TCP`, `$`-framed
//! interleaved packets (RFC 2326 §10.12) on the same stream:
//!
//! - [`demux`]: splits the inbound byte stream into messages and frames.
//! - [`channels`]: maps interleaved channel ids to the stream that owns them.
//! - [`tcp`]: server accept loop and per-connection read loop.
//! - [`udp`]: RTP/RTCP socket pairs for `RTP/AVP` (UDP) sessions.
//!
//! Writes to a control connection come from two places (responses from
//! the connection thread, frames from session workers), so the write half
//! is shared behind a mutex as a [`SharedWriter`]. Reads stay with a single
//! owner.

pub mod channels;
pub mod demux;
pub mod tcp;
pub mod udp;

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::protocol::RtspMessage;

pub use channels::ChannelMap;
pub use demux::{Demuxed, Demuxer, TaggedFrame};
pub use udp::UdpPair;

/// Write half of a control connection, shared between its writers.
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

pub fn shared_writer<W: Write + Send + 'static>(writer: W) -> SharedWriter {
    Arc::new(Mutex::new(Box::new(writer)))
}

/// Serialize `message` and write it in one locked call so it never
/// interleaves with a frame.
pub fn write_message(writer: &SharedWriter, message: &RtspMessage) -> Result<()> {
    let bytes = message.serialize();
    let mut writer = writer.lock();
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}
