//! Demultiplexer for the RTSP control connection.
//!
//! A control connection can carry three things at once: textual RTSP
//! requests/responses and, once TCP-interleaved transport is negotiated,
//! binary RTP and RTCP packets wrapped in interleaved frames
//! (RFC 2326 §10.12):
//!
//! ```text
//! +------+---------+----------------+---------------------+
//! | '$'  | channel | length (u16 BE)| payload (length B)  |
//! +------+---------+----------------+---------------------+
//! ```
//!
//! Bytes arrive in whatever chunks the socket returns. [`Demuxer`] keeps
//! the unconsumed tail and any message whose body is still arriving, and
//! yields [`Demuxed`] events in the order their boundaries are found.
//!
//! Trailing bytes: a sender may append raw bytes to a message without
//! counting them in `Content-Length`. A completed message is therefore held
//! until the bytes after it in the buffer are classified. Bytes that start
//! neither a frame nor a message are offered to the held message through
//! [`RtspMessage::complete_from`] and become part of its body.
//!
//! Resynchronisation: when no message is there to take such bytes, they
//! are skipped one byte at a time until a boundary is found again. Every
//! skipped byte is counted ([`Demuxer::discarded`]) and the start of each
//! resync run is logged. While resynchronising, a `$` is only trusted as a
//! frame if its declared length ends on another boundary and no complete
//! start line sits inside the span it claims, since RTP payload bytes can
//! equal the marker by chance.

use std::collections::HashSet;

use crate::error::{ParseErrorKind, Result, RtspError};
use crate::protocol::RtspMessage;
use crate::protocol::message::is_start_line;

/// First byte of an interleaved frame.
pub const MARKER: u8 = b'$';

/// Marker, channel and 16-bit length.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload an interleaved frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// A binary frame demultiplexed from the control connection.
///
/// `payload` borrows the demultiplexer's buffer and is only valid until the
/// next call into the [`Demuxer`]; copy it to keep it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedFrame<'a> {
    pub channel: u8,
    pub payload: &'a [u8],
}

/// One step of demultiplexer output.
#[derive(Debug)]
pub enum Demuxed<'a> {
    /// A complete RTSP request or response.
    Message(RtspMessage),
    /// A complete interleaved frame.
    Frame(TaggedFrame<'a>),
    /// More bytes are needed before the next boundary can be found.
    Incomplete,
}

enum Step {
    Message(RtspMessage),
    Frame { channel: u8, start: usize, end: usize },
    Incomplete,
}

enum FrameCheck {
    NeedMore,
    Accept { channel: u8, len: usize },
    Reject,
}

/// Incremental splitter for a single connection's read path.
///
/// ```
/// use rtsp::transport::demux::{Demuxed, Demuxer};
///
/// let mut demuxer = Demuxer::new();
/// demuxer.feed(b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n$\x00\x00\x02hi");
///
/// assert!(matches!(demuxer.poll(), Demuxed::Message(m) if m.cseq() == Some(1)));
/// assert!(matches!(demuxer.poll(), Demuxed::Frame(f) if f.payload == b"hi"));
/// assert!(matches!(demuxer.poll(), Demuxed::Incomplete));
/// ```
#[derive(Debug, Default)]
pub struct Demuxer {
    buf: Vec<u8>,
    pos: usize,
    pending: Option<RtspMessage>,
    /// Last completed message, kept until the bytes after it are classified.
    held: Option<RtspMessage>,
    channels: Option<HashSet<u8>>,
    resyncing: bool,
    discarded: u64,
}

impl Demuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interleaved channel as expected on this connection.
    ///
    /// Once any channel is registered, frame headers found while
    /// resynchronising must name a registered channel.
    pub fn allow_channel(&mut self, channel: u8) {
        self.channels.get_or_insert_with(HashSet::new).insert(channel);
    }

    /// Append bytes read from the connection.
    pub fn feed(&mut self, data: &[u8]) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Yield the next event from the buffered bytes.
    pub fn poll(&mut self) -> Demuxed<'_> {
        match self.advance() {
            Step::Message(message) => Demuxed::Message(message),
            Step::Frame {
                channel,
                start,
                end,
            } => Demuxed::Frame(TaggedFrame {
                channel,
                payload: &self.buf[start..end],
            }),
            Step::Incomplete => Demuxed::Incomplete,
        }
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Total bytes skipped while resynchronising.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Whether a message is waiting for the rest of its body.
    pub fn has_pending_message(&self) -> bool {
        self.pending.is_some()
    }

    fn advance(&mut self) -> Step {
        loop {
            if self.pos == self.buf.len() {
                return self.release_held().unwrap_or(Step::Incomplete);
            }

            // A message whose body is still arriving owns the next bytes.
            if let Some(mut message) = self.pending.take() {
                self.pos += message.complete_from(&self.buf[self.pos..]);
                if !message.is_complete() {
                    self.pending = Some(message);
                    return Step::Incomplete;
                }
                self.held = Some(message);
                continue;
            }

            let rest = &self.buf[self.pos..];
            if rest[0] == MARKER {
                match self.check_frame(rest) {
                    FrameCheck::NeedMore => {
                        return self.release_held().unwrap_or(Step::Incomplete);
                    }
                    FrameCheck::Accept { channel, len } => {
                        if let Some(held) = self.release_held() {
                            return held;
                        }
                        let start = self.pos + FRAME_HEADER_LEN;
                        let end = start + len;
                        self.pos = end;
                        self.end_resync();
                        tracing::trace!(channel, len, "interleaved frame");
                        return Step::Frame {
                            channel,
                            start,
                            end,
                        };
                    }
                    FrameCheck::Reject => {
                        self.reclaim();
                        continue;
                    }
                }
            }

            // Stray line endings between messages.
            if rest[0] == b'\r' || rest[0] == b'\n' {
                if self.held.is_some() && self.resyncing {
                    self.reclaim();
                    continue;
                }
                if let Some(held) = self.release_held() {
                    return held;
                }
                self.pos += 1;
                continue;
            }

            match RtspMessage::parse(rest) {
                Ok(Some((message, used))) => {
                    self.pos += used;
                    self.end_resync();
                    if message.is_complete() {
                        match self.held.replace(message) {
                            Some(previous) => return Step::Message(previous),
                            None => continue,
                        }
                    }
                    // `parse` took every available body byte.
                    self.pending = Some(message);
                    return self.release_held().unwrap_or(Step::Incomplete);
                }
                Ok(None) => return self.release_held().unwrap_or(Step::Incomplete),
                Err(error) => {
                    if self.held.is_none() && !self.resyncing {
                        tracing::warn!(%error, buffered = rest.len(), "unclassifiable bytes on control connection");
                    }
                    self.reclaim();
                }
            }
        }
    }

    fn release_held(&mut self) -> Option<Step> {
        self.held.take().map(Step::Message)
    }

    /// The bytes at the cursor start neither a frame nor a message. Offer
    /// them to the held message; skip one byte if it takes none.
    fn reclaim(&mut self) {
        let rest = &self.buf[self.pos..];
        let span = trailing_span(rest);
        let taken = match self.held.as_mut() {
            Some(message) => message.complete_from(&rest[..span]),
            None => 0,
        };

        if taken == 0 {
            self.skip();
            return;
        }
        tracing::debug!(taken, cseq = ?self.held.as_ref().and_then(RtspMessage::cseq), "trailing bytes appended to message body");
        self.pos += taken;
        // What follows unframed bytes is validated like a resync boundary.
        self.resyncing = true;
    }

    fn check_frame(&self, rest: &[u8]) -> FrameCheck {
        if rest.len() < FRAME_HEADER_LEN {
            return FrameCheck::NeedMore;
        }
        let channel = rest[1];
        let len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        let end = FRAME_HEADER_LEN + len;

        if !self.resyncing {
            return if rest.len() < end {
                FrameCheck::NeedMore
            } else {
                FrameCheck::Accept { channel, len }
            };
        }

        if len == 0 {
            return FrameCheck::Reject;
        }
        if let Some(known) = &self.channels
            && !known.contains(&channel)
        {
            return FrameCheck::Reject;
        }
        if rest.len() < end {
            // Waiting would hold back a message that has already arrived.
            return if holds_start_line(&rest[FRAME_HEADER_LEN..]) {
                FrameCheck::Reject
            } else {
                FrameCheck::NeedMore
            };
        }
        if rest.len() == end || starts_boundary(&rest[end..]) {
            FrameCheck::Accept { channel, len }
        } else {
            FrameCheck::Reject
        }
    }

    fn skip(&mut self) {
        self.resyncing = true;
        self.pos += 1;
        self.discarded += 1;
    }

    fn end_resync(&mut self) {
        if self.resyncing {
            tracing::debug!(discarded_total = self.discarded, "control connection resynchronized");
            self.resyncing = false;
        }
    }
}

/// Whether `next` can begin a frame or a message.
fn starts_boundary(next: &[u8]) -> bool {
    match next.first() {
        Some(&MARKER) | Some(b'\r') | Some(b'\n') => true,
        Some(b) if b.is_ascii_uppercase() => true,
        _ => false,
    }
}

/// Length of the unframed run at the front of `rest`: up to the next byte
/// that could start a frame or a message, at least one byte.
fn trailing_span(rest: &[u8]) -> usize {
    rest.iter()
        .skip(1)
        .position(|&b| b == MARKER || b.is_ascii_uppercase())
        .map_or(rest.len(), |i| i + 1)
}

/// Whether `span` contains a complete request or status line.
fn holds_start_line(span: &[u8]) -> bool {
    span.split(|&b| b == b'\n')
        .rev()
        .skip(1)
        .filter(|line| line.windows(5).any(|w| w == b"RTSP/"))
        .any(|line| {
            (0..line.len())
                .filter(|&i| line[i].is_ascii_uppercase())
                .any(|i| is_start_line(&line[i..]))
        })
}

/// Wrap `payload` in an interleaved frame for `channel`.
pub fn encode_frame(channel: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(payload.len())
        .map_err(|_| RtspError::parse(ParseErrorKind::PayloadTooLarge))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.push(MARKER);
    frame.push(channel);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Owned {
        Message(RtspMessage),
        Frame(u8, Vec<u8>),
    }

    fn drain(demuxer: &mut Demuxer) -> Vec<Owned> {
        let mut out = Vec::new();
        loop {
            match demuxer.poll() {
                Demuxed::Message(m) => out.push(Owned::Message(m)),
                Demuxed::Frame(f) => out.push(Owned::Frame(f.channel, f.payload.to_vec())),
                Demuxed::Incomplete => return out,
            }
        }
    }

    fn response(cseq: u32, body: &str) -> Vec<u8> {
        let mut resp = RtspMessage::ok().add_header("CSeq", cseq.to_string());
        if !body.is_empty() {
            resp = resp.with_body(body);
        }
        resp.serialize()
    }

    /// 1400-byte channel-0 payload that starts with the frame marker and
    /// channel id, like an unlucky RTP packet.
    fn colliding_payload() -> Vec<u8> {
        let mut payload = vec![MARKER, 0x00];
        payload.extend((0..1398).map(|i| (i % 251) as u8));
        payload
    }

    fn mixed_stream() -> Vec<u8> {
        let mut stream = response(34, "");
        stream.extend(encode_frame(0, &colliding_payload()).unwrap());
        stream.extend(response(35, "v=0\r\ns=$tream\r\n"));
        stream.extend(encode_frame(1, &[0x80, 0xc9, 0x00, 0x01]).unwrap());
        stream
    }

    fn cseqs(events: &[Owned]) -> Vec<Option<i32>> {
        events
            .iter()
            .filter_map(|e| match e {
                Owned::Message(m) => Some(m.cseq()),
                Owned::Frame(..) => None,
            })
            .collect()
    }

    #[test]
    fn marker_collision_inside_payload() {
        let mut demuxer = Demuxer::new();
        let mut stream = response(34, "");
        stream.extend(encode_frame(0, &colliding_payload()).unwrap());
        stream.extend(response(35, ""));
        demuxer.feed(&stream);

        let events = drain(&mut demuxer);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], Owned::Message(m) if m.cseq() == Some(34)));
        assert_eq!(events[1], Owned::Frame(0, colliding_payload()));
        assert!(matches!(&events[2], Owned::Message(m) if m.cseq() == Some(35)));
        assert_eq!(demuxer.discarded(), 0);
    }

    #[test]
    fn every_two_chunk_split_matches_whole() {
        let stream = mixed_stream();
        let mut whole = Demuxer::new();
        whole.feed(&stream);
        let expected = drain(&mut whole);
        assert_eq!(expected.len(), 4);

        for split in 0..=stream.len() {
            let mut demuxer = Demuxer::new();
            demuxer.feed(&stream[..split]);
            let mut events = drain(&mut demuxer);
            demuxer.feed(&stream[split..]);
            events.extend(drain(&mut demuxer));
            assert_eq!(events, expected, "split at {}", split);
        }
    }

    #[test]
    fn byte_at_a_time() {
        let stream = mixed_stream();
        let mut demuxer = Demuxer::new();
        let mut events = Vec::new();
        for byte in &stream {
            demuxer.feed(std::slice::from_ref(byte));
            events.extend(drain(&mut demuxer));
        }
        assert_eq!(cseqs(&events), vec![Some(34), Some(35)]);
        assert_eq!(events.len(), 4);
        assert_eq!(demuxer.buffered(), 0);
    }

    #[test]
    fn body_waits_for_content_length() {
        let mut demuxer = Demuxer::new();
        demuxer.feed(b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: 8\r\n\r\nv=0\r");
        assert!(matches!(demuxer.poll(), Demuxed::Incomplete));
        assert!(demuxer.has_pending_message());

        demuxer.feed(b"\n$\x00\x00$\x01");
        match demuxer.poll() {
            Demuxed::Message(m) => assert_eq!(m.body(), b"v=0\r\n$\x00\x00"),
            other => panic!("expected message, got {:?}", other),
        }
        // Only the second marker starts a frame header.
        assert!(matches!(demuxer.poll(), Demuxed::Incomplete));
        assert_eq!(demuxer.buffered(), 2);
        assert_eq!(demuxer.discarded(), 0);
    }

    #[test]
    fn trailing_bytes_extend_previous_message() {
        let mut demuxer = Demuxer::new();
        // Keep-alive reply followed by raw bytes its Content-Length did not cover.
        let trailing = [0x80, 0x60, 0x12, 0x34, 0x00, 0x11];
        let mut stream = response(7, "");
        stream.extend_from_slice(&trailing);
        stream.extend(response(8, ""));
        demuxer.feed(&stream);

        let events = drain(&mut demuxer);
        assert_eq!(cseqs(&events), vec![Some(7), Some(8)]);
        match &events[0] {
            Owned::Message(m) => assert_eq!(m.body(), trailing),
            other => panic!("expected message, got {:?}", other),
        }
        assert_eq!(demuxer.discarded(), 0);
    }

    #[test]
    fn trailing_bytes_stop_at_next_frame() {
        let mut demuxer = Demuxer::new();
        let mut stream = response(7, "");
        stream.extend_from_slice(&[0x80, 0x60, 0x12, 0x34, 0x00, 0x11]);
        stream.extend(encode_frame(0, b"rtp").unwrap());
        stream.extend(response(8, ""));
        demuxer.feed(&stream);

        let events = drain(&mut demuxer);
        assert_eq!(events.len(), 3);
        assert_eq!(cseqs(&events), vec![Some(7), Some(8)]);
        assert!(matches!(&events[0], Owned::Message(m) if m.body().len() == 6));
        assert_eq!(events[1], Owned::Frame(0, b"rtp".to_vec()));
        assert_eq!(demuxer.discarded(), 0);
    }

    #[test]
    fn stray_marker_does_not_hold_back_responses() {
        // After a message: the stray header becomes trailing body.
        let mut demuxer = Demuxer::new();
        let mut stream = response(7, "");
        stream.extend_from_slice(&[0x80, MARKER, 0x00, 0xFF, 0xFF]);
        stream.extend(response(8, ""));
        demuxer.feed(&stream);

        let events = drain(&mut demuxer);
        assert_eq!(cseqs(&events), vec![Some(7), Some(8)]);
        assert!(matches!(&events[0], Owned::Message(m) if m.body() == [0x80, MARKER, 0x00, 0xFF, 0xFF]));
        assert_eq!(demuxer.buffered(), 0);

        // After a frame: nothing can take the bytes, so they are skipped.
        let mut demuxer = Demuxer::new();
        let mut stream = encode_frame(1, b"rtcp").unwrap();
        stream.extend_from_slice(&[0x01, MARKER, 0x00, 0xFF, 0xFF]);
        stream.extend(response(8, ""));
        demuxer.feed(&stream);

        let events = drain(&mut demuxer);
        assert_eq!(events.len(), 2);
        assert_eq!(cseqs(&events), vec![Some(8)]);
        assert_eq!(demuxer.discarded(), 5);
        assert_eq!(demuxer.buffered(), 0);
    }

    #[test]
    fn long_marker_without_start_line_still_waits() {
        let mut demuxer = Demuxer::new();
        let mut stream = encode_frame(1, b"rtcp").unwrap();
        stream.extend_from_slice(&[0x01, MARKER, 0x00, 0x00, 0x08, 0xAA, 0xBB]);
        demuxer.feed(&stream);

        let events = drain(&mut demuxer);
        assert_eq!(events, vec![Owned::Frame(1, b"rtcp".to_vec())]);
        assert_eq!(demuxer.discarded(), 1);
        assert_eq!(demuxer.buffered(), 6);
    }

    #[test]
    fn false_marker_during_resync_is_rejected() {
        let mut demuxer = Demuxer::new();
        demuxer.allow_channel(0);
        demuxer.allow_channel(1);
        // Garbage holding a "$" header for unknown channel 9, then a real message.
        let mut stream = vec![0x01, MARKER, 9, 0x00, 0x02, 0xAA, 0xBB];
        stream.extend(response(3, ""));
        demuxer.feed(&stream);

        let events = drain(&mut demuxer);
        assert_eq!(events.len(), 1);
        assert_eq!(cseqs(&events), vec![Some(3)]);
        assert_eq!(demuxer.discarded(), 7);
    }

    #[test]
    fn marker_whose_length_misses_a_boundary_is_rejected() {
        let mut demuxer = Demuxer::new();
        // While resyncing, "$\x00\x00\x01" would claim one byte, but what
        // follows that byte is not a boundary.
        let mut stream = vec![0xff, MARKER, 0, 0, 1, 0x42, 0x17, 0x99];
        stream.extend(encode_frame(1, b"rtcp").unwrap());
        demuxer.feed(&stream);

        let events = drain(&mut demuxer);
        assert_eq!(events, vec![Owned::Frame(1, b"rtcp".to_vec())]);
    }

    #[test]
    fn unclassifiable_tail_stays_incomplete() {
        let mut demuxer = Demuxer::new();
        demuxer.feed(b"GARBAGE-WITHOUT-NEWLINE");
        assert!(matches!(demuxer.poll(), Demuxed::Incomplete));
        assert!(demuxer.buffered() > 0);
    }

    #[test]
    fn stray_crlf_between_messages() {
        let mut demuxer = Demuxer::new();
        let mut stream = response(1, "");
        stream.extend_from_slice(b"\r\n\r\n");
        stream.extend(response(2, ""));
        demuxer.feed(&stream);
        assert_eq!(cseqs(&drain(&mut demuxer)), vec![Some(1), Some(2)]);
        assert_eq!(demuxer.discarded(), 0);
    }

    #[test]
    fn encode_frame_rejects_oversized_payload() {
        assert!(encode_frame(0, &vec![0u8; MAX_FRAME_PAYLOAD + 1]).is_err());
        let frame = encode_frame(3, &[1, 2, 3]).unwrap();
        assert_eq!(frame, vec![MARKER, 3, 0, 3, 1, 2, 3]);
    }
}
