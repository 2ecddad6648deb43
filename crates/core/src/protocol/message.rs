use crate::error::{ParseErrorKind, Result, RtspError};

use super::{Headers, Method};

/// Server identification string included in every RTSP response
/// per RFC 2326 §12.36.
pub const SERVER_AGENT: &str = "rtsp-duplex/0.1";

/// Largest header block accepted before the blank line.
pub const MAX_HEADER_LEN: usize = 64 * 1024;

/// Largest body a `Content-Length` header may announce.
pub const MAX_BODY_LEN: usize = 4 * 1024 * 1024;

const MAX_START_LINE: usize = 4096;
const MAX_METHOD_LEN: usize = 32;

/// First line of an RTSP message.
#[derive(Debug, Clone, PartialEq)]
pub enum StartLine {
    /// `Method SP Request-URI SP RTSP-Version` (RFC 2326 §6.1).
    Request { method: Method, uri: String },
    /// `RTSP-Version SP Status-Code SP Reason-Phrase` (RFC 2326 §7.1).
    Response { status: u16, reason: String },
}

/// An RTSP request or response (RFC 2326 §4).
///
/// ```text
/// DESCRIBE rtsp://server/stream RTSP/1.0\r\n
/// CSeq: 2\r\n
/// Accept: application/sdp\r\n
/// \r\n
/// ```
///
/// Requests and responses share the header and body representation and only
/// differ in their [`StartLine`]. A message parsed from the wire may be
/// *incomplete*: its header block has arrived but fewer body bytes than
/// `Content-Length` announced. [`complete_from`](Self::complete_from) feeds
/// it the rest. A complete message can still grow when a sender appends
/// bytes its `Content-Length` did not count; the demultiplexer offers them
/// back through the same call.
///
/// Outgoing messages use a builder style: chain
/// [`add_header`](Self::add_header) and [`with_body`](Self::with_body), then
/// call [`serialize`](Self::serialize).
#[derive(Debug, Clone, PartialEq)]
#[must_use]
pub struct RtspMessage {
    pub start: StartLine,
    /// Protocol version, `1.0` for `RTSP/1.0`.
    pub version: f32,
    headers: Headers,
    body: Vec<u8>,
    expected_body_len: usize,
}

impl RtspMessage {
    pub fn request(method: Method, uri: &str) -> Self {
        RtspMessage {
            start: StartLine::Request {
                method,
                uri: uri.to_string(),
            },
            version: 1.0,
            headers: Headers::new(),
            body: Vec::new(),
            expected_body_len: 0,
        }
    }

    pub fn response(status: u16, reason: &str) -> Self {
        let mut headers = Headers::new();
        headers.set("Server", SERVER_AGENT);
        RtspMessage {
            start: StartLine::Response {
                status,
                reason: reason.to_string(),
            },
            version: 1.0,
            headers,
            body: Vec::new(),
            expected_body_len: 0,
        }
    }

    /// 200 OK: success (RFC 2326 §7.1.1).
    pub fn ok() -> Self {
        Self::response(200, "OK")
    }

    /// 400 Bad Request: malformed or missing required header.
    pub fn bad_request() -> Self {
        Self::response(400, "Bad Request")
    }

    /// 401 Unauthorized: credentials missing or rejected.
    pub fn unauthorized() -> Self {
        Self::response(401, "Unauthorized")
    }

    /// 404 Not Found: the requested resource does not exist.
    pub fn not_found() -> Self {
        Self::response(404, "Not Found")
    }

    pub fn method_not_allowed() -> Self {
        Self::response(405, "Method Not Allowed")
    }

    pub fn session_not_found() -> Self {
        Self::response(454, "Session Not Found")
    }

    pub fn method_not_valid_in_state() -> Self {
        Self::response(455, "Method Not Valid in This State")
    }

    pub fn unsupported_transport() -> Self {
        Self::response(461, "Unsupported Transport")
    }

    pub fn internal_error() -> Self {
        Self::response(500, "Internal Server Error")
    }

    pub fn add_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Attach a body and set `Content-Length` to match (RFC 2326 §12.14).
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self.expected_body_len = self.body.len();
        self.headers
            .set("Content-Length", self.body.len().to_string());
        self
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn method(&self) -> Option<&Method> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn uri(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self.start {
            StartLine::Response { status, .. } => Some(status),
            StartLine::Request { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.start {
            StartLine::Response { reason, .. } => Some(reason),
            StartLine::Request { .. } => None,
        }
    }

    /// True for 2xx responses.
    pub fn is_success(&self) -> bool {
        matches!(self.status(), Some(200..=299))
    }

    /// The CSeq header value, which numbers and orders request/response
    /// pairs (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<i32> {
        self.header("CSeq")?.trim().parse().ok()
    }

    /// Session ID from the `Session` header, without the `;timeout=` suffix.
    pub fn session_id(&self) -> Option<&str> {
        self.header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
            .filter(|s| !s.is_empty())
    }

    /// Timeout advertised in the `Session` header (`id;timeout=60`).
    pub fn session_timeout(&self) -> Option<u64> {
        self.header("Session")?
            .split(';')
            .skip(1)
            .filter_map(|param| param.trim().strip_prefix("timeout="))
            .find_map(|secs| secs.trim().parse().ok())
    }

    /// Body length declared by `Content-Length` (0 when absent).
    pub fn content_length(&self) -> usize {
        self.expected_body_len
    }

    pub fn is_complete(&self) -> bool {
        self.body.len() >= self.expected_body_len
    }

    /// Append body bytes from `extra`.
    ///
    /// An incomplete message takes bytes until the declared length is
    /// reached. A complete message takes all of `extra` as trailing body and
    /// its expected length grows to match, so it stays complete. Returns the
    /// number of bytes taken.
    pub fn complete_from(&mut self, extra: &[u8]) -> usize {
        if self.is_complete() {
            self.body.extend_from_slice(extra);
            self.expected_body_len = self.body.len();
            return extra.len();
        }
        let wanted = self.expected_body_len.saturating_sub(self.body.len());
        let taken = wanted.min(extra.len());
        self.body.extend_from_slice(&extra[..taken]);
        taken
    }

    /// Serialize to the RTSP text wire format.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = match &self.start {
            StartLine::Request { method, uri } => {
                format!("{} {} RTSP/{:.1}\r\n", method, uri, self.version)
            }
            StartLine::Response { status, reason } => {
                format!("RTSP/{:.1} {} {}\r\n", self.version, status, reason)
            }
        };

        for (name, value) in self.headers.iter() {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !self.body.is_empty() && !self.headers.contains("Content-Length") {
            out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        out.push_str("\r\n");

        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// Parse a message from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` could still become a message but the
    /// header block has not been terminated yet. On success returns the
    /// message and the number of bytes consumed; the message may be
    /// incomplete if `buf` ends inside the body.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.is_empty() {
            return Err(RtspError::parse(ParseErrorKind::EmptyMessage));
        }

        let Some(first_nl) = buf.iter().position(|&b| b == b'\n') else {
            if buf.len() > MAX_START_LINE || !is_plausible_start(buf) {
                return Err(RtspError::parse(ParseErrorKind::InvalidStartLine));
            }
            return Ok(None);
        };

        let first_line = std::str::from_utf8(trim_cr(&buf[..first_nl]))
            .map_err(|_| RtspError::parse(ParseErrorKind::InvalidStartLine))?;
        let (start, version) = parse_start_line(first_line)?;

        let Some(header_end) = find_header_end(buf, first_nl + 1) else {
            if buf.len() > MAX_HEADER_LEN {
                return Err(RtspError::parse(ParseErrorKind::HeaderTooLarge));
            }
            return Ok(None);
        };

        let header_text = std::str::from_utf8(&buf[first_nl + 1..header_end])
            .map_err(|_| RtspError::parse(ParseErrorKind::InvalidHeader))?;
        let headers = parse_headers(header_text)?;

        let expected_body_len = match headers.get("Content-Length") {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|&len| len <= MAX_BODY_LEN)
                .ok_or(RtspError::parse(ParseErrorKind::InvalidContentLength))?,
            None => 0,
        };

        let available = buf.len() - header_end;
        let taken = expected_body_len.min(available);
        let body = buf[header_end..header_end + taken].to_vec();

        Ok(Some((
            RtspMessage {
                start,
                version,
                headers,
                body,
                expected_body_len,
            },
            header_end + taken,
        )))
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Index just past the blank line terminating the header block.
fn find_header_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut line_start = from;
    for (i, &b) in buf.iter().enumerate().skip(from) {
        if b == b'\n' {
            if trim_cr(&buf[line_start..i]).is_empty() {
                return Some(i + 1);
            }
            line_start = i + 1;
        }
    }
    None
}

fn parse_version(token: &str) -> Result<f32> {
    let number = token
        .strip_prefix("RTSP/")
        .filter(|n| {
            let mut parts = n.split('.');
            matches!(
                (parts.next(), parts.next(), parts.next()),
                (Some(major), Some(minor), None)
                    if !major.is_empty() && !minor.is_empty()
                        && major.bytes().all(|b| b.is_ascii_digit())
                        && minor.bytes().all(|b| b.is_ascii_digit())
            )
        })
        .ok_or(RtspError::parse(ParseErrorKind::InvalidVersion))?;
    number
        .parse()
        .map_err(|_| RtspError::parse(ParseErrorKind::InvalidVersion))
}

/// Whether `line` (without its line ending) is a request or status line.
pub(crate) fn is_start_line(line: &[u8]) -> bool {
    std::str::from_utf8(trim_cr(line)).is_ok_and(|line| parse_start_line(line).is_ok())
}

fn parse_start_line(line: &str) -> Result<(StartLine, f32)> {
    if line.is_empty() {
        return Err(RtspError::parse(ParseErrorKind::EmptyMessage));
    }

    if line.starts_with("RTSP/") {
        let (version, rest) = line
            .split_once(' ')
            .ok_or(RtspError::parse(ParseErrorKind::InvalidStartLine))?;
        let version = parse_version(version)?;
        let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        let status = code
            .parse::<u16>()
            .ok()
            .filter(|s| (100..=999).contains(s))
            .ok_or(RtspError::parse(ParseErrorKind::InvalidStartLine))?;
        return Ok((
            StartLine::Response {
                status,
                reason: reason.trim().to_string(),
            },
            version,
        ));
    }

    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 || !Method::is_token(parts[0]) {
        return Err(RtspError::parse(ParseErrorKind::InvalidStartLine));
    }

    let version = parse_version(parts[2])?;
    if version != 1.0 {
        tracing::warn!(version, "peer sent non-RTSP/1.0 version");
    }

    let method = parts[0]
        .parse::<Method>()
        .unwrap_or_else(|never| match never {});

    Ok((
        StartLine::Request {
            method,
            uri: parts[1].to_string(),
        },
        version,
    ))
}

fn parse_headers(text: &str) -> Result<Headers> {
    let mut headers = Headers::new();
    let mut last_name: Option<String> = None;

    for line in text.lines() {
        if line.is_empty() {
            break;
        }

        // Folded continuation line (RFC 2616 §2.2, inherited by RFC 2326).
        if line.starts_with([' ', '\t']) {
            let name = last_name
                .as_deref()
                .ok_or(RtspError::parse(ParseErrorKind::InvalidHeader))?;
            let joined = format!("{} {}", headers.get(name).unwrap_or(""), line.trim());
            headers.set(name, joined);
            continue;
        }

        let (name, value) = line
            .split_once(':')
            .ok_or(RtspError::parse(ParseErrorKind::InvalidHeader))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(RtspError::parse(ParseErrorKind::InvalidHeader));
        }

        headers.set(name, value.trim());
        last_name = Some(name.to_string());
    }

    Ok(headers)
}

/// Whether an unterminated first line can still grow into a valid start line.
fn is_plausible_start(partial: &[u8]) -> bool {
    let partial = trim_cr(partial);
    if partial.iter().any(|&b| b < 0x20 || b == 0x7f) {
        return false;
    }

    if partial.starts_with(b"RTSP/") || b"RTSP/".starts_with(partial) {
        return true;
    }

    let method = partial.split(|&b| b == b' ').next().unwrap_or(partial);
    !method.is_empty()
        && method.len() <= MAX_METHOD_LEN
        && method
            .iter()
            .all(|&b| b.is_ascii_uppercase() || b == b'_' || b == b'-')
}
