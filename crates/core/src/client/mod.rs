//! RTSP client session state machine (RFC 2326 §A.1).
//!
//! ```text
//! Init ──DESCRIBE──▶ Described ──SETUP──▶ SetUp ──PLAY──▶ Playing ◀─PLAY─┐
//!                                  ▲  │                      │          │
//!                                  └──┘ (per stream)         └─PAUSE──▶ Paused
//! any state ──TEARDOWN──▶ TornDown
//! ```
//!
//! Requests run synchronously on the calling thread: each one takes the
//! next CSeq, is written to the control connection, and blocks until the
//! response carrying the same CSeq arrives (bounded by
//! [`ClientConfig::read_timeout`]). A reader thread owns the read half of
//! the connection; it demultiplexes responses from interleaved frames and
//! forwards frames as [`ReceivedPacket`]s.
//!
//! SETUP prefers UDP. When the server rejects it (461), omits the SSRC,
//! or answers without a server port pair, the stream is set up again over
//! TCP-interleaved channels.

pub mod keepalive;

use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::RngExt;

use crate::error::{Result, RtspError};
use crate::packet::{PacketKind, rtcp};
use crate::protocol::{Credentials, Method, RtspMessage, auth, sdp};
use crate::session::{DEFAULT_SESSION_TIMEOUT_SECS, SessionState, TransportDescriptor};
use crate::transport::demux::{Demuxed, Demuxer, encode_frame};
use crate::transport::{ChannelMap, UdpPair};
use keepalive::KeepAlive;

const DEFAULT_PORT: u16 = 554;
const RECEIVE_POLL: Duration = Duration::from_millis(100);

/// Lower transport to try first on SETUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportPreference {
    /// `RTP/AVP` over UDP, falling back to TCP-interleaved.
    #[default]
    Udp,
    /// `RTP/AVP/TCP` interleaved on the control connection.
    Tcp,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: TransportPreference,
    /// Bound on connect and on every request/response exchange.
    pub read_timeout: Duration,
    pub user_agent: String,
    /// Overrides credentials embedded in the URL.
    pub credentials: Option<Credentials>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportPreference::Udp,
            read_timeout: Duration::from_secs(10),
            user_agent: concat!("rtsp-duplex/", env!("CARGO_PKG_VERSION")).to_string(),
            credentials: None,
        }
    }
}

/// A packet received on one of the client's streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    /// Index of the stream, in SETUP order.
    pub stream: usize,
    pub kind: PacketKind,
    /// Interleaved channel, or `None` for UDP.
    pub channel: Option<u8>,
    pub payload: Vec<u8>,
}

/// A completed state-changing exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub method: Method,
    pub cseq: i32,
    pub state: SessionState,
}

/// Components of an `rtsp://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspUrl {
    /// The URL with any userinfo removed.
    pub url: String,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl RtspUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = || RtspError::InvalidUrl(url.to_string());

        let scheme_len = "rtsp://".len();
        if url.len() < scheme_len || !url[..scheme_len].eq_ignore_ascii_case("rtsp://") {
            return Err(invalid());
        }
        let rest = &url[scheme_len..];
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        let (userinfo, host_port) = match authority.rsplit_once('@') {
            Some((userinfo, host_port)) => (Some(userinfo), host_port),
            None => (None, authority),
        };

        let (host, port) = if let Some(bracketed) = host_port.strip_prefix('[') {
            let (host, after) = bracketed.split_once(']').ok_or_else(invalid)?;
            let port = match after.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid())?,
                None if after.is_empty() => DEFAULT_PORT,
                None => return Err(invalid()),
            };
            (host, port)
        } else {
            match host_port.rsplit_once(':') {
                Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
                None => (host_port, DEFAULT_PORT),
            }
        };
        if host.is_empty() {
            return Err(invalid());
        }

        let credentials = userinfo.map(|userinfo| {
            let (username, password) = userinfo.split_once(':').unwrap_or((userinfo, ""));
            Credentials::new(username, password)
        });

        Ok(Self {
            url: format!("rtsp://{}{}", host_port, path),
            host: host.to_string(),
            port,
            credentials,
        })
    }
}

struct Writer {
    stream: TcpStream,
    next_cseq: i32,
}

/// Write side of the control connection plus the response queue.
///
/// Shared with the keep-alive timer. `responses` is held for a whole
/// exchange so requests never overlap.
struct ControlChannel {
    writer: Mutex<Writer>,
    responses: Mutex<Receiver<RtspMessage>>,
    credentials: Option<Credentials>,
    authorize: AtomicBool,
    user_agent: String,
    read_timeout: Duration,
}

impl ControlChannel {
    /// Send `request` and wait for its response, answering one Basic
    /// challenge if credentials are available.
    fn exchange(&self, mut request: RtspMessage) -> Result<RtspMessage> {
        let responses = self.responses.lock();
        let mut retried = false;
        loop {
            if self.authorize.load(Ordering::SeqCst)
                && let Some(credentials) = &self.credentials
            {
                request.set_header("Authorization", credentials.authorization());
            }

            let cseq = self.send(&mut request)?;
            let response = self.await_response(&responses, cseq)?;
            if response.status() != Some(401) {
                return Ok(response);
            }

            let offers_basic = response
                .header("WWW-Authenticate")
                .is_none_or(auth::offers_basic);
            if retried || self.credentials.is_none() || !offers_basic {
                tracing::warn!(cseq, method = ?request.method(), "request unauthorized");
                return Err(RtspError::Unauthorized);
            }
            tracing::debug!(cseq, "retrying with Basic credentials");
            retried = true;
            self.authorize.store(true, Ordering::SeqCst);
        }
    }

    fn send(&self, request: &mut RtspMessage) -> Result<i32> {
        let mut writer = self.writer.lock();
        writer.next_cseq += 1;
        let cseq = writer.next_cseq;
        request.set_header("CSeq", cseq.to_string());
        request.set_header("User-Agent", self.user_agent.as_str());

        writer.stream.write_all(&request.serialize())?;
        writer.stream.flush()?;
        tracing::debug!(cseq, method = ?request.method(), uri = request.uri().unwrap_or(""), "request sent");
        Ok(cseq)
    }

    fn await_response(&self, responses: &Receiver<RtspMessage>, cseq: i32) -> Result<RtspMessage> {
        let deadline = Instant::now() + self.read_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let response = match responses.recv_timeout(remaining) {
                Ok(response) => response,
                Err(RecvTimeoutError::Timeout) => return Err(RtspError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(RtspError::ConnectionClosed),
            };

            match response.cseq() {
                Some(got) if got == cseq => return Ok(response),
                Some(got) if got < cseq => {
                    tracing::debug!(expected = cseq, got, "discarding stale response");
                }
                Some(got) => {
                    return Err(RtspError::protocol(
                        format!("response CSeq {} is ahead of request CSeq {}", got, cseq),
                        Some(response),
                    ));
                }
                None => {
                    return Err(RtspError::protocol("response without CSeq", Some(response)));
                }
            }
        }
    }

    fn send_frame(&self, channel: u8, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(channel, payload)?;
        let mut writer = self.writer.lock();
        writer.stream.write_all(&frame)?;
        writer.stream.flush()?;
        Ok(())
    }
}

/// Reader thread body: the only reader of the control connection.
fn read_loop(
    mut stream: TcpStream,
    responses: Sender<RtspMessage>,
    packets: Sender<ReceivedPacket>,
    channels: Arc<Mutex<ChannelMap<usize>>>,
    stop: Arc<AtomicBool>,
) {
    let mut demuxer = Demuxer::new();
    let mut chunk = vec![0u8; 16 * 1024];

    let reason = loop {
        if stop.load(Ordering::SeqCst) {
            break "stopped";
        }
        let n = match stream.read(&mut chunk) {
            Ok(0) => break "connection closed by server",
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(_) => break "read error",
        };

        demuxer.feed(&chunk[..n]);
        for channel in channels.lock().assigned() {
            demuxer.allow_channel(channel);
        }
        loop {
            match demuxer.poll() {
                Demuxed::Message(message) if message.is_request() => {
                    tracing::debug!(method = ?message.method(), "ignoring request from server");
                }
                Demuxed::Message(message) => {
                    tracing::trace!(cseq = ?message.cseq(), status = ?message.status(), "response received");
                    let _ = responses.send(message);
                }
                Demuxed::Frame(frame) => {
                    let route = channels
                        .lock()
                        .lookup(frame.channel)
                        .map(|(stream, kind)| (*stream, kind));
                    match route {
                        Some((stream, kind)) => {
                            let _ = packets.send(ReceivedPacket {
                                stream,
                                kind,
                                channel: Some(frame.channel),
                                payload: frame.payload.to_vec(),
                            });
                        }
                        None => tracing::debug!(channel = frame.channel, len = frame.payload.len(), "frame on unknown channel"),
                    }
                }
                Demuxed::Incomplete => break,
            }
        }
    };

    if demuxer.discarded() > 0 {
        tracing::debug!(discarded = demuxer.discarded(), "control connection had unclassifiable bytes");
    }
    tracing::debug!(reason, "control reader exited");
}

/// Receive threads for one UDP stream.
struct UdpReceiver {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    rtcp: UdpSocket,
}

impl UdpReceiver {
    fn spawn(pair: UdpPair, stream: usize, packets: Sender<ReceivedPacket>) -> Result<Self> {
        pair.set_read_timeout(Some(RECEIVE_POLL))?;
        let rtcp = pair.rtcp.try_clone()?;
        let stop = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(2);
        for (socket, kind) in [(pair.rtp, PacketKind::Media), (pair.rtcp, PacketKind::Control)] {
            let stop = stop.clone();
            let packets = packets.clone();
            let handle = thread::Builder::new()
                .name(format!("rtsp-udp-{}", stream))
                .spawn(move || {
                    let mut buf = vec![0u8; 65536];
                    while !stop.load(Ordering::SeqCst) {
                        match socket.recv_from(&mut buf) {
                            Ok((len, _)) => {
                                let packet = ReceivedPacket {
                                    stream,
                                    kind,
                                    channel: None,
                                    payload: buf[..len].to_vec(),
                                };
                                if packets.send(packet).is_err() {
                                    return;
                                }
                            }
                            Err(e)
                                if matches!(
                                    e.kind(),
                                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                                ) => {}
                            Err(e) => {
                                tracing::debug!(stream, ?kind, error = %e, "UDP receive failed");
                                return;
                            }
                        }
                    }
                })?;
            handles.push(handle);
        }

        Ok(Self { stop, handles, rtcp })
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Stream {
    control_url: String,
    transport: TransportDescriptor,
    udp: Option<UdpReceiver>,
    server_rtcp: Option<SocketAddr>,
}

/// Blocking RTSP client for one presentation.
pub struct RtspClient {
    url: String,
    base_url: String,
    config: ClientConfig,
    control: Arc<ControlChannel>,
    shutdown: TcpStream,
    local_ip: IpAddr,
    peer_ip: IpAddr,
    ssrc: u32,
    state: SessionState,
    transitions: Vec<Transition>,
    session_id: Option<String>,
    session_timeout: u64,
    supports_get_parameter: bool,
    sdp: Option<String>,
    control_urls: Vec<String>,
    streams: Vec<Stream>,
    channels: Arc<Mutex<ChannelMap<usize>>>,
    packets_tx: Sender<ReceivedPacket>,
    packets_rx: Receiver<ReceivedPacket>,
    keepalive: Option<KeepAlive>,
    reader_stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl RtspClient {
    /// Open the control connection to `url`.
    pub fn connect(url: &str, config: ClientConfig) -> Result<Self> {
        let parsed = RtspUrl::parse(url)?;
        let addr = (parsed.host.as_str(), parsed.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| RtspError::InvalidUrl(url.to_string()))?;

        let stream = TcpStream::connect_timeout(&addr, config.read_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(RECEIVE_POLL))?;
        let local_ip = stream.local_addr()?.ip();
        let reader_stream = stream.try_clone()?;
        let shutdown = stream.try_clone()?;

        let (responses_tx, responses_rx) = mpsc::channel();
        let (packets_tx, packets_rx) = mpsc::channel();
        let channels = Arc::new(Mutex::new(ChannelMap::new()));
        let reader_stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let packets = packets_tx.clone();
            let channels = channels.clone();
            let stop = reader_stop.clone();
            thread::Builder::new()
                .name("rtsp-client-reader".to_string())
                .spawn(move || read_loop(reader_stream, responses_tx, packets, channels, stop))?
        };

        let credentials = config.credentials.clone().or(parsed.credentials);
        let control = Arc::new(ControlChannel {
            writer: Mutex::new(Writer {
                stream,
                next_cseq: 0,
            }),
            responses: Mutex::new(responses_rx),
            credentials,
            authorize: AtomicBool::new(false),
            user_agent: config.user_agent.clone(),
            read_timeout: config.read_timeout,
        });

        tracing::info!(url = %parsed.url, peer = %addr, "connected");

        Ok(Self {
            base_url: parsed.url.clone(),
            url: parsed.url,
            config,
            control,
            shutdown,
            local_ip,
            peer_ip: addr.ip(),
            ssrc: rand::rng().random::<u32>(),
            state: SessionState::Init,
            transitions: Vec::new(),
            session_id: None,
            session_timeout: DEFAULT_SESSION_TIMEOUT_SECS,
            supports_get_parameter: false,
            sdp: None,
            control_urls: Vec::new(),
            streams: Vec::new(),
            channels,
            packets_tx,
            packets_rx,
            keepalive: None,
            reader_stop,
            reader: Some(reader),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// State-changing exchanges completed so far, oldest first.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Timeout the server advertised for the session, in seconds.
    pub fn session_timeout(&self) -> u64 {
        self.session_timeout
    }

    /// SDP body of the last DESCRIBE.
    pub fn sdp(&self) -> Option<&str> {
        self.sdp.as_deref()
    }

    /// Media control URLs from the last DESCRIBE.
    pub fn control_urls(&self) -> &[String] {
        &self.control_urls
    }

    /// Negotiated transport of stream `index`.
    pub fn stream_transport(&self, index: usize) -> Option<&TransportDescriptor> {
        self.streams.get(index).map(|s| &s.transport)
    }

    /// Whether the keep-alive timer is running.
    pub fn keepalive_active(&self) -> bool {
        self.keepalive.as_ref().is_some_and(KeepAlive::is_active)
    }

    pub fn packets(&self) -> &Receiver<ReceivedPacket> {
        &self.packets_rx
    }

    /// Wait up to `timeout` for at least one packet, then drain what is queued.
    pub fn read_packets(&self, timeout: Duration) -> Vec<ReceivedPacket> {
        let mut packets = Vec::new();
        if let Ok(first) = self.packets_rx.recv_timeout(timeout) {
            packets.push(first);
            packets.extend(self.packets_rx.try_iter());
        }
        packets
    }

    fn request(&self, method: Method, uri: &str) -> RtspMessage {
        let request = RtspMessage::request(method, uri);
        match &self.session_id {
            Some(id) => request.add_header("Session", id.as_str()),
            None => request,
        }
    }

    fn ensure_success(method: &Method, response: &RtspMessage) -> Result<()> {
        if response.is_success() {
            return Ok(());
        }
        tracing::warn!(%method, status = ?response.status(), "request failed");
        Err(RtspError::Status {
            method: method.clone(),
            status: response.status().unwrap_or(0),
            reason: response.reason().unwrap_or("").to_string(),
        })
    }

    fn transition(&mut self, method: Method, response: &RtspMessage, state: SessionState) {
        let cseq = response.cseq().unwrap_or(0);
        tracing::debug!(%method, cseq, old_state = %self.state, new_state = %state, "client state transition");
        self.state = state;
        self.transitions.push(Transition { method, cseq, state });
    }

    fn require_state(&self, method: Method, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(RtspError::InvalidState {
                method,
                state: self.state,
            })
        }
    }

    fn adopt_session(&mut self, response: &RtspMessage) {
        if let Some(id) = response.session_id()
            && self.session_id.as_deref() != Some(id)
        {
            tracing::debug!(session_id = id, "session established");
            self.session_id = Some(id.to_string());
        }
        if let Some(timeout) = response.session_timeout() {
            self.session_timeout = timeout;
        }
    }

    /// OPTIONS: learn which methods the server supports. State is unchanged.
    pub fn options(&mut self) -> Result<Vec<String>> {
        self.require_state(
            Method::Options,
            &[
                SessionState::Init,
                SessionState::Described,
                SessionState::SetUp,
                SessionState::Playing,
                SessionState::Paused,
            ],
        )?;
        let response = self.control.exchange(self.request(Method::Options, &self.url))?;
        Self::ensure_success(&Method::Options, &response)?;

        let public: Vec<String> = response
            .header("Public")
            .unwrap_or("")
            .split(',')
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        self.supports_get_parameter = public
            .iter()
            .any(|m| m.eq_ignore_ascii_case(Method::GetParameter.as_str()));
        Ok(public)
    }

    /// DESCRIBE: fetch the SDP and return the media control URLs.
    pub fn describe(&mut self) -> Result<Vec<String>> {
        self.require_state(
            Method::Describe,
            &[SessionState::Init, SessionState::Described],
        )?;
        let request = self
            .request(Method::Describe, &self.url)
            .add_header("Accept", "application/sdp");
        let response = self.control.exchange(request)?;
        Self::ensure_success(&Method::Describe, &response)?;

        if let Some(base) = response.header("Content-Base") {
            self.base_url = base.trim().to_string();
        }
        let body = String::from_utf8_lossy(response.body()).into_owned();
        self.control_urls = sdp::control_urls(&body, &self.base_url);
        self.sdp = Some(body);

        self.transition(Method::Describe, &response, SessionState::Described);
        Ok(self.control_urls.clone())
    }

    /// SETUP one stream. Returns its index.
    ///
    /// Setting up a control URL again renegotiates that stream in place;
    /// interleaved channels it already holds are requested again.
    pub fn setup(&mut self, control_url: &str) -> Result<usize> {
        self.require_state(
            Method::Setup,
            &[
                SessionState::Init,
                SessionState::Described,
                SessionState::SetUp,
            ],
        )?;
        let index = self
            .streams
            .iter()
            .position(|s| s.control_url == control_url)
            .unwrap_or(self.streams.len());

        let (stream, response) = match self.config.transport {
            TransportPreference::Udp => match self.setup_udp(control_url, index)? {
                Some(negotiated) => negotiated,
                None => {
                    tracing::warn!(control_url, "UDP transport not usable, falling back to TCP-interleaved");
                    self.setup_interleaved(control_url, index)?
                }
            },
            TransportPreference::Tcp => self.setup_interleaved(control_url, index)?,
        };

        tracing::info!(
            control_url,
            stream = index,
            transport = %stream.transport,
            session_id = self.session_id.as_deref().unwrap_or(""),
            "stream set up"
        );
        match self.streams.get_mut(index) {
            Some(existing) => *existing = stream,
            None => self.streams.push(stream),
        }
        self.transition(Method::Setup, &response, SessionState::SetUp);
        Ok(index)
    }

    /// Try a UDP SETUP. `Ok(None)` means: fall back to interleaved.
    fn setup_udp(&mut self, control_url: &str, index: usize) -> Result<Option<(Stream, RtspMessage)>> {
        let pair = UdpPair::bind_ephemeral(self.local_ip)?;
        let (rtp, rtcp) = pair.ports()?;
        let request = self
            .request(Method::Setup, control_url)
            .add_header("Transport", TransportDescriptor::udp(rtp, rtcp).build());
        let response = self.control.exchange(request)?;

        if response.status() == Some(461) {
            return Ok(None);
        }
        Self::ensure_success(&Method::Setup, &response)?;
        self.adopt_session(&response);

        let transport = self.response_transport(&response)?;
        let Some((_, server_rtcp)) = transport.server_port else {
            return Ok(None);
        };
        if transport.is_interleaved() || transport.ssrc.is_none() {
            return Ok(None);
        }

        self.channels.lock().release(&index);
        let udp = UdpReceiver::spawn(pair, index, self.packets_tx.clone())?;
        let stream = Stream {
            control_url: control_url.to_string(),
            server_rtcp: Some(SocketAddr::new(self.peer_ip, server_rtcp)),
            transport,
            udp: Some(udp),
        };
        Ok(Some((stream, response)))
    }

    fn setup_interleaved(&mut self, control_url: &str, index: usize) -> Result<(Stream, RtspMessage)> {
        let requested = {
            let channels = self.channels.lock();
            match channels.channels_of(&index) {
                Some(pair) => pair,
                None => channels.next_free_pair().ok_or_else(|| {
                    RtspError::Negotiation("no free interleaved channels".to_string())
                })?,
            }
        };

        let request = self.request(Method::Setup, control_url).add_header(
            "Transport",
            TransportDescriptor::interleaved(requested.0, requested.1).build(),
        );
        let response = self.control.exchange(request)?;
        if response.status() == Some(461) {
            return Err(RtspError::Negotiation(format!(
                "server supports neither UDP nor TCP-interleaved for {}",
                control_url
            )));
        }
        Self::ensure_success(&Method::Setup, &response)?;
        self.adopt_session(&response);

        let transport = self.response_transport(&response)?;
        let assigned = transport.interleaved.unwrap_or(requested);
        {
            let mut channels = self.channels.lock();
            channels.release(&index);
            channels.assign(assigned, index).map_err(|channel| {
                RtspError::Negotiation(format!("server assigned busy channel {}", channel))
            })?;
        }
        if assigned != requested {
            tracing::debug!(requested = ?requested, ?assigned, "adopted server channels");
        }

        let stream = Stream {
            control_url: control_url.to_string(),
            transport,
            udp: None,
            server_rtcp: None,
        };
        Ok((stream, response))
    }

    fn response_transport(&self, response: &RtspMessage) -> Result<TransportDescriptor> {
        let header = response.header("Transport").ok_or_else(|| {
            RtspError::protocol("SETUP response without Transport", Some(response.clone()))
        })?;
        TransportDescriptor::parse(header)
    }

    /// PLAY the whole presentation and arm the keep-alive timer.
    pub fn play(&mut self) -> Result<()> {
        self.require_state(Method::Play, &[SessionState::SetUp, SessionState::Paused])?;
        let request = self
            .request(Method::Play, &self.base_url)
            .add_header("Range", "npt=0.000-");
        let response = self.control.exchange(request)?;
        Self::ensure_success(&Method::Play, &response)?;
        self.adopt_session(&response);

        self.transition(Method::Play, &response, SessionState::Playing);
        if self.keepalive.is_none() {
            self.arm_keepalive()?;
        }
        Ok(())
    }

    fn arm_keepalive(&mut self) -> Result<()> {
        let interval = Duration::from_secs(self.session_timeout.max(2)) / 2;
        let method = if self.supports_get_parameter {
            Method::GetParameter
        } else {
            Method::Options
        };
        let control = self.control.clone();
        let request = self.request(method.clone(), &self.base_url);

        self.keepalive = Some(KeepAlive::start(interval, move || {
            let response = control.exchange(request.clone())?;
            Self::ensure_success(&method, &response)
        })?);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        self.require_state(Method::Pause, &[SessionState::Playing])?;
        let response = self
            .control
            .exchange(self.request(Method::Pause, &self.base_url))?;
        Self::ensure_success(&Method::Pause, &response)?;
        self.transition(Method::Pause, &response, SessionState::Paused);
        Ok(())
    }

    /// TEARDOWN the session. The client ends up `TornDown` even if the
    /// server answers with an error, which is still returned.
    pub fn teardown(&mut self) -> Result<()> {
        if self.state == SessionState::TornDown {
            return Err(RtspError::InvalidState {
                method: Method::Teardown,
                state: self.state,
            });
        }
        if let Some(mut keepalive) = self.keepalive.take() {
            keepalive.stop();
        }

        // Without a session there is nothing to tear down on the server.
        let outcome = self.session_id.as_ref().map(|_| {
            self.control
                .exchange(self.request(Method::Teardown, &self.base_url))
                .and_then(|response| {
                    Self::ensure_success(&Method::Teardown, &response).map(|()| response)
                })
        });

        self.release_streams();
        match outcome {
            None => {
                self.state = SessionState::TornDown;
                Ok(())
            }
            Some(Ok(response)) => {
                self.transition(Method::Teardown, &response, SessionState::TornDown);
                tracing::info!(url = %self.url, "session torn down");
                Ok(())
            }
            Some(Err(e)) => {
                self.state = SessionState::TornDown;
                Err(e)
            }
        }
    }

    fn release_streams(&mut self) {
        for (index, mut stream) in self.streams.drain(..).enumerate() {
            if let Some(udp) = stream.udp.as_mut() {
                udp.stop();
            }
            self.channels.lock().release(&index);
            tracing::trace!(control_url = %stream.control_url, "stream released");
        }
    }

    /// Send an empty RTCP receiver report on stream `index`.
    pub fn send_report(&self, index: usize) -> Result<()> {
        let stream = self
            .streams
            .get(index)
            .ok_or_else(|| RtspError::TransportNotConfigured(format!("stream {}", index)))?;
        let report = rtcp::empty_receiver_report(self.ssrc);

        match (&stream.udp, stream.server_rtcp, stream.transport.interleaved) {
            (Some(udp), Some(server_rtcp), _) => {
                udp.rtcp.send_to(&report, server_rtcp)?;
            }
            (_, _, Some((_, control_channel))) => {
                let channel = self
                    .channels
                    .lock()
                    .channels_of(&index)
                    .map_or(control_channel, |(_, control)| control);
                self.control.send_frame(channel, &report)?;
            }
            _ => return Err(RtspError::TransportNotConfigured(stream.control_url.clone())),
        }
        Ok(())
    }
}

impl Drop for RtspClient {
    fn drop(&mut self) {
        self.keepalive.take();
        self.release_streams();
        self.reader_stop.store(true, Ordering::SeqCst);
        let _ = self.shutdown.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    type Reply = Box<dyn FnMut(&RtspMessage) -> Vec<u8> + Send>;

    /// Serve one connection, answering each request with `reply`.
    fn scripted_peer(mut reply: Reply) -> (String, JoinHandle<Vec<RtspMessage>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("rtsp://{}/live", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut demuxer = Demuxer::new();
            let mut seen = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return seen,
                    Ok(n) => n,
                };
                demuxer.feed(&buf[..n]);
                while let Demuxed::Message(request) = demuxer.poll() {
                    let bytes = reply(&request);
                    seen.push(request);
                    if stream.write_all(&bytes).is_err() {
                        return seen;
                    }
                }
            }
        });
        (url, handle)
    }

    fn ok(request: &RtspMessage) -> RtspMessage {
        RtspMessage::ok().add_header("CSeq", request.cseq().unwrap_or(0).to_string())
    }

    #[test]
    fn parses_urls() {
        let url = RtspUrl::parse("rtsp://user:pa:ss@camera.local:8554/live/main").unwrap();
        assert_eq!(url.url, "rtsp://camera.local:8554/live/main");
        assert_eq!(url.host, "camera.local");
        assert_eq!(url.port, 8554);
        assert_eq!(url.credentials, Some(Credentials::new("user", "pa:ss")));

        let url = RtspUrl::parse("RTSP://[::1]/x").unwrap();
        assert_eq!((url.host.as_str(), url.port), ("::1", 554));

        assert!(RtspUrl::parse("http://host/").is_err());
        assert!(RtspUrl::parse("rtsp://host:notaport/").is_err());
        assert!(RtspUrl::parse("rtsp:///path").is_err());
    }

    #[test]
    fn single_server_port_falls_back_to_interleaved() {
        let (url, peer) = scripted_peer(Box::new(|request| {
            let transport = request.header("Transport").unwrap_or("");
            if !transport.contains("interleaved") {
                return ok(request)
                    .add_header("Session", "ABC;timeout=30")
                    .add_header("Transport", "RTP/AVP;unicast;server_port=5000")
                    .serialize();
            }
            let mut bytes = ok(request)
                .add_header("Session", "ABC;timeout=30")
                .add_header("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1;ssrc=0A0B0C0D")
                .serialize();
            bytes.extend_from_slice(b"$\x00\x00\x03abc");
            bytes
        }));

        let mut client = RtspClient::connect(&url, ClientConfig::default()).unwrap();
        let index = client.setup(&format!("{}/track1", url)).unwrap();
        assert_eq!(index, 0);
        assert_eq!(client.state(), SessionState::SetUp);
        assert_eq!(client.session_id(), Some("ABC"));
        assert_eq!(client.session_timeout(), 30);

        let transport = client.stream_transport(0).unwrap();
        assert_eq!(transport.interleaved, Some((0, 1)));
        assert_eq!(transport.ssrc, Some(0x0A0B_0C0D));

        let packets = client.read_packets(Duration::from_secs(2));
        assert_eq!(
            packets,
            vec![ReceivedPacket {
                stream: 0,
                kind: PacketKind::Media,
                channel: Some(0),
                payload: b"abc".to_vec(),
            }]
        );

        drop(client);
        let seen = peer.join().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].cseq(), Some(1));
        assert_eq!(seen[1].cseq(), Some(2));
        assert_eq!(seen[1].header("Session"), Some("ABC"));
    }

    #[test]
    fn unsupported_udp_falls_back_to_interleaved() {
        let (url, peer) = scripted_peer(Box::new(|request| {
            let transport = request.header("Transport").unwrap_or("");
            if !transport.contains("interleaved") {
                return RtspMessage::unsupported_transport()
                    .add_header("CSeq", request.cseq().unwrap_or(0).to_string())
                    .serialize();
            }
            ok(request)
                .add_header("Session", "XYZ;timeout=60")
                .add_header("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1;ssrc=16909060")
                .serialize()
        }));

        let mut client = RtspClient::connect(&url, ClientConfig::default()).unwrap();
        assert_eq!(client.setup(&format!("{}/track1", url)).unwrap(), 0);
        assert_eq!(client.session_id(), Some("XYZ"));
        let transport = client.stream_transport(0).unwrap();
        assert_eq!(transport.interleaved, Some((0, 1)));
        assert_eq!(transport.ssrc, Some(0x0102_0304));

        drop(client);
        let seen = peer.join().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].header("Transport").unwrap().contains("client_port="));
        assert!(seen[1].header("Transport").unwrap().contains("interleaved=0-1"));
        // The rejected SETUP established no session to carry over.
        assert_eq!(seen[1].header("Session"), None);
    }

    #[test]
    fn udp_reply_without_ssrc_falls_back_in_same_session() {
        let (url, peer) = scripted_peer(Box::new(|request| {
            let transport = request.header("Transport").unwrap_or("");
            let reply = ok(request).add_header("Session", "ABC;timeout=30");
            if !transport.contains("interleaved") {
                return reply
                    .add_header("Transport", "RTP/AVP;unicast;client_port=6970-6971;server_port=5000-5001")
                    .serialize();
            }
            reply
                .add_header("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1;ssrc=0A0B0C0D")
                .serialize()
        }));

        let mut client = RtspClient::connect(&url, ClientConfig::default()).unwrap();
        client.setup(&format!("{}/track1", url)).unwrap();
        assert!(client.stream_transport(0).unwrap().is_interleaved());
        assert_eq!(client.session_id(), Some("ABC"));

        drop(client);
        let seen = peer.join().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].header("Transport").unwrap().contains("interleaved="));
        assert_eq!(seen[1].header("Session"), Some("ABC"));
    }

    #[test]
    fn repeated_setup_reuses_assigned_channels() {
        let (url, peer) = scripted_peer(Box::new(|request| {
            ok(request)
                .add_header("Session", "S1;timeout=60")
                .add_header("Transport", "RTP/AVP/TCP;unicast;interleaved=2-3;ssrc=1")
                .serialize()
        }));
        let config = ClientConfig {
            transport: TransportPreference::Tcp,
            ..ClientConfig::default()
        };

        let mut client = RtspClient::connect(&url, config).unwrap();
        let control = format!("{}/track1", url);
        assert_eq!(client.setup(&control).unwrap(), 0);
        assert_eq!(client.stream_transport(0).unwrap().interleaved, Some((2, 3)));
        assert_eq!(client.setup(&control).unwrap(), 0);
        assert!(client.stream_transport(1).is_none());

        drop(client);
        let seen = peer.join().unwrap();
        assert!(seen[0].header("Transport").unwrap().contains("interleaved=0-1"));
        assert!(seen[1].header("Transport").unwrap().contains("interleaved=2-3"));
    }

    #[test]
    fn stray_marker_does_not_stall_later_responses() {
        let (url, _peer) = scripted_peer(Box::new(|request| {
            let mut bytes = ok(request).serialize();
            bytes.extend_from_slice(&[0x80, b'$', 0x00, 0xFF, 0xFF]);
            bytes
        }));
        let config = ClientConfig {
            read_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        };

        let mut client = RtspClient::connect(&url, config).unwrap();
        client.options().unwrap();
        client.options().unwrap();
    }

    #[test]
    fn stale_responses_are_skipped() {
        let (url, _peer) = scripted_peer(Box::new(|request| {
            let cseq = request.cseq().unwrap_or(0);
            let mut bytes = RtspMessage::ok()
                .add_header("CSeq", (cseq - 1).to_string())
                .serialize();
            bytes.extend(ok(request).add_header("Public", "OPTIONS, GET_PARAMETER").serialize());
            bytes
        }));

        let mut client = RtspClient::connect(&url, ClientConfig::default()).unwrap();
        let public = client.options().unwrap();
        assert_eq!(public, vec!["OPTIONS", "GET_PARAMETER"]);
        assert_eq!(client.state(), SessionState::Init);
        assert!(client.transitions().is_empty());
    }

    #[test]
    fn response_ahead_of_request_is_a_protocol_error() {
        let (url, _peer) = scripted_peer(Box::new(|_| {
            RtspMessage::ok().add_header("CSeq", "99").serialize()
        }));

        let mut client = RtspClient::connect(&url, ClientConfig::default()).unwrap();
        match client.options() {
            Err(RtspError::Protocol { message, .. }) => {
                assert_eq!(message.unwrap().cseq(), Some(99));
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn basic_challenge_is_answered_once() {
        let (url, peer) = scripted_peer(Box::new(|request| {
            let reply = match request.header("Authorization") {
                Some(header) if Credentials::new("u", "p").verify(header) => ok(request),
                _ => RtspMessage::unauthorized()
                    .add_header("CSeq", request.cseq().unwrap_or(0).to_string())
                    .add_header("WWW-Authenticate", auth::challenge("test")),
            };
            reply.serialize()
        }));

        let authed = url.replace("rtsp://", "rtsp://u:p@");
        let mut client = RtspClient::connect(&authed, ClientConfig::default()).unwrap();
        client.options().unwrap();
        drop(client);

        let seen = peer.join().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].header("Authorization").is_none());
        assert!(seen[1].header("Authorization").is_some());
    }

    #[test]
    fn missing_credentials_surface_unauthorized() {
        let (url, _peer) = scripted_peer(Box::new(|request| {
            RtspMessage::unauthorized()
                .add_header("CSeq", request.cseq().unwrap_or(0).to_string())
                .add_header("WWW-Authenticate", auth::challenge("test"))
                .serialize()
        }));

        let mut client = RtspClient::connect(&url, ClientConfig::default()).unwrap();
        assert!(matches!(client.options(), Err(RtspError::Unauthorized)));
    }

    #[test]
    fn methods_are_checked_against_state() {
        let (url, _peer) = scripted_peer(Box::new(|request| ok(request).serialize()));
        let mut client = RtspClient::connect(&url, ClientConfig::default()).unwrap();
        assert!(matches!(
            client.play(),
            Err(RtspError::InvalidState {
                state: SessionState::Init,
                ..
            })
        ));
        assert!(matches!(client.pause(), Err(RtspError::InvalidState { .. })));
        client.teardown().unwrap();
        assert_eq!(client.state(), SessionState::TornDown);
        assert!(client.teardown().is_err());
    }
}
