use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Result, RtspError};
use crate::packet::PacketKind;
use crate::protocol::auth::Credentials;
use crate::session::{
    DEFAULT_IDLE_TIMEOUT, DEFAULT_SESSION_TIMEOUT_SECS, DEFAULT_WORKER_GRACE, SessionManager,
    SessionPolicy,
};
use crate::transport::tcp;

/// Multicast group offered to clients that SETUP with `multicast`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastConfig {
    pub group: Ipv4Addr,
    /// Even RTP port; RTCP uses the next one.
    pub port: u16,
    pub ttl: u8,
}

/// Server-level configuration used by protocol handlers and sessions.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public host advertised in SDP `o=` and `c=` lines.
    /// When `None`, host is inferred from request URI/local address.
    pub public_host: Option<String>,
    /// SDP origin username field (`o=<username> ...`).
    pub sdp_username: String,
    /// SDP origin session id field (`o=... <session-id> ...`).
    pub sdp_session_id: String,
    /// SDP origin session version field (`o=... ... <session-version> ...`).
    pub sdp_session_version: String,
    /// SDP session name (`s=`).
    pub sdp_session_name: String,
    /// Media type of the offered track (`m=<media_kind> ...`).
    pub media_kind: String,
    /// RTP payload type of the offered track.
    pub payload_type: u8,
    /// Encoding name for `a=rtpmap`.
    pub encoding_name: String,
    /// RTP clock rate for `a=rtpmap`.
    pub clock_rate: u32,
    /// Timeout advertised in the `Session` header, in seconds.
    pub session_timeout_secs: u64,
    /// A session is evicted when neither a request nor an RTCP report
    /// arrived for this long.
    pub idle_timeout: Duration,
    /// How often the idle poller runs.
    pub idle_poll_interval: Duration,
    /// Minimum time between sender-report acknowledgements.
    pub report_interval: Duration,
    /// How long a session worker gets to stop before it is abandoned.
    pub worker_grace: Duration,
    /// Require HTTP Basic credentials on every request.
    pub credentials: Option<Credentials>,
    pub multicast: Option<MulticastConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_host: None,
            sdp_username: "-".to_string(),
            sdp_session_id: "0".to_string(),
            sdp_session_version: "0".to_string(),
            sdp_session_name: "Stream".to_string(),
            media_kind: "video".to_string(),
            payload_type: 96,
            encoding_name: "H264".to_string(),
            clock_rate: 90_000,
            session_timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            idle_poll_interval: Duration::from_secs(1),
            report_interval: Duration::from_secs(5),
            worker_grace: DEFAULT_WORKER_GRACE,
            credentials: None,
            multicast: None,
        }
    }
}

impl ServerConfig {
    fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            timeout_secs: self.session_timeout_secs,
            idle_timeout: self.idle_timeout,
            worker_grace: self.worker_grace,
        }
    }
}

/// High-level RTSP server orchestrator.
///
/// Owns the session registry and the two background loops: the TCP
/// accept loop ([`transport::tcp`](crate::transport::tcp)) and the idle
/// poller. Packets handed to [`send_packet`](Self::send_packet) are queued
/// on the session and sent by its worker.
pub struct Server {
    session_manager: SessionManager,
    running: Arc<AtomicBool>,
    bind_addr: String,
    local_addr: Option<SocketAddr>,
    config: Arc<ServerConfig>,
    threads: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn new(bind_addr: &str) -> Self {
        Self::with_config(bind_addr, ServerConfig::default())
    }

    /// Create a server with custom protocol/SDP configuration.
    pub fn with_config(bind_addr: &str, config: ServerConfig) -> Self {
        Self {
            session_manager: SessionManager::with_policy(config.session_policy()),
            running: Arc::new(AtomicBool::new(false)),
            bind_addr: bind_addr.to_string(),
            local_addr: None,
            config: Arc::new(config),
            threads: Vec::new(),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }

        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        self.running.store(true, Ordering::SeqCst);

        tracing::info!(addr = %local_addr, "RTSP server listening");

        let running = self.running.clone();
        let session_manager = self.session_manager.clone();
        let config = self.config.clone();
        let accept = thread::Builder::new()
            .name("rtsp-accept".to_string())
            .spawn(move || tcp::accept_loop(listener, session_manager, config, running));

        let running = self.running.clone();
        let session_manager = self.session_manager.clone();
        let interval = self.config.idle_poll_interval;
        let idle = thread::Builder::new()
            .name("rtsp-idle".to_string())
            .spawn(move || idle_loop(session_manager, interval, running));

        for spawned in [accept, idle] {
            match spawned {
                Ok(handle) => self.threads.push(handle),
                Err(e) => {
                    self.stop();
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    /// Stop the background loops and tear down every session.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        let removed = self.session_manager.shutdown_all();
        tracing::info!(sessions = removed, "server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to (resolves port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Queue a packet for one playing session.
    pub fn send_packet(&self, session_id: &str, kind: PacketKind, payload: &[u8]) -> Result<()> {
        if !self.is_running() {
            return Err(RtspError::NotStarted);
        }
        let session = self
            .session_manager
            .get_session(session_id)
            .ok_or_else(|| RtspError::SessionNotFound(session_id.to_string()))?;
        session.enqueue(kind, payload.to_vec())
    }

    /// Queue a packet for every playing session. Returns how many took it.
    pub fn broadcast_packet(&self, kind: PacketKind, payload: &[u8]) -> Result<usize> {
        if !self.is_running() {
            return Err(RtspError::NotStarted);
        }
        let mut delivered = 0;
        for session in self.session_manager.get_playing_sessions() {
            match session.enqueue(kind, payload.to_vec()) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::trace!(session_id = %session.id, error = %e, "broadcast skipped session"),
            }
        }
        Ok(delivered)
    }

    pub fn viewers(&self) -> Vec<Viewer> {
        self.session_manager
            .get_playing_sessions()
            .iter()
            .filter_map(|session| {
                session.transport().map(|transport| Viewer {
                    session_id: session.id.clone(),
                    uri: session.uri(),
                    client_addr: session.peer_addr,
                    transport: transport.build(),
                })
            })
            .collect()
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.session_manager
    }

    /// Returns the server's protocol configuration.
    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}

fn idle_loop(session_manager: SessionManager, interval: Duration, running: Arc<AtomicBool>) {
    let tick = interval.min(Duration::from_millis(50)).max(Duration::from_millis(1));
    let mut waited = Duration::ZERO;
    while running.load(Ordering::SeqCst) {
        thread::sleep(tick);
        waited += tick;
        if waited < interval {
            continue;
        }
        waited = Duration::ZERO;

        let evicted = session_manager.poll_idle();
        if !evicted.is_empty() {
            tracing::debug!(evicted = evicted.len(), remaining = session_manager.len(), "idle poll");
        }
    }
    tracing::debug!("idle poller exited");
}

/// Information about a connected viewer (session in PLAY state).
#[derive(Debug, Clone)]
pub struct Viewer {
    pub session_id: String,
    pub uri: String,
    pub client_addr: SocketAddr,
    /// Negotiated `Transport` header value.
    pub transport: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_resolves_ephemeral_port_and_stops() {
        let mut server = Server::new("127.0.0.1:0");
        assert!(matches!(
            server.send_packet("x", PacketKind::Media, b""),
            Err(RtspError::NotStarted)
        ));

        server.start().unwrap();
        assert!(server.is_running());
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert!(matches!(server.start(), Err(RtspError::AlreadyRunning)));
        assert!(matches!(
            server.send_packet("missing", PacketKind::Media, b""),
            Err(RtspError::SessionNotFound(_))
        ));
        assert_eq!(server.broadcast_packet(PacketKind::Media, b"x").unwrap(), 0);

        server.stop();
        assert!(!server.is_running());
    }
}
