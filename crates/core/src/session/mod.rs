//! RTSP session management (RFC 2326 §3, §12.37).
//!
//! On the server a session is created when a control connection is
//! accepted and lives until TEARDOWN or idle eviction. It tracks:
//!
//! - A unique session ID (16 hex digits, returned in the `Session` header).
//! - The control state (shared with the client state machine).
//! - The transport negotiated during SETUP and the worker that pumps
//!   packets onto it.
//! - Two liveness signals: the last control request and the last RTCP
//!   report. A session is idle only when both are older than the window.
//!
//! ## Session lifecycle (RFC 2326 §A.1)
//!
//! ```text
//! accept         -> Init
//! DESCRIBE       -> Described
//! SETUP          -> SetUp     (worker started)
//! PLAY           -> Playing
//! PAUSE          -> Paused    (from Playing)
//! PLAY           -> Playing   (from Paused)
//! TEARDOWN       -> TornDown  (worker joined, removed)
//! idle timeout   -> TornDown  (BYE sent, worker joined, removed)
//! ```

pub mod transport;
pub mod worker;

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::RngExt;

use crate::error::{Result, RtspError};
use crate::packet::PacketKind;
use crate::transport::udp::UdpPair;
pub use transport::TransportDescriptor;
pub use worker::{Delivery, Liveness, OutboundPacket, PacketQueue, SessionWorker, WorkerConfig};

const SERVER_PORT_MIN: u64 = 5000;
const SERVER_PORT_MAX: u64 = 65534;

/// Default session timeout in seconds (RFC 2326 §12.37).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

/// Default idle-eviction window.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default time a worker gets to stop before it is abandoned.
pub const DEFAULT_WORKER_GRACE: Duration = Duration::from_secs(2);

/// RTSP session state machine (RFC 2326 §A.1), shared by client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Init,
    Described,
    SetUp,
    Playing,
    Paused,
    TornDown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "Init",
            SessionState::Described => "Described",
            SessionState::SetUp => "SetUp",
            SessionState::Playing => "Playing",
            SessionState::Paused => "Paused",
            SessionState::TornDown => "TornDown",
        };
        f.write_str(name)
    }
}

/// A single server-side RTSP session.
///
/// Interior mutability lets the connection thread, the idle poller and
/// the server API share it through an `Arc`.
pub struct Session {
    /// Unique session identifier (16-char hex string).
    pub id: String,
    /// Address of the control connection that created the session.
    pub peer_addr: SocketAddr,
    /// SSRC used for everything the server sends on this session.
    pub ssrc: u32,
    /// Timeout advertised in the `Session` header.
    pub timeout_secs: u64,
    uri: RwLock<String>,
    state: RwLock<SessionState>,
    transport: RwLock<Option<TransportDescriptor>>,
    liveness: Arc<Liveness>,
    queue: Arc<PacketQueue>,
    reports: Mutex<Option<Sender<Vec<u8>>>>,
    worker: Mutex<Option<SessionWorker>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .field("transport", &self.transport())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session with a random ID and SSRC.
    pub fn new(peer_addr: SocketAddr, timeout_secs: u64) -> Self {
        Session {
            id: format!("{:016X}", rand::rng().random::<u64>()),
            peer_addr,
            ssrc: rand::rng().random::<u32>(),
            timeout_secs,
            uri: RwLock::new(String::new()),
            state: RwLock::new(SessionState::Init),
            transport: RwLock::new(None),
            liveness: Arc::new(Liveness::new()),
            queue: Arc::new(PacketQueue::new()),
            reports: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Transition to a new control state.
    pub fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        let old_state = *current;
        tracing::debug!(session_id = %self.id, %old_state, new_state = %state, "state transition");
        *current = state;
    }

    /// Whether this session is actively receiving media.
    pub fn is_playing(&self) -> bool {
        *self.state.read() == SessionState::Playing
    }

    pub fn uri(&self) -> String {
        self.uri.read().clone()
    }

    pub fn set_uri(&self, uri: &str) {
        *self.uri.write() = uri.to_string();
    }

    /// Returns a clone of the negotiated transport, if configured.
    pub fn transport(&self) -> Option<TransportDescriptor> {
        self.transport.read().clone()
    }

    /// Record a control request for the idle policy.
    pub fn touch(&self) {
        self.liveness.touch_request();
    }

    /// Time since the most recent request or report.
    pub fn idle_for(&self, now: Instant) -> Duration {
        self.liveness.idle_for(now)
    }

    /// Hand an inbound RTCP packet (received interleaved) to the worker.
    pub fn record_report(&self, packet: &[u8]) {
        self.liveness.touch_report();
        if let Some(reports) = self.reports.lock().as_ref() {
            let _ = reports.send(packet.to_vec());
        }
    }

    /// Install a negotiated transport and start its worker.
    ///
    /// A previous worker, if any, is stopped first.
    pub fn configure(
        &self,
        descriptor: TransportDescriptor,
        delivery: Delivery,
        config: WorkerConfig,
        grace: Duration,
    ) -> Result<()> {
        self.stop_worker(grace);

        let (reports_tx, reports_rx) = mpsc::channel();
        let worker = SessionWorker::spawn(
            &self.id,
            delivery,
            self.queue.clone(),
            reports_rx,
            self.liveness.clone(),
            config,
        )?;

        tracing::debug!(session_id = %self.id, transport = %descriptor, "transport configured");
        *self.reports.lock() = Some(reports_tx);
        *self.worker.lock() = Some(worker);
        *self.transport.write() = Some(descriptor);
        Ok(())
    }

    /// Queue a packet for the worker.
    pub fn enqueue(&self, kind: PacketKind, payload: Vec<u8>) -> Result<()> {
        if self.worker.lock().is_none() {
            return Err(RtspError::TransportNotConfigured(self.id.clone()));
        }
        if !self.is_playing() {
            return Err(RtspError::SessionNotPlaying(self.id.clone()));
        }
        self.queue.push(OutboundPacket { kind, payload });
        Ok(())
    }

    /// Stop the worker (sending BYE) and mark the session torn down.
    pub fn shutdown(&self, grace: Duration) {
        self.stop_worker(grace);
        self.set_state(SessionState::TornDown);
    }

    fn stop_worker(&self, grace: Duration) {
        *self.reports.lock() = None;
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.shutdown(grace);
        }
    }

    /// Format the `Session` response header value per RFC 2326 §12.37.
    ///
    /// Example: `"00000000000000A1;timeout=60"`
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout_secs)
    }
}

/// Registry limits applied to every session.
#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    pub timeout_secs: u64,
    pub idle_timeout: Duration,
    pub worker_grace: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            worker_grace: DEFAULT_WORKER_GRACE,
        }
    }
}

/// Thread-safe registry of active sessions.
///
/// Backed by `parking_lot::RwLock`: lookups happen on every request and
/// every packet send, inserts only on accept.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    next_server_port: Arc<AtomicU64>,
    policy: SessionPolicy,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_policy(SessionPolicy::default())
    }

    pub fn with_policy(policy: SessionPolicy) -> Self {
        SessionManager {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_server_port: Arc::new(AtomicU64::new(SERVER_PORT_MIN)),
            policy,
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Create and register a session for a newly accepted connection.
    pub fn accept(&self, peer_addr: SocketAddr) -> Arc<Session> {
        let session = Arc::new(Session::new(peer_addr, self.policy.timeout_secs));
        let total = {
            let mut sessions = self.sessions.write();
            sessions.insert(session.id.clone(), session.clone());
            sessions.len()
        };
        tracing::debug!(session_id = %session.id, %peer_addr, total_sessions = total, "session created");
        session
    }

    /// Look up a session by ID.
    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Remove a session and stop its worker.
    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let (removed, total) = {
            let mut sessions = self.sessions.write();
            (sessions.remove(id), sessions.len())
        };
        if let Some(session) = &removed {
            session.shutdown(self.policy.worker_grace);
            tracing::debug!(session_id = %id, total_sessions = total, "session removed");
        }
        removed
    }

    /// Remove multiple sessions at once (used during disconnect cleanup).
    pub fn remove_sessions(&self, ids: &[String]) -> usize {
        let removed: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &removed {
            session.shutdown(self.policy.worker_grace);
        }
        if !removed.is_empty() {
            tracing::debug!(removed = removed.len(), remaining = self.len(), "batch session cleanup");
        }
        removed.len()
    }

    /// Evict sessions idle longer than the policy window.
    pub fn poll_idle(&self) -> Vec<String> {
        self.poll_idle_at(Instant::now())
    }

    /// [`poll_idle`](Self::poll_idle) against an explicit clock reading.
    ///
    /// Each evicted ID is returned exactly once: the session is gone from
    /// the registry before its worker is stopped.
    pub fn poll_idle_at(&self, now: Instant) -> Vec<String> {
        let idle = self.policy.idle_timeout;
        let evicted: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write();
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| s.idle_for(now) > idle)
                .map(|s| s.id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        for session in &evicted {
            tracing::info!(session_id = %session.id, idle_secs = idle.as_secs(), "session evicted after idle timeout");
            session.shutdown(self.policy.worker_grace);
        }
        evicted.iter().map(|s| s.id.clone()).collect()
    }

    /// Bind a fresh RTP/RTCP socket pair for a UDP session.
    ///
    /// Ports come from a monotonic counter starting at 5000 that wraps at
    /// the top of the range; ports already in use are skipped. Per RFC 3550
    /// §11, RTP ports are even and RTCP = RTP + 1.
    pub fn allocate_udp_pair(&self, ip: IpAddr) -> Result<UdpPair> {
        let attempts = (SERVER_PORT_MAX - SERVER_PORT_MIN) / 2;
        for _ in 0..attempts {
            let mut rtp = self.next_server_port.fetch_add(2, Ordering::SeqCst);
            if rtp > SERVER_PORT_MAX - 1 {
                tracing::debug!(rtp, restart = SERVER_PORT_MIN, "server port range wrapped");
                self.next_server_port.store(SERVER_PORT_MIN + 2, Ordering::SeqCst);
                rtp = SERVER_PORT_MIN;
            }

            match UdpPair::bind(ip, rtp as u16) {
                Ok(pair) => {
                    tracing::trace!(rtp_port = rtp, rtcp_port = rtp + 1, "allocated server ports");
                    return Ok(pair);
                }
                Err(e) => tracing::trace!(rtp_port = rtp, error = %e, "server port pair busy"),
            }
        }
        tracing::error!("no free server port pair");
        Err(RtspError::PortRangeExhausted)
    }

    /// Returns all sessions currently in the [`SessionState::Playing`] state.
    pub fn get_playing_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_playing())
            .cloned()
            .collect()
    }

    /// Stop and remove every session.
    pub fn shutdown_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        self.remove_sessions(&ids)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
