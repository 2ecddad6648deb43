use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::packet::PacketKind;
use crate::protocol::auth;
use crate::protocol::sdp;
use crate::protocol::{Method, RtspMessage};
use crate::server::ServerConfig;
use crate::session::transport::CastMode;
use crate::session::{
    Delivery, Session, SessionManager, SessionState, TransportDescriptor, WorkerConfig,
};
use crate::transport::{ChannelMap, SharedWriter};

/// Realm advertised in `WWW-Authenticate` challenges.
pub const AUTH_REALM: &str = "rtsp-duplex";

type Handler = fn(&mut MethodHandler, &RtspMessage) -> RtspMessage;

/// Dispatch table. The `Public` and `Allow` headers are derived from it.
static METHODS: &[(Method, Handler)] = &[
    (Method::Options, MethodHandler::handle_options),
    (Method::Describe, MethodHandler::handle_describe),
    (Method::Setup, MethodHandler::handle_setup),
    (Method::Play, MethodHandler::handle_play),
    (Method::Pause, MethodHandler::handle_pause),
    (Method::Teardown, MethodHandler::handle_teardown),
    (Method::GetParameter, MethodHandler::handle_get_parameter),
];

/// Comma-separated list of supported methods.
pub fn public_methods() -> String {
    METHODS
        .iter()
        .map(|(method, _)| method.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Handles RTSP method requests for a single control connection.
///
/// The connection's session is created on accept. Interleaved channels
/// negotiated on this connection are tracked here so that inbound frames
/// can be routed and the sessions torn down when the connection drops.
pub struct MethodHandler {
    session_manager: SessionManager,
    config: Arc<ServerConfig>,
    peer_addr: SocketAddr,
    /// Local address of the control connection; UDP pairs bind here.
    local_ip: IpAddr,
    control: SharedWriter,
    session: Arc<Session>,
    channels: ChannelMap<String>,
    /// Sessions created or set up on this connection, for cleanup on disconnect.
    session_ids: Vec<String>,
}

impl MethodHandler {
    pub fn new(
        session_manager: SessionManager,
        config: Arc<ServerConfig>,
        peer_addr: SocketAddr,
        local_ip: IpAddr,
        control: SharedWriter,
    ) -> Self {
        let session = session_manager.accept(peer_addr);
        MethodHandler {
            session_ids: vec![session.id.clone()],
            session_manager,
            config,
            peer_addr,
            local_ip,
            control,
            session,
            channels: ChannelMap::new(),
        }
    }

    /// Session created for this connection (replaced after TEARDOWN or eviction).
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Returns session IDs owned by this connection.
    pub fn session_ids(&self) -> &[String] {
        &self.session_ids
    }

    /// Dispatch one request and build its response.
    pub fn handle(&mut self, request: &RtspMessage) -> RtspMessage {
        let Some(cseq) = request.header("CSeq").map(|v| v.trim().to_string()) else {
            tracing::warn!(peer = %self.peer_addr, "request missing CSeq header");
            return RtspMessage::bad_request();
        };

        let Some(method) = request.method().cloned() else {
            tracing::warn!(peer = %self.peer_addr, "response received on server connection");
            return RtspMessage::bad_request().add_header("CSeq", cseq);
        };

        if !self.authorized(request) {
            tracing::warn!(peer = %self.peer_addr, %method, "rejected unauthenticated request");
            return RtspMessage::unauthorized()
                .add_header("CSeq", cseq)
                .add_header("WWW-Authenticate", auth::challenge(AUTH_REALM));
        }

        self.touch(request);

        let response = match METHODS.iter().find(|(m, _)| *m == method) {
            Some((_, handler)) => handler(self, request),
            None => {
                tracing::warn!(%method, %cseq, "unsupported RTSP method");
                RtspMessage::method_not_allowed().add_header("Allow", public_methods())
            }
        };
        response.add_header("CSeq", cseq)
    }

    /// Route an inbound interleaved frame to the session owning its channel.
    pub fn route_frame(&self, channel: u8, payload: &[u8]) {
        let Some((id, kind)) = self.channels.lookup(channel) else {
            tracing::debug!(peer = %self.peer_addr, channel, len = payload.len(), "frame on unassigned channel");
            return;
        };
        match (kind, self.session_manager.get_session(id)) {
            (PacketKind::Control, Some(session)) => session.record_report(payload),
            (PacketKind::Media, Some(_)) => {
                tracing::trace!(session_id = %id, channel, len = payload.len(), "ignoring media from client");
            }
            (_, None) => tracing::debug!(session_id = %id, channel, "frame for removed session"),
        }
    }

    /// Tear down sessions that cannot outlive this connection.
    ///
    /// Interleaved sessions lose their transport with the connection and
    /// sessions that never set up a transport are dropped. UDP sessions
    /// stay registered until TEARDOWN or idle eviction.
    pub fn disconnect(&mut self) -> usize {
        let orphaned: Vec<String> = self
            .session_ids
            .drain(..)
            .filter(|id| {
                self.session_manager
                    .get_session(id)
                    .is_some_and(|s| s.transport().is_none_or(|t| t.is_interleaved()))
            })
            .collect();
        for id in &orphaned {
            self.channels.release(id);
        }
        self.session_manager.remove_sessions(&orphaned)
    }

    fn authorized(&self, request: &RtspMessage) -> bool {
        match &self.config.credentials {
            None => true,
            Some(credentials) => request
                .header("Authorization")
                .is_some_and(|header| credentials.verify(header)),
        }
    }

    fn touch(&self, request: &RtspMessage) {
        match request.session_id() {
            Some(id) => {
                if let Some(session) = self.session_manager.get_session(id) {
                    session.touch();
                }
            }
            None => self.session.touch(),
        }
    }

    /// The connection's session, replacing it if it was torn down or evicted.
    fn current_session(&mut self) -> Arc<Session> {
        let registered = self.session_manager.get_session(&self.session.id).is_some();
        if !registered || self.session.state() == SessionState::TornDown {
            self.channels.release(&self.session.id);
            self.session = self.session_manager.accept(self.peer_addr);
            self.session_ids.push(self.session.id.clone());
        }
        self.session.clone()
    }

    /// Session named by the `Session` header, or the connection's own.
    fn target_session(&mut self, request: &RtspMessage) -> Result<Arc<Session>, RtspMessage> {
        match request.session_id() {
            Some(_) => self.required_session(request),
            None => Ok(self.current_session()),
        }
    }

    fn required_session(&self, request: &RtspMessage) -> Result<Arc<Session>, RtspMessage> {
        let Some(id) = request.session_id() else {
            tracing::warn!(peer = %self.peer_addr, "request missing Session header");
            return Err(RtspMessage::session_not_found());
        };
        self.session_manager.get_session(id).ok_or_else(|| {
            tracing::warn!(session_id = id, "request for unknown session");
            RtspMessage::session_not_found()
        })
    }

    fn handle_options(&mut self, _request: &RtspMessage) -> RtspMessage {
        tracing::debug!(peer = %self.peer_addr, "OPTIONS");
        RtspMessage::ok().add_header("Public", public_methods())
    }

    /// Host for SDP: configured public host, else the request URI's host,
    /// else the client IP.
    fn advertised_host(&self, uri: &str) -> String {
        if let Some(host) = &self.config.public_host {
            return host.clone();
        }

        if let Some(after_scheme) = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
        {
            let authority = after_scheme.split('/').next().unwrap_or("");
            let host_port = authority.rsplit('@').next().unwrap_or(authority);
            let host = host_port.split(':').next().unwrap_or("").trim();
            if !host.is_empty() {
                return host.to_string();
            }
        }
        self.local_ip.to_string()
    }

    fn handle_describe(&mut self, request: &RtspMessage) -> RtspMessage {
        let uri = request.uri().unwrap_or("*").to_string();
        let session = match self.target_session(request) {
            Ok(session) => session,
            Err(response) => return response,
        };
        tracing::debug!(session_id = %session.id, uri, "DESCRIBE");

        session.set_uri(&uri);
        if session.state() == SessionState::Init {
            session.set_state(SessionState::Described);
        }

        let body = sdp::generate_sdp(&self.config, &self.advertised_host(&uri));
        RtspMessage::ok()
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", format!("{}/", uri.trim_end_matches('/')))
            .with_body(body)
    }

    fn handle_setup(&mut self, request: &RtspMessage) -> RtspMessage {
        let session = match self.target_session(request) {
            Ok(session) => session,
            Err(response) => return response,
        };

        if session.state() == SessionState::Playing {
            tracing::warn!(session_id = %session.id, "SETUP while playing");
            return RtspMessage::method_not_valid_in_state()
                .add_header("Session", session.session_header_value());
        }

        let Some(header) = request.header("Transport") else {
            tracing::warn!(session_id = %session.id, "SETUP missing Transport header");
            return RtspMessage::bad_request();
        };

        let requested = match TransportDescriptor::parse(header) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(session_id = %session.id, transport = header, error = %e, "SETUP invalid Transport header");
                return RtspMessage::unsupported_transport();
            }
        };

        let negotiated = if requested.is_multicast() {
            self.setup_multicast(&session, &requested)
        } else if let Some(channels) = requested.interleaved {
            self.setup_interleaved(&session, channels)
        } else {
            self.setup_udp(&session, &requested)
        };
        let (descriptor, delivery) = match negotiated {
            Ok(negotiated) => negotiated,
            Err(response) => return response,
        };

        let worker = WorkerConfig {
            ssrc: session.ssrc,
            report_interval: self.config.report_interval,
        };
        if let Err(e) = session.configure(
            descriptor.clone(),
            delivery,
            worker,
            self.config.worker_grace,
        ) {
            tracing::error!(session_id = %session.id, error = %e, "failed to start session worker");
            return RtspMessage::internal_error();
        }

        if let Some(uri) = request.uri() {
            session.set_uri(uri);
        }
        if matches!(session.state(), SessionState::Init | SessionState::Described) {
            session.set_state(SessionState::SetUp);
        }
        if !self.session_ids.contains(&session.id) {
            self.session_ids.push(session.id.clone());
        }

        tracing::info!(
            session_id = %session.id,
            peer = %self.peer_addr,
            transport = %descriptor,
            "session set up"
        );

        RtspMessage::ok()
            .add_header("Transport", descriptor.build())
            .add_header("Session", session.session_header_value())
    }

    fn setup_interleaved(
        &mut self,
        session: &Session,
        requested: (u8, u8),
    ) -> Result<(TransportDescriptor, Delivery), RtspMessage> {
        let manager = &self.session_manager;
        let stale = self.channels.retain_owners(|id| manager.get_session(id).is_some());
        if stale > 0 {
            tracing::debug!(peer = %self.peer_addr, stale, "freed channels of removed sessions");
        }
        self.channels.release(&session.id);

        let channels = if self.channels.assign(requested, session.id.clone()).is_ok() {
            requested
        } else {
            let Some(pair) = self.channels.next_free_pair() else {
                tracing::warn!(session_id = %session.id, "no free interleaved channels");
                return Err(RtspMessage::unsupported_transport());
            };
            if self.channels.assign(pair, session.id.clone()).is_err() {
                return Err(RtspMessage::internal_error());
            }
            tracing::debug!(
                session_id = %session.id,
                requested = ?requested,
                assigned = ?pair,
                "interleaved channels busy, reassigned"
            );
            pair
        };

        let descriptor = TransportDescriptor {
            interleaved: Some(channels),
            ssrc: Some(session.ssrc),
            ..TransportDescriptor::default()
        };
        let delivery = Delivery::Interleaved {
            writer: self.control.clone(),
            channels,
        };
        Ok((descriptor, delivery))
    }

    fn setup_udp(
        &mut self,
        session: &Session,
        requested: &TransportDescriptor,
    ) -> Result<(TransportDescriptor, Delivery), RtspMessage> {
        let Some((client_rtp, client_rtcp)) = requested.client_port else {
            tracing::warn!(session_id = %session.id, "UDP SETUP without client_port");
            return Err(RtspMessage::unsupported_transport());
        };
        self.channels.release(&session.id);

        let sockets = self
            .session_manager
            .allocate_udp_pair(self.local_ip)
            .map_err(|e| {
                tracing::error!(session_id = %session.id, error = %e, "failed to allocate server ports");
                RtspMessage::internal_error()
            })?;
        let server_port = sockets.ports().map_err(|_| RtspMessage::internal_error())?;

        let peer_ip = self.peer_addr.ip();
        let descriptor = TransportDescriptor {
            client_port: Some((client_rtp, client_rtcp)),
            server_port: Some(server_port),
            ssrc: Some(session.ssrc),
            ..TransportDescriptor::default()
        };
        let delivery = Delivery::Udp {
            sockets,
            peer_rtp: SocketAddr::new(peer_ip, client_rtp),
            peer_rtcp: SocketAddr::new(peer_ip, client_rtcp),
        };
        Ok((descriptor, delivery))
    }

    fn setup_multicast(
        &mut self,
        session: &Session,
        requested: &TransportDescriptor,
    ) -> Result<(TransportDescriptor, Delivery), RtspMessage> {
        let Some(multicast) = self.config.multicast.clone() else {
            tracing::warn!(session_id = %session.id, "multicast requested but not configured");
            return Err(RtspMessage::unsupported_transport());
        };
        self.channels.release(&session.id);

        let sockets = self
            .session_manager
            .allocate_udp_pair(self.local_ip)
            .map_err(|e| {
                tracing::error!(session_id = %session.id, error = %e, "failed to allocate server ports");
                RtspMessage::internal_error()
            })?;
        let ttl = requested.ttl.map_or(multicast.ttl, |ttl| ttl.min(multicast.ttl));
        for socket in [&sockets.rtp, &sockets.rtcp] {
            socket
                .set_multicast_ttl_v4(u32::from(ttl))
                .map_err(|_| RtspMessage::internal_error())?;
        }
        let server_port = sockets.ports().map_err(|_| RtspMessage::internal_error())?;

        let group = IpAddr::V4(multicast.group);
        let ports = (multicast.port, multicast.port.saturating_add(1));
        let descriptor = TransportDescriptor {
            mode: CastMode::Multicast,
            client_port: Some(ports),
            server_port: Some(server_port),
            ssrc: Some(session.ssrc),
            ttl: Some(ttl),
            destination: Some(group.to_string()),
            ..TransportDescriptor::default()
        };
        let delivery = Delivery::Udp {
            sockets,
            peer_rtp: SocketAddr::new(group, ports.0),
            peer_rtcp: SocketAddr::new(group, ports.1),
        };
        Ok((descriptor, delivery))
    }

    fn handle_play(&mut self, request: &RtspMessage) -> RtspMessage {
        let session = match self.required_session(request) {
            Ok(session) => session,
            Err(response) => return response,
        };

        match session.state() {
            SessionState::SetUp | SessionState::Paused | SessionState::Playing => {}
            state => {
                tracing::warn!(session_id = %session.id, %state, "PLAY before SETUP");
                return RtspMessage::method_not_valid_in_state()
                    .add_header("Session", session.session_header_value());
            }
        }

        session.set_state(SessionState::Playing);
        tracing::info!(session_id = %session.id, "session started playing");

        RtspMessage::ok()
            .add_header("Session", session.session_header_value())
            .add_header("Range", "npt=0.000-")
            .add_header("RTP-Info", format!("url={}", session.uri()))
    }

    fn handle_pause(&mut self, request: &RtspMessage) -> RtspMessage {
        let session = match self.required_session(request) {
            Ok(session) => session,
            Err(response) => return response,
        };

        match session.state() {
            SessionState::Playing | SessionState::Paused => {}
            state => {
                tracing::warn!(session_id = %session.id, %state, "PAUSE while not playing");
                return RtspMessage::method_not_valid_in_state()
                    .add_header("Session", session.session_header_value());
            }
        }

        session.set_state(SessionState::Paused);
        tracing::info!(session_id = %session.id, "session paused");
        RtspMessage::ok().add_header("Session", session.session_header_value())
    }

    fn handle_teardown(&mut self, request: &RtspMessage) -> RtspMessage {
        let session = match self.required_session(request) {
            Ok(session) => session,
            Err(response) => return response,
        };

        self.channels.release(&session.id);
        self.session_ids.retain(|id| *id != session.id);
        self.session_manager.remove_session(&session.id);
        tracing::info!(session_id = %session.id, "session terminated via TEARDOWN");
        RtspMessage::ok()
    }

    /// GET_PARAMETER is used by clients as a keepalive (RFC 2326 §10.8).
    fn handle_get_parameter(&mut self, request: &RtspMessage) -> RtspMessage {
        tracing::trace!(peer = %self.peer_addr, "GET_PARAMETER keepalive");

        match request.session_id() {
            Some(_) => match self.required_session(request) {
                Ok(session) => RtspMessage::ok().add_header("Session", session.session_header_value()),
                Err(response) => response,
            },
            None => RtspMessage::ok(),
        }
    }
}
