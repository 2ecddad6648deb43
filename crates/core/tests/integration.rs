//! Integration tests: a real server on an ephemeral port driven by the
//! client over UDP and TCP-interleaved transports.

use std::thread;
use std::time::{Duration, Instant};

use rtsp::client::TransportPreference;
use rtsp::packet::rtcp;
use rtsp::packet::rtp::RtpHeader;
use rtsp::protocol::{Credentials, Method};
use rtsp::{ClientConfig, PacketKind, RtspClient, RtspError, Server, ServerConfig, SessionState};

fn start(config: ServerConfig) -> (Server, String) {
    let mut server = Server::with_config("127.0.0.1:0", config);
    server.start().expect("server start");
    let addr = server.local_addr().expect("bound address");
    (server, format!("rtsp://{}/live", addr))
}

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn tcp() -> ClientConfig {
    ClientConfig {
        transport: TransportPreference::Tcp,
        ..ClientConfig::default()
    }
}

#[test]
fn udp_session_walks_the_state_machine() {
    let (mut server, url) = start(ServerConfig::default());
    let mut client = RtspClient::connect(&url, ClientConfig::default()).expect("connect");

    let public = client.options().expect("OPTIONS");
    assert!(public.iter().any(|m| m == "GET_PARAMETER"));

    let controls = client.describe().expect("DESCRIBE");
    assert_eq!(controls, vec![format!("{}/track1", url)]);
    assert!(client.sdp().unwrap().contains("m=video 0 RTP/AVP 96"));

    let stream = client.setup(&controls[0]).expect("SETUP");
    let transport = client.stream_transport(stream).unwrap().clone();
    assert!(!transport.is_interleaved(), "server supports UDP, no fallback expected");
    let (rtp, rtcp) = transport.server_port.expect("server port pair");
    assert_eq!(rtcp, rtp + 1);
    assert!(transport.ssrc.is_some());

    client.play().expect("PLAY");
    assert!(client.keepalive_active());

    let session_id = client.session_id().unwrap().to_string();
    let viewers = server.viewers();
    assert_eq!(viewers.len(), 1);
    assert_eq!(viewers[0].session_id, session_id);

    let mut header = RtpHeader::new(96, transport.ssrc.unwrap());
    let packet = header.packet(true, b"frame");
    server
        .send_packet(&session_id, PacketKind::Media, &packet)
        .expect("queue packet");

    let received = client.read_packets(Duration::from_secs(2));
    let media: Vec<_> = received
        .iter()
        .filter(|p| p.kind == PacketKind::Media)
        .collect();
    assert_eq!(media.len(), 1);
    assert_eq!(media[0].payload, packet);
    assert_eq!(media[0].channel, None);

    client.teardown().expect("TEARDOWN");
    assert!(server.session_manager().get_session(&session_id).is_none());

    let states: Vec<SessionState> = client.transitions().iter().map(|t| t.state).collect();
    assert_eq!(
        states,
        vec![
            SessionState::Described,
            SessionState::SetUp,
            SessionState::Playing,
            SessionState::TornDown
        ]
    );
    let cseqs: Vec<i32> = client.transitions().iter().map(|t| t.cseq).collect();
    assert_eq!(cseqs, vec![2, 3, 4, 5]);

    server.stop();
}

#[test]
fn interleaved_packets_and_report_acknowledgement() {
    let (mut server, url) = start(ServerConfig {
        report_interval: Duration::from_millis(10),
        ..ServerConfig::default()
    });
    let mut client = RtspClient::connect(&url, tcp()).expect("connect");

    let controls = client.describe().expect("DESCRIBE");
    client.setup(&controls[0]).expect("SETUP");
    assert_eq!(client.stream_transport(0).unwrap().interleaved, Some((0, 1)));
    client.play().expect("PLAY");

    let session_id = client.session_id().unwrap().to_string();
    server
        .send_packet(&session_id, PacketKind::Media, b"\x80\x60\x00\x01payload")
        .expect("queue packet");

    let received = client.read_packets(Duration::from_secs(2));
    let media = received
        .iter()
        .find(|p| p.kind == PacketKind::Media)
        .expect("media frame");
    assert_eq!(media.channel, Some(0));
    assert_eq!(media.payload, b"\x80\x60\x00\x01payload");

    client.send_report(0).expect("receiver report");
    let mut acknowledged = false;
    let deadline = Instant::now() + Duration::from_secs(2);
    while !acknowledged && Instant::now() < deadline {
        acknowledged = client
            .read_packets(Duration::from_millis(100))
            .iter()
            .filter(|p| p.kind == PacketKind::Control)
            .filter_map(|p| rtcp::parse_header(&p.payload))
            .any(|h| h.packet_type == rtcp::SENDER_REPORT);
    }
    assert!(acknowledged, "server should answer a receiver report");

    client.pause().expect("PAUSE");
    assert_eq!(client.state(), SessionState::Paused);
    assert!(matches!(
        server.send_packet(&session_id, PacketKind::Media, b"late"),
        Err(RtspError::SessionNotPlaying(_))
    ));

    client.teardown().expect("TEARDOWN");
    server.stop();
}

#[test]
fn protected_server_requires_credentials() {
    let (mut server, url) = start(ServerConfig {
        credentials: Some(Credentials::new("viewer", "s3cret")),
        ..ServerConfig::default()
    });

    let mut anonymous = RtspClient::connect(&url, ClientConfig::default()).expect("connect");
    assert!(matches!(anonymous.options(), Err(RtspError::Unauthorized)));

    let wrong = url.replace("rtsp://", "rtsp://viewer:nope@");
    let mut rejected = RtspClient::connect(&wrong, ClientConfig::default()).expect("connect");
    assert!(matches!(rejected.describe(), Err(RtspError::Unauthorized)));

    let authed = url.replace("rtsp://", "rtsp://viewer:s3cret@");
    let mut client = RtspClient::connect(&authed, tcp()).expect("connect");
    let controls = client.describe().expect("DESCRIBE with credentials");
    client.setup(&controls[0]).expect("SETUP with credentials");
    client.play().expect("PLAY with credentials");
    client.teardown().expect("TEARDOWN with credentials");

    server.stop();
}

#[test]
fn idle_sessions_are_evicted() {
    let (mut server, url) = start(ServerConfig {
        idle_timeout: Duration::from_millis(200),
        idle_poll_interval: Duration::from_millis(20),
        ..ServerConfig::default()
    });
    let mut client = RtspClient::connect(&url, ClientConfig::default()).expect("connect");
    let controls = client.describe().expect("DESCRIBE");
    client.setup(&controls[0]).expect("SETUP");
    let session_id = client.session_id().unwrap().to_string();

    assert!(wait_for(Duration::from_secs(3), || {
        server.session_manager().get_session(&session_id).is_none()
    }));

    match client.play() {
        Err(RtspError::Status { method, status, .. }) => {
            assert_eq!(method, Method::Play);
            assert_eq!(status, 454);
        }
        other => panic!("expected 454 after eviction, got {:?}", other),
    }

    server.stop();
}

#[test]
fn disconnect_keeps_udp_sessions_and_drops_interleaved_ones() {
    let (mut server, url) = start(ServerConfig::default());

    let mut udp = RtspClient::connect(&url, ClientConfig::default()).expect("connect");
    let controls = udp.describe().expect("DESCRIBE");
    udp.setup(&controls[0]).expect("SETUP");
    let udp_session = udp.session_id().unwrap().to_string();

    let mut interleaved = RtspClient::connect(&url, tcp()).expect("connect");
    let controls = interleaved.describe().expect("DESCRIBE");
    interleaved.setup(&controls[0]).expect("SETUP");
    let tcp_session = interleaved.session_id().unwrap().to_string();

    drop(udp);
    drop(interleaved);

    let manager = server.session_manager().clone();
    assert!(wait_for(Duration::from_secs(3), || {
        manager.get_session(&tcp_session).is_none()
    }));
    assert!(manager.get_session(&udp_session).is_some());

    server.stop();
    assert!(manager.is_empty());
}
