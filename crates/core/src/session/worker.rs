//! Per-session packet pump.
//!
//! Every session with a negotiated transport owns one [`SessionWorker`]
//! thread. Producers (the server API, any thread) push into the session's
//! [`PacketQueue`]; the worker swaps the queue out under its lock and
//! sends the batch onto the transport outside it. The worker also collects
//! inbound RTCP reports and answers them with a sender report at most once
//! per report interval.
//!
//! ```text
//! producers ──push──▶ PacketQueue ──swap──▶ worker ──▶ '$'-frames on the control connection
//!                                              │     └─▶ UDP RTP/RTCP sockets
//! connection ──reports (mpsc)──────────────────┘
//! ```

use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::packet::{PacketKind, rtcp};
use crate::transport::SharedWriter;
use crate::transport::demux::encode_frame;
use crate::transport::udp::UdpPair;

/// How long the worker waits for packets before checking reports and
/// the stop flag.
const TICK: Duration = Duration::from_millis(50);

/// A packet waiting to be sent on a session's transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub kind: PacketKind,
    pub payload: Vec<u8>,
}

/// Multiple-producer, single-consumer packet queue.
#[derive(Debug, Default)]
pub struct PacketQueue {
    packets: Mutex<Vec<OutboundPacket>>,
    ready: Condvar,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, packet: OutboundPacket) {
        self.packets.lock().push(packet);
        self.ready.notify_one();
    }

    /// Take everything queued, waiting up to `timeout` if the queue is empty.
    pub fn take(&self, timeout: Duration) -> Vec<OutboundPacket> {
        let mut packets = self.packets.lock();
        if packets.is_empty() {
            self.ready.wait_for(&mut packets, timeout);
        }
        std::mem::take(&mut *packets)
    }

    /// Wake a consumer blocked in [`take`](Self::take).
    pub fn wake(&self) {
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Last time each liveness signal was observed for a session.
#[derive(Debug)]
pub struct Liveness {
    last_request: Mutex<Instant>,
    last_report: Mutex<Instant>,
}

impl Liveness {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            last_request: Mutex::new(now),
            last_report: Mutex::new(now),
        }
    }

    /// A control request was received.
    pub fn touch_request(&self) {
        *self.last_request.lock() = Instant::now();
    }

    /// A control report packet was received.
    pub fn touch_report(&self) {
        *self.last_report.lock() = Instant::now();
    }

    /// Time since the more recent of the two signals.
    pub fn idle_for(&self, now: Instant) -> Duration {
        let request = now.saturating_duration_since(*self.last_request.lock());
        let report = now.saturating_duration_since(*self.last_report.lock());
        request.min(report)
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Destination of a session's packets.
pub enum Delivery {
    /// `$`-framed on the RTSP control connection.
    Interleaved {
        writer: SharedWriter,
        channels: (u8, u8),
    },
    /// Datagrams from the session's own socket pair.
    Udp {
        sockets: UdpPair,
        peer_rtp: SocketAddr,
        peer_rtcp: SocketAddr,
    },
}

impl Delivery {
    fn send(&self, kind: PacketKind, payload: &[u8]) -> Result<()> {
        match self {
            Delivery::Interleaved { writer, channels } => {
                let channel = match kind {
                    PacketKind::Media => channels.0,
                    PacketKind::Control => channels.1,
                };
                let frame = encode_frame(channel, payload)?;
                let mut writer = writer.lock();
                writer.write_all(&frame)?;
                writer.flush()?;
            }
            Delivery::Udp {
                sockets,
                peer_rtp,
                peer_rtcp,
            } => match kind {
                PacketKind::Media => {
                    sockets.rtp.send_to(payload, *peer_rtp)?;
                }
                PacketKind::Control => {
                    sockets.rtcp.send_to(payload, *peer_rtcp)?;
                }
            },
        }
        Ok(())
    }

    /// Drain RTCP datagrams that arrived on the UDP control socket.
    fn receive_reports(&self, into: &mut Vec<Vec<u8>>) {
        let Delivery::Udp { sockets, .. } = self else {
            return;
        };
        let mut buf = [0u8; 1500];
        loop {
            match sockets.rtcp.recv_from(&mut buf) {
                Ok((len, _)) => into.push(buf[..len].to_vec()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::trace!(error = %e, "RTCP receive failed");
                    return;
                }
            }
        }
    }
}

/// Parameters of a worker's report/ack cycle.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// SSRC the server uses for this session.
    pub ssrc: u32,
    /// Minimum time between two sender-report acknowledgements.
    pub report_interval: Duration,
}

struct Pump {
    session_id: String,
    delivery: Delivery,
    queue: Arc<PacketQueue>,
    reports: Receiver<Vec<u8>>,
    liveness: Arc<Liveness>,
    stop: Arc<AtomicBool>,
    config: WorkerConfig,
    packets_sent: u32,
    octets_sent: u32,
    last_rtp_timestamp: u32,
    unacknowledged: usize,
}

impl Pump {
    fn run(mut self) {
        tracing::debug!(session_id = %self.session_id, "session worker started");
        let mut last_ack = Instant::now();

        while !self.stop.load(Ordering::SeqCst) {
            for packet in self.queue.take(TICK) {
                self.send(packet.kind, &packet.payload);
            }

            self.collect_reports();
            if self.unacknowledged > 0 && last_ack.elapsed() >= self.config.report_interval {
                self.acknowledge();
                last_ack = Instant::now();
            }
        }

        // Best effort: the peer may already be gone.
        if let Err(e) = self
            .delivery
            .send(PacketKind::Control, &rtcp::goodbye(self.config.ssrc))
        {
            tracing::trace!(session_id = %self.session_id, error = %e, "goodbye not delivered");
        }
        tracing::debug!(
            session_id = %self.session_id,
            packets = self.packets_sent,
            octets = self.octets_sent,
            "session worker stopped"
        );
    }

    fn send(&mut self, kind: PacketKind, payload: &[u8]) {
        match self.delivery.send(kind, payload) {
            Ok(()) => {
                if kind == PacketKind::Media {
                    self.packets_sent = self.packets_sent.wrapping_add(1);
                    self.octets_sent = self.octets_sent.wrapping_add(payload.len() as u32);
                    if payload.len() >= 8 {
                        self.last_rtp_timestamp =
                            u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, ?kind, error = %e, "packet send failed");
            }
        }
    }

    fn collect_reports(&mut self) {
        let mut inbound: Vec<Vec<u8>> = self.reports.try_iter().collect();
        let before = inbound.len();
        self.delivery.receive_reports(&mut inbound);
        if inbound.len() > before {
            self.liveness.touch_report();
        }

        for packet in inbound {
            match rtcp::parse_header(&packet) {
                Some(header) if header.is_report() => self.unacknowledged += 1,
                Some(header) if header.is_goodbye() => {
                    tracing::debug!(session_id = %self.session_id, ssrc = header.sender_ssrc, "peer sent RTCP BYE");
                }
                Some(_) => {}
                None => tracing::trace!(session_id = %self.session_id, len = packet.len(), "ignoring non-RTCP control packet"),
            }
        }
    }

    fn acknowledge(&mut self) {
        let report = rtcp::sender_report(
            self.config.ssrc,
            rtcp::ntp_now(),
            self.last_rtp_timestamp,
            self.packets_sent,
            self.octets_sent,
        );
        tracing::trace!(session_id = %self.session_id, reports = self.unacknowledged, "acknowledging receiver reports");
        self.unacknowledged = 0;
        self.send(PacketKind::Control, &report);
    }
}

/// Handle to a running session worker thread.
pub struct SessionWorker {
    session_id: String,
    stop: Arc<AtomicBool>,
    queue: Arc<PacketQueue>,
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl SessionWorker {
    pub fn spawn(
        session_id: &str,
        delivery: Delivery,
        queue: Arc<PacketQueue>,
        reports: Receiver<Vec<u8>>,
        liveness: Arc<Liveness>,
        config: WorkerConfig,
    ) -> Result<Self> {
        if let Delivery::Udp { sockets, .. } = &delivery {
            sockets.rtcp.set_nonblocking(true)?;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = mpsc::channel();
        let pump = Pump {
            session_id: session_id.to_string(),
            delivery,
            queue: queue.clone(),
            reports,
            liveness,
            stop: stop.clone(),
            config,
            packets_sent: 0,
            octets_sent: 0,
            last_rtp_timestamp: 0,
            unacknowledged: 0,
        };

        let handle = thread::Builder::new()
            .name(format!("session-{}", session_id))
            .spawn(move || {
                pump.run();
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            session_id: session_id.to_string(),
            stop,
            queue,
            done,
            handle: Some(handle),
        })
    }

    /// Stop the worker and wait up to `grace` for it to finish.
    ///
    /// Returns `false` if the worker did not stop in time; it is then
    /// abandoned and exits on its own once its current send returns.
    pub fn shutdown(mut self, grace: Duration) -> bool {
        self.stop.store(true, Ordering::SeqCst);
        self.queue.wake();

        match self.done.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(session_id = %self.session_id, ?grace, "session worker did not stop in time, abandoning it");
                self.handle = None;
                false
            }
        }
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop.store(true, Ordering::SeqCst);
            self.queue.wake();
        }
    }
}
