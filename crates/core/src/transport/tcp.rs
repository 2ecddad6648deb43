use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::protocol::MethodHandler;
use crate::server::ServerConfig;
use crate::session::{SessionManager, TransportDescriptor};
use crate::transport::demux::{Demuxed, Demuxer};
use crate::transport::{SharedWriter, shared_writer, write_message};

/// How often a blocked connection read wakes up to check the running flag.
const READ_POLL: Duration = Duration::from_millis(200);

const READ_CHUNK: usize = 16 * 1024;

/// Pause between accept attempts when nothing is pending or accept failed.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Non-blocking TCP accept loop.
///
/// Checks the `running` flag between accepts with a 50ms poll interval
/// so that [`crate::server::Server::stop`] can terminate it promptly.
pub fn accept_loop(
    listener: TcpListener,
    session_manager: SessionManager,
    config: Arc<ServerConfig>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let sm = session_manager.clone();
                let r = running.clone();
                let c = config.clone();
                let spawned = thread::Builder::new()
                    .name("rtsp-connection".to_string())
                    .spawn(move || Connection::handle(stream, sm, c, r));
                if let Err(e) = spawned {
                    tracing::error!(error = %e, "failed to spawn connection thread");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => accept_failed(&e, &running),
        }
    }
    tracing::debug!("accept loop exited");
}

/// Log a failed accept, then wait one poll interval before retrying.
fn accept_failed(error: &io::Error, running: &AtomicBool) {
    if running.load(Ordering::SeqCst) {
        tracing::warn!(error = %error, "TCP accept error");
    }
    thread::sleep(ACCEPT_POLL);
}

/// A single RTSP control connection with its own lifecycle.
///
/// The connection thread is the only reader of the socket. Responses and
/// worker frames share the write half through a [`SharedWriter`].
struct Connection {
    reader: TcpStream,
    writer: SharedWriter,
    demuxer: Demuxer,
    handler: MethodHandler,
    peer_addr: SocketAddr,
}

impl Connection {
    /// Entry point: set up a connection and run its read loop.
    fn handle(
        stream: TcpStream,
        session_manager: SessionManager,
        config: Arc<ServerConfig>,
        running: Arc<AtomicBool>,
    ) {
        let (peer_addr, local_addr) = match (stream.peer_addr(), stream.local_addr()) {
            (Ok(peer), Ok(local)) => (peer, local),
            _ => return,
        };

        tracing::info!(%peer_addr, "client connected");

        let write_stream = match stream.try_clone() {
            Ok(s) => s,
            Err(_) => return,
        };
        if stream.set_read_timeout(Some(READ_POLL)).is_err() {
            return;
        }
        let _ = write_stream.set_nodelay(true);

        let writer = shared_writer(write_stream);
        let handler = MethodHandler::new(
            session_manager,
            config,
            peer_addr,
            local_addr.ip(),
            writer.clone(),
        );

        let mut conn = Connection {
            reader: stream,
            writer,
            demuxer: Demuxer::new(),
            handler,
            peer_addr,
        };

        let reason = conn.run(&running);
        let removed = conn.handler.disconnect();
        if removed > 0 {
            tracing::info!(peer = %peer_addr, removed, "cleaned up sessions on disconnect");
        }

        tracing::info!(%peer_addr, reason, "client disconnected");
    }

    /// Read/dispatch loop. Returns the reason for exiting.
    fn run(&mut self, running: &Arc<AtomicBool>) -> &'static str {
        let mut chunk = vec![0u8; READ_CHUNK];
        while running.load(Ordering::SeqCst) {
            match self.reader.read(&mut chunk) {
                Ok(0) => return "connection closed by client",
                Ok(n) => {
                    self.demuxer.feed(&chunk[..n]);
                    if let Err(reason) = self.drain() {
                        return reason;
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) => {}
                Err(_) => return "read error",
            }
        }

        "server shutting down"
    }

    /// Dispatch every complete message and frame buffered so far.
    fn drain(&mut self) -> Result<(), &'static str> {
        loop {
            match self.demuxer.poll() {
                Demuxed::Message(request) => {
                    tracing::debug!(
                        peer = %self.peer_addr,
                        method = ?request.method(),
                        uri = request.uri().unwrap_or(""),
                        cseq = ?request.cseq(),
                        "request"
                    );

                    let response = self.handler.handle(&request);

                    tracing::debug!(
                        peer = %self.peer_addr,
                        status = response.status().unwrap_or(0),
                        "response"
                    );

                    if write_message(&self.writer, &response).is_err() {
                        return Err("write error");
                    }

                    // Negotiated channels narrow what the demuxer trusts while resyncing.
                    if let Some((media, control)) = response
                        .header("Transport")
                        .and_then(|t| TransportDescriptor::parse(t).ok())
                        .and_then(|t| t.interleaved)
                    {
                        self.demuxer.allow_channel(media);
                        self.demuxer.allow_channel(control);
                    }
                }
                Demuxed::Frame(frame) => {
                    tracing::trace!(peer = %self.peer_addr, channel = frame.channel, len = frame.payload.len(), "interleaved frame");
                    self.handler.route_frame(frame.channel, frame.payload);
                }
                Demuxed::Incomplete => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn failed_accept_waits_before_retrying() {
        let running = AtomicBool::new(true);
        let started = Instant::now();
        accept_failed(&io::Error::from(io::ErrorKind::ConnectionAborted), &running);
        assert!(started.elapsed() >= ACCEPT_POLL);
    }
}
