use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use rand::RngExt;
use rtsp::client::TransportPreference;
use rtsp::packet::rtp::{self, RtpHeader};
use rtsp::protocol::Credentials;
use rtsp::{ClientConfig, PacketKind, RtspClient, Server, ServerConfig};

#[derive(Parser)]
#[command(
    name = "rtsp-duplex",
    about = "RTSP server and client over UDP or TCP-interleaved transport"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve a synthetic RTP stream until Enter is pressed.
    Serve {
        /// Bind address (host:port)
        #[arg(long, short, default_value = "0.0.0.0:8554")]
        bind: String,
        /// Require this username (with --password)
        #[arg(long, requires = "password")]
        user: Option<String>,
        #[arg(long, requires = "user")]
        password: Option<String>,
        /// Synthetic packets per second sent to every playing session
        #[arg(long, default_value_t = 25)]
        synthetic_fps: u32,
    },
    /// Play a stream and report what arrives.
    Play {
        /// rtsp://[user:pass@]host[:port]/path
        url: String,
        /// Request TCP-interleaved transport instead of UDP
        #[arg(long)]
        tcp: bool,
        /// How long to receive before TEARDOWN
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let result = match Args::parse().command {
        Command::Serve {
            bind,
            user,
            password,
            synthetic_fps,
        } => serve(&bind, user.zip(password), synthetic_fps),
        Command::Play { url, tcp, seconds } => play(&url, tcp, Duration::from_secs(seconds)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn serve(bind: &str, credentials: Option<(String, String)>, fps: u32) -> rtsp::Result<()> {
    let config = ServerConfig {
        credentials: credentials.map(|(user, password)| Credentials::new(&user, &password)),
        ..ServerConfig::default()
    };
    let payload_type = config.payload_type;
    let clock_rate = config.clock_rate;

    let mut server = Server::with_config(bind, config);
    server.start()?;

    let addr = server.local_addr().map(|a| a.to_string()).unwrap_or_default();
    println!("RTSP server on {} - press Enter to stop", addr);

    let frame_interval = Duration::from_secs(1) / fps.max(1);
    let mut header = RtpHeader::new(payload_type, rand::rng().random::<u32>());
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    thread::spawn(move || {
        let mut input = String::new();
        let _ = std::io::stdin().read_line(&mut input);
        let _ = stop_tx.send(());
    });

    let mut frame: u32 = 0;
    while stop_rx.recv_timeout(frame_interval).is_err() {
        let payload = frame.to_be_bytes();
        let packet = header.packet(true, &payload);
        header.advance_timestamp(clock_rate / fps.max(1));
        frame = frame.wrapping_add(1);

        if let Err(e) = server.broadcast_packet(PacketKind::Media, &packet) {
            tracing::warn!(error = %e, "broadcast failed");
        }
    }

    server.stop();
    Ok(())
}

fn play(url: &str, tcp: bool, duration: Duration) -> rtsp::Result<()> {
    let config = ClientConfig {
        transport: if tcp {
            TransportPreference::Tcp
        } else {
            TransportPreference::Udp
        },
        ..ClientConfig::default()
    };

    let mut client = RtspClient::connect(url, config)?;
    client.options()?;
    let controls = client.describe()?;
    for control in &controls {
        let index = client.setup(control)?;
        if let Some(transport) = client.stream_transport(index) {
            println!("stream {} ({}): {}", index, control, transport);
        }
    }
    client.play()?;

    let deadline = Instant::now() + duration;
    let mut last_report = Instant::now();
    let (mut media, mut control, mut octets) = (0u64, 0u64, 0u64);
    let mut source = None;
    while Instant::now() < deadline {
        for packet in client.read_packets(Duration::from_millis(200)) {
            match packet.kind {
                PacketKind::Media => {
                    media += 1;
                    if source.is_none() {
                        source = rtp::ssrc(&packet.payload);
                    }
                }
                PacketKind::Control => control += 1,
            }
            octets += packet.payload.len() as u64;
        }
        if last_report.elapsed() >= Duration::from_secs(5) {
            for index in 0..controls.len() {
                client.send_report(index)?;
            }
            last_report = Instant::now();
        }
    }

    client.teardown()?;
    if let Some(ssrc) = source {
        println!("media SSRC {:08X}", ssrc);
    }
    println!(
        "received {} media and {} control packets ({} bytes)",
        media, control, octets
    );
    Ok(())
}
