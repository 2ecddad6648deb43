//! SDP bodies for DESCRIBE (RFC 8866).
//!
//! The server offers one media section built from [`ServerConfig`]. With
//! the defaults and a host of `10.0.0.5` the body reads:
//!
//! ```text
//! v=0
//! o=- 0 0 IN IP4 10.0.0.5
//! s=Stream
//! c=IN IP4 10.0.0.5
//! t=0 0
//! a=tool:rtsp-duplex
//! a=sendonly
//! m=video 0 RTP/AVP 96
//! a=rtpmap:96 H264/90000
//! a=control:track1
//! ```
//!
//! All origin and media fields come from [`ServerConfig`]. The client
//! side only needs the per-media `a=control:` URLs to know what to SETUP;
//! everything else in the description is left to the caller.

use crate::server::ServerConfig;

/// Control attribute of the single track the server offers.
pub const TRACK_CONTROL: &str = "track1";

/// Generate an SDP session description from the server configuration.
pub fn generate_sdp(config: &ServerConfig, ip: &str) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o={} {} {} IN IP4 {}",
        config.sdp_username, config.sdp_session_id, config.sdp_session_version, ip
    ));
    sdp.push(format!("s={}", config.sdp_session_name));
    sdp.push(format!("c=IN IP4 {}", ip));
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:rtsp-duplex".to_string());
    sdp.push("a=sendonly".to_string());
    sdp.push(format!(
        "m={} 0 RTP/AVP {}",
        config.media_kind, config.payload_type
    ));
    sdp.push(format!(
        "a=rtpmap:{} {}/{}",
        config.payload_type, config.encoding_name, config.clock_rate
    ));
    sdp.push(format!("a=control:{}", TRACK_CONTROL));

    tracing::trace!(sdp = %sdp.join("\\r\\n"), "generated SDP");

    format!("{}\r\n", sdp.join("\r\n"))
}

/// Media-level `a=control:` URLs, resolved against `base`.
///
/// Returns `[base]` when no media section names a control URL
/// (aggregate-only descriptions).
pub fn control_urls(sdp: &str, base: &str) -> Vec<String> {
    let mut in_media = false;
    let mut urls = Vec::new();

    for line in sdp.lines().map(str::trim) {
        if line.starts_with("m=") {
            in_media = true;
        } else if in_media && let Some(control) = line.strip_prefix("a=control:") {
            urls.push(resolve(base, control.trim()));
        }
    }

    if urls.is_empty() {
        urls.push(base.to_string());
    }
    urls
}

fn resolve(base: &str, control: &str) -> String {
    if control == "*" || control.is_empty() {
        return base.to_string();
    }
    let lower = control.to_ascii_lowercase();
    if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
        return control.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), control)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_sdp_from_config() {
        let config = ServerConfig {
            sdp_username: "server".to_string(),
            sdp_session_id: "1234567890".to_string(),
            sdp_session_version: "1".to_string(),
            sdp_session_name: "Test Session".to_string(),
            ..ServerConfig::default()
        };
        let sdp = generate_sdp(&config, "192.168.1.100");

        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("o=server 1234567890 1 IN IP4 192.168.1.100\r\n"));
        assert!(sdp.contains("s=Test Session\r\n"));
        assert!(
            sdp.contains("c=IN IP4 192.168.1.100\r\n"),
            "c= must use the advertised host"
        );
        assert!(sdp.contains("a=tool:rtsp-duplex\r\n"));
        assert!(sdp.contains("m=video 0 RTP/AVP 96\r\n"));
        assert!(sdp.contains("a=rtpmap:96 H264/90000\r\n"));
        assert!(sdp.contains("a=control:track1\r\n"));

        let sendonly_idx = sdp.find("a=sendonly").unwrap();
        let m_idx = sdp.find("m=video").unwrap();
        assert!(sendonly_idx < m_idx, "session-level attrs must precede m= line");
        assert!(sdp.ends_with("\r\n"));
    }

    #[test]
    fn control_urls_resolve_against_base() {
        let sdp = "v=0\r\na=control:*\r\nm=video 0 RTP/AVP 96\r\na=control:track1\r\n\
                   m=audio 0 RTP/AVP 97\r\na=control:rtsp://cam/stream/audio\r\n";
        assert_eq!(
            control_urls(sdp, "rtsp://cam/stream/"),
            vec![
                "rtsp://cam/stream/track1".to_string(),
                "rtsp://cam/stream/audio".to_string(),
            ]
        );
    }

    #[test]
    fn missing_media_control_falls_back_to_base() {
        let sdp = "v=0\r\nm=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n";
        assert_eq!(control_urls(sdp, "rtsp://cam/s"), vec!["rtsp://cam/s"]);
    }

    #[test]
    fn generated_sdp_round_trips_through_control_urls() {
        let sdp = generate_sdp(&ServerConfig::default(), "127.0.0.1");
        assert_eq!(
            control_urls(&sdp, "rtsp://127.0.0.1:8554/live"),
            vec!["rtsp://127.0.0.1:8554/live/track1"]
        );
    }
}
