use std::time::Duration;

use tracing::warn;
use webrtc::ice_transport::ice_server::RTCIceServer;

pub const DEFAULT_LOW_WATERMARK: usize = 64 * 1024;
pub const DEFAULT_CHUNK_BYTES: usize = 16 * 1024;
pub const DEFAULT_MAX_PROJECT_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(20_000);
pub const DEFAULT_JITTER_DELAY_MS: u16 = 50;
pub const DEFAULT_CHANNEL_LABEL: &str = "atelier-sync";

/// Tunables for the synchronization core.
#[derive(Clone, Debug)]
pub struct PartyConfig {
    /// Reliable-channel backpressure threshold; draining pauses while the
    /// channel buffers more than this.
    pub reliable_low_watermark: usize,
    /// Fixed part size for chunked project transfer.
    pub chunk_bytes: usize,
    /// Upper bound on a reassembled project snapshot.
    pub max_project_bytes: usize,
    /// How long the impolite side waits for the connection before giving up.
    pub connect_timeout: Duration,
    /// Replay delay budget for the pose jitter buffer.
    pub jitter_delay_ms: u16,
    /// Label of the single reliable data channel.
    pub channel_label: String,
    /// ICE servers handed to the WebRTC stack.
    pub ice_servers: Vec<RTCIceServer>,
}

impl Default for PartyConfig {
    fn default() -> Self {
        Self {
            reliable_low_watermark: DEFAULT_LOW_WATERMARK,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            max_project_bytes: DEFAULT_MAX_PROJECT_BYTES,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            jitter_delay_ms: DEFAULT_JITTER_DELAY_MS,
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            ice_servers: default_ice_servers(),
        }
    }
}

impl PartyConfig {
    /// Environment-overridable configuration (`ATELIER_*`).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            reliable_low_watermark: parse_usize_env(
                "ATELIER_LOW_WATERMARK",
                defaults.reliable_low_watermark,
                1,
            ),
            chunk_bytes: parse_usize_env("ATELIER_CHUNK_BYTES", defaults.chunk_bytes, 1),
            max_project_bytes: parse_usize_env(
                "ATELIER_MAX_PROJECT_BYTES",
                defaults.max_project_bytes,
                1,
            ),
            connect_timeout: Duration::from_millis(parse_usize_env(
                "ATELIER_CONNECT_TIMEOUT_MS",
                DEFAULT_CONNECT_TIMEOUT.as_millis() as usize,
                1,
            ) as u64),
            jitter_delay_ms: parse_usize_env(
                "ATELIER_JITTER_DELAY_MS",
                defaults.jitter_delay_ms as usize,
                1,
            ) as u16,
            channel_label: std::env::var("ATELIER_CHANNEL_LABEL")
                .unwrap_or(defaults.channel_label),
            ice_servers: if std::env::var("ATELIER_LOCALHOST_ONLY").is_ok() {
                vec![]
            } else {
                defaults.ice_servers
            },
        }
    }

    /// Localhost-only configuration (no STUN), useful in tests.
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            ..Self::default()
        }
    }
}

fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        ..Default::default()
    }]
}

fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target: "party::config",
                    var, parsed, min, default, "value below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target: "party::config",
                    var,
                    error = %err,
                    default,
                    "failed to parse; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
