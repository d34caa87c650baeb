use crate::matchmaker::MatchPolicy;
use crate::media::{MediaCodec, TransportOptions};
use crate::protocol::MediaKind;
use std::env;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Seconds an unmatched search may wait before the reaper cancels it.
    pub wait_timeout_seconds: u64,
    /// Seconds between reaper sweeps.
    pub reap_interval_seconds: u64,
    pub match_policy: MatchPolicy,
    pub transport: TransportOptions,
    pub media_codecs: Vec<MediaCodec>,
}

impl Config {
    pub fn from_env() -> Self {
        let match_policy = match env::var("CAROUSEL_MATCH_POLICY") {
            Ok(value) => MatchPolicy::parse(&value).unwrap_or_else(|| {
                warn!(policy = %value, "unknown match policy, falling back to random");
                MatchPolicy::Random
            }),
            Err(_) => MatchPolicy::Random,
        };

        let transport = TransportOptions {
            listen_ip: env::var("CAROUSEL_LISTEN_IP").unwrap_or_else(|_| "127.0.0.1".to_string()),
            announced_ip: env::var("CAROUSEL_ANNOUNCED_IP").ok(),
            ..TransportOptions::default()
        };

        Self {
            port: env::var("CAROUSEL_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5001),
            wait_timeout_seconds: env::var("CAROUSEL_WAIT_TIMEOUT")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(30),
            reap_interval_seconds: env::var("CAROUSEL_REAP_INTERVAL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(30),
            match_policy,
            transport,
            media_codecs: default_media_codecs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5001,
            wait_timeout_seconds: 30,
            reap_interval_seconds: 30,
            match_policy: MatchPolicy::Random,
            transport: TransportOptions::default(),
            media_codecs: default_media_codecs(),
        }
    }
}

/// Codec list handed to the media engine when a router is created.
fn default_media_codecs() -> Vec<MediaCodec> {
    vec![
        MediaCodec {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: Some(2),
            parameters: serde_json::Value::Null,
        },
        MediaCodec {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: serde_json::json!({ "x-google-start-bitrate": 1000 }),
        },
        MediaCodec {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            clock_rate: 90_000,
            channels: None,
            parameters: serde_json::json!({
                "packetization-mode": 1,
                "profile-level-id": "4d0032",
                "level-asymmetry-allowed": 1,
            }),
        },
    ]
}
