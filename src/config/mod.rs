//! Application configuration management

use std::env;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (for generating URLs)
    pub host: Option<String>,

    /// Server port
    pub port: u16,

    /// Path to the ffmpeg executable
    pub ffmpeg_path: String,

    /// Path to the ffprobe executable
    pub ffprobe_path: String,

    /// Content Store root directory (`content/<hash[0:2]>/<hash[2:4]>/<hash>/...`)
    pub content_root: String,

    /// Hard cap on concurrently running transcode sessions
    pub max_concurrent_sessions: usize,

    /// Maximum number of probe results cached in the Media Probe's LRU
    pub probe_cache_capacity: usize,

    /// Bound on how long a probe invocation may run before it is treated as failed
    pub probe_timeout_secs: u64,

    /// How long the Process Supervisor waits for progress output before declaring a stall
    pub stall_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL during cancellation
    pub cancel_grace_secs: u64,

    /// Age after which a terminal-state session becomes eligible for cleanup
    pub session_max_age_secs: u64,

    /// Age after which a Content Store entry becomes eligible for cleanup
    pub content_ttl_secs: u64,

    /// Default segment duration used when a request does not specify one
    pub default_segment_duration_secs: f64,

    /// Default frame rate used when probing cannot determine one
    pub default_frame_rate: f64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("HOST").ok(),

            port: env::var("PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .context("Invalid PORT")?,

            ffmpeg_path: env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),

            ffprobe_path: env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string()),

            content_root: env::var("CONTENT_ROOT").unwrap_or_else(|_| "./data/content".to_string()),

            max_concurrent_sessions: env::var("MAX_CONCURRENT_SESSIONS")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .context("Invalid MAX_CONCURRENT_SESSIONS")?,

            probe_cache_capacity: env::var("PROBE_CACHE_CAPACITY")
                .unwrap_or_else(|_| "512".to_string())
                .parse()
                .context("Invalid PROBE_CACHE_CAPACITY")?,

            probe_timeout_secs: env::var("PROBE_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("Invalid PROBE_TIMEOUT_SECS")?,

            stall_timeout_secs: env::var("STALL_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("Invalid STALL_TIMEOUT_SECS")?,

            cancel_grace_secs: env::var("CANCEL_GRACE_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid CANCEL_GRACE_SECS")?,

            session_max_age_secs: env::var("SESSION_MAX_AGE_SECS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .context("Invalid SESSION_MAX_AGE_SECS")?,

            content_ttl_secs: env::var("CONTENT_TTL_SECS")
                .unwrap_or_else(|_| "604800".to_string())
                .parse()
                .context("Invalid CONTENT_TTL_SECS")?,

            default_segment_duration_secs: env::var("DEFAULT_SEGMENT_DURATION_SECS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("Invalid DEFAULT_SEGMENT_DURATION_SECS")?,

            default_frame_rate: env::var("DEFAULT_FRAME_RATE")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("Invalid DEFAULT_FRAME_RATE")?,
        })
    }
}
