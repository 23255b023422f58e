//! Shared data model: the canonical request/response types that flow between
//! components. Kept free of component-specific logic
//! so Resource Manager, Argument Builder, Session Manager, and Planner can
//! all depend on it without depending on each other.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Output container requested for a transcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Dash,
    Hls,
}

impl Container {
    pub fn as_str(&self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Dash => "dash",
            Container::Hls => "hls",
        }
    }
}

/// Encoder effort/latency tradeoff requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedPriority {
    Fastest,
    Balanced,
    Quality,
}

/// Device capability profile, constructed per HTTP request from headers and
/// query parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub user_agent: String,
    pub supported_codecs: Vec<String>,
    pub max_resolution: (u32, u32),
    pub max_bitrate_kbps: u64,
    pub supports_hevc: bool,
    pub supports_av1: bool,
    pub supports_hdr: bool,
    pub supports_mkv: bool,
    /// True when the client has signalled (via headers or prior playback
    /// telemetry) that its network conditions are variable enough to need
    /// bitrate switching. Drives the Planner's `enable_abr` rule alongside
    /// the duration threshold.
    #[serde(default)]
    pub reports_variable_bandwidth: bool,
    pub client_ip: Option<String>,
}

impl DeviceProfile {
    pub fn supports_codec(&self, codec: &str) -> bool {
        self.supported_codecs.iter().any(|c| c.eq_ignore_ascii_case(codec))
    }
}

/// Canonical transcode request. The argument builder treats this as the sole
/// source of truth; no hidden defaults beyond what's documented here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeRequest {
    pub input_path: PathBuf,
    #[serde(default)]
    pub seek_offset: f64,
    pub container: Container,
    pub video_codec: String,
    pub audio_codec: String,
    pub quality: u8,
    pub speed_priority: SpeedPriority,
    pub resolution: Option<(u32, u32)>,
    pub enable_abr: bool,
    #[serde(default)]
    pub provider_settings: std::collections::BTreeMap<String, String>,
}

/// One rendition in an ABR ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rung {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub profile: &'static str,
    pub level: &'static str,
    pub crf: u8,
}

/// Ordered (descending-bitrate) set of rungs generated for a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbrLadder {
    pub rungs: Vec<Rung>,
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Complete,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Complete | SessionStatus::Stopped | SessionStatus::Failed
        )
    }
}

/// Result of the Playback Planner's decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackDecision {
    pub should_transcode: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_play_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcode_request: Option<TranscodeRequest>,
}

/// Status of a Content Store entry. `Failed` entries are swept eagerly;
/// `Complete` entries are immutable and served forever (until TTL eviction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    Pending,
    Complete,
    Failed,
}

/// A directory in the content-addressable store. One per unique transcode
/// parameter hash.
#[derive(Debug, Clone)]
pub struct ContentEntry {
    pub hash: String,
    pub output_dir: PathBuf,
    pub created_at: std::time::Instant,
    pub last_accessed: std::time::Instant,
    pub status: ContentStatus,
    pub manifest_path: Option<PathBuf>,
    /// Free-form description of what's on disk (e.g. rung labels for an ABR
    /// DASH/HLS output), set once the entry reaches `complete`.
    pub segment_layout: Option<String>,
}

/// A server-side handle for one ongoing or completed transcode: the unit of
/// concurrency and cancellation.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub content_hash: String,
    pub request: TranscodeRequest,
    pub process_pid: Option<u32>,
    pub start_time: std::time::Instant,
    pub status: SessionStatus,
    pub progress_percent: f64,
    pub output_dir: PathBuf,
    pub cancel_token: CancellationToken,
    pub last_activity_time: std::time::Instant,
    pub failure_reason: Option<String>,
}

impl Session {
    pub fn is_observer_safe(&self) -> bool {
        matches!(self.status, SessionStatus::Running | SessionStatus::Complete)
    }
}

/// Per-component aggregate exposed by `Session Manager::stats()`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub starting: usize,
    pub running: usize,
    pub stopping: usize,
    pub stopped: usize,
    pub failed: usize,
    pub complete: usize,
    pub average_progress: f64,
    pub concurrency_limit: usize,
}

/// Shared handle type used across components that hand sessions around
/// without taking ownership of the Session Manager's internal map.
pub type SharedSession = Arc<parking_lot::RwLock<Session>>;
