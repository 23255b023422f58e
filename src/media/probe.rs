//! Media Probe: extract container, codecs, resolution, duration, and bitrate
//! from a file on disk by invoking an external probing binary (ffprobe).
//!
//! Output is advisory — missing fields default to zero/empty — and results
//! are cached by `(path, mtime, size)` with LRU eviction so repeated planning
//! requests against the same file don't re-invoke the probe binary.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::CoreError;

/// Probed media information. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    pub container: String,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u64,
    pub duration_s: f64,
    pub frame_rate: f64,
}

/// ffprobe JSON output shapes, private to this module.
mod ffprobe {
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize, Default)]
    pub struct FfprobeOutput {
        pub format: Option<Format>,
        pub streams: Option<Vec<Stream>>,
    }

    #[derive(Debug, Deserialize, Default)]
    pub struct Format {
        pub format_name: Option<String>,
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
        #[allow(dead_code)]
        pub tags: Option<HashMap<String, String>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_name: Option<String>,
        pub codec_type: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub r_frame_rate: Option<String>,
        pub avg_frame_rate: Option<String>,
        pub bit_rate: Option<String>,
    }
}

#[derive(Clone, Eq, PartialEq, Hash)]
struct CacheKey {
    path: String,
    mtime_unix: i64,
    size: u64,
}

struct LruCache {
    capacity: usize,
    entries: HashMap<CacheKey, MediaInfo>,
    order: Vec<CacheKey>,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn get(&mut self, key: &CacheKey) -> Option<MediaInfo> {
        if let Some(info) = self.entries.get(key).cloned() {
            self.touch(key);
            Some(info)
        } else {
            None
        }
    }

    fn touch(&mut self, key: &CacheKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let k = self.order.remove(pos);
            self.order.push(k);
        }
    }

    fn put(&mut self, key: CacheKey, info: MediaInfo) {
        if self.entries.insert(key.clone(), info).is_some() {
            self.touch(&key);
            return;
        }
        self.order.push(key);
        while self.order.len() > self.capacity {
            let evicted = self.order.remove(0);
            self.entries.remove(&evicted);
        }
    }
}

/// Media Probe: `Probe(path) -> MediaInfo | error`, backed by ffprobe.
pub struct MediaProbe {
    ffprobe_path: String,
    timeout: Duration,
    default_frame_rate: f64,
    cache: Mutex<LruCache>,
}

impl MediaProbe {
    pub fn new(
        ffprobe_path: impl Into<String>,
        cache_capacity: usize,
        timeout_secs: u64,
        default_frame_rate: f64,
    ) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            timeout: Duration::from_secs(timeout_secs),
            default_frame_rate,
            cache: Mutex::new(LruCache::new(cache_capacity)),
        }
    }

    /// Probe a media file for container/codec/resolution/duration/bitrate.
    pub async fn probe(&self, path: &Path) -> Result<MediaInfo, CoreError> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            CoreError::FileUnavailable(format!("{}: {}", path.display(), e))
        })?;
        let mtime_unix = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let key = CacheKey {
            path: path.to_string_lossy().to_string(),
            mtime_unix,
            size: metadata.len(),
        };

        if let Some(cached) = self.cache.lock().get(&key) {
            return Ok(cached);
        }

        let info = self.run_probe(path).await?;
        self.cache.lock().put(key, info.clone());
        Ok(info)
    }

    async fn run_probe(&self, path: &Path) -> Result<MediaInfo, CoreError> {
        tracing::debug!(path = %path.display(), "probing media file");

        let mut cmd = Command::new(&self.ffprobe_path);
        cmd.args(["-v", "error"])
            .args(["-print_format", "json"])
            .args(["-show_format", "-show_streams"])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                CoreError::ProbeFailed(format!("timed out after {:?}", self.timeout))
            })?
            .map_err(|e| CoreError::ProbeFailed(format!("failed to exec ffprobe: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoreError::ProbeFailed(format!(
                "ffprobe exited {}: {}",
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr.trim()
            )));
        }

        let parsed: ffprobe::FfprobeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| CoreError::ProbeFailed(format!("invalid ffprobe JSON: {}", e)))?;

        Ok(self.convert(parsed))
    }

    fn convert(&self, probe: ffprobe::FfprobeOutput) -> MediaInfo {
        let format = probe.format.unwrap_or_default();
        let container = format
            .format_name
            .unwrap_or_default()
            .split(',')
            .next()
            .unwrap_or("")
            .to_string();
        let duration_s = format.duration.as_deref().and_then(|d| d.parse().ok()).unwrap_or(0.0);
        let bitrate_kbps = format
            .bit_rate
            .as_deref()
            .and_then(|b| b.parse::<u64>().ok())
            .map(|b| b / 1000)
            .unwrap_or(0);

        let streams = probe.streams.unwrap_or_default();
        let video = streams.iter().find(|s| s.codec_type.as_deref() == Some("video"));
        let audio = streams.iter().find(|s| s.codec_type.as_deref() == Some("audio"));

        let width = video.and_then(|v| v.width).unwrap_or(0);
        let height = video.and_then(|v| v.height).unwrap_or(0);

        let frame_rate = video
            .and_then(|v| v.avg_frame_rate.as_deref().or(v.r_frame_rate.as_deref()))
            .and_then(parse_frame_rate)
            .filter(|f| *f > 0.0)
            .unwrap_or_else(|| {
                tracing::warn!(
                    default = self.default_frame_rate,
                    "could not determine frame rate, defaulting"
                );
                self.default_frame_rate
            });

        MediaInfo {
            container,
            video_codec: video.and_then(|v| v.codec_name.clone()),
            audio_codec: audio.and_then(|a| a.codec_name.clone()),
            width,
            height,
            bitrate_kbps,
            duration_s,
            frame_rate,
        }
    }
}

/// Parse ffprobe's `"24000/1001"` or `"25"` frame rate strings.
fn parse_frame_rate(raw: &str) -> Option<f64> {
    if let Some((num, den)) = raw.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den == 0.0 {
            None
        } else {
            Some(num / den)
        }
    } else {
        raw.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fractional_frame_rate() {
        assert!((parse_frame_rate("24000/1001").unwrap() - 23.976).abs() < 0.01);
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("30"), Some(30.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("garbage"), None);
    }

    #[test]
    fn lru_cache_evicts_oldest() {
        let mut cache = LruCache::new(2);
        let k1 = CacheKey { path: "a".into(), mtime_unix: 1, size: 1 };
        let k2 = CacheKey { path: "b".into(), mtime_unix: 1, size: 1 };
        let k3 = CacheKey { path: "c".into(), mtime_unix: 1, size: 1 };
        let info = MediaInfo {
            container: "mp4".into(),
            video_codec: Some("h264".into()),
            audio_codec: Some("aac".into()),
            width: 1920,
            height: 1080,
            bitrate_kbps: 4000,
            duration_s: 100.0,
            frame_rate: 30.0,
        };
        cache.put(k1.clone(), info.clone());
        cache.put(k2.clone(), info.clone());
        cache.put(k3.clone(), info.clone());
        assert!(cache.get(&k1).is_none());
        assert!(cache.get(&k2).is_some());
        assert!(cache.get(&k3).is_some());
    }
}
