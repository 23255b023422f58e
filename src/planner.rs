//! Playback Planner: decides direct-play vs transcode from a probed
//! file and a device profile, and synthesizes a canonical [TranscodeRequest]
//! when transcoding is required.
//!
//! Rule evaluation order is fixed: mp4/webm compatibility check, then the
//! single deterministic mkv rule, then transcode. The mkv rule is
//! deliberately narrow — anything outside it is rejected, not guessed at.

use std::path::Path;
use std::sync::Arc;

use crate::domain::{Container, DeviceProfile, PlaybackDecision, SpeedPriority, TranscodeRequest};
use crate::error::CoreResult;
use crate::media::MediaProbe;

/// Minimum source duration, in seconds, above which ABR is enabled purely on
/// length grounds (5 minutes).
const ABR_DURATION_THRESHOLD_S: f64 = 5.0 * 60.0;

/// Quality floor above which a device's HEVC support is actually used rather
/// than falling back to the universal h264+aac baseline. Below this the
/// bandwidth savings of HEVC aren't worth the narrower device support.
const HEVC_QUALITY_THRESHOLD: u8 = 80;
/// Same idea for AV1, set higher since AV1 decode support is rarer still.
const AV1_QUALITY_THRESHOLD: u8 = 90;

pub struct Planner {
    probe: Arc<MediaProbe>,
}

/// Coarse container family used for the direct-play compatibility checks.
/// ffprobe's `format_name` is a comma-separated alias list (e.g.
/// `"mov,mp4,m4a,3gp,3g2,mj2"`); this collapses it to the families the
/// compatibility check actually reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContainerFamily {
    Mp4,
    WebM,
    Mkv,
    Other,
}

fn container_family(raw: &str) -> ContainerFamily {
    let raw = raw.to_ascii_lowercase();
    if raw.split(',').any(|t| t == "matroska" || t == "webm") {
        if raw.contains("webm") && !raw.contains("matroska") {
            ContainerFamily::WebM
        } else {
            ContainerFamily::Mkv
        }
    } else if raw.split(',').any(|t| t == "mp4" || t == "mov" || t == "m4a" || t == "3gp") {
        ContainerFamily::Mp4
    } else {
        ContainerFamily::Other
    }
}

fn target_container_for_ua(user_agent: &str) -> Container {
    let ua = user_agent.to_ascii_lowercase();
    if ua.contains("chrome") || ua.contains("chromium") || ua.contains("firefox") {
        Container::Dash
    } else if ua.contains("safari") || ua.contains("iphone") || ua.contains("ipad") || ua.contains("ios") {
        Container::Hls
    } else {
        Container::Mp4
    }
}

impl Planner {
    pub fn new(probe: Arc<MediaProbe>) -> Self {
        Self { probe }
    }

    /// `Decide(path, device_profile) -> PlaybackDecision`.
    pub async fn decide(&self, path: &Path, device: &DeviceProfile) -> CoreResult<PlaybackDecision> {
        let media = self.probe.probe(path).await?;
        let family = container_family(&media.container);

        // Rule 1: mp4/webm direct-play when every stream is in the device's
        // codec allowlist and resolution/bitrate stay within its caps.
        if matches!(family, ContainerFamily::Mp4 | ContainerFamily::WebM) {
            let video_ok = media.video_codec.as_deref().map(|c| device.supports_codec(c)).unwrap_or(false);
            let audio_ok = media.audio_codec.as_deref().map(|c| device.supports_codec(c)).unwrap_or(false);
            let (max_w, max_h) = device.max_resolution;
            let resolution_ok = media.width <= max_w && media.height <= max_h;
            let bitrate_ok = device.max_bitrate_kbps == 0 || media.bitrate_kbps <= device.max_bitrate_kbps;

            if video_ok && audio_ok && resolution_ok && bitrate_ok {
                return Ok(PlaybackDecision {
                    should_transcode: false,
                    reason: format!("container {:?} web-compatible and within device caps", family),
                    direct_play_url: Some(direct_play_url(path)),
                    transcode_request: None,
                });
            }
        }

        // Rule 2: the one deterministic mkv exception. Both streams must be
        // h264+aac and the device must explicitly support mkv containers.
        if family == ContainerFamily::Mkv {
            let is_h264 = media.video_codec.as_deref() == Some("h264");
            let is_aac = media.audio_codec.as_deref() == Some("aac");
            if is_h264 && is_aac && device.supports_mkv {
                return Ok(PlaybackDecision {
                    should_transcode: false,
                    reason: "mkv h264+aac accepted under device mkv support".to_string(),
                    direct_play_url: Some(direct_play_url(path)),
                    transcode_request: None,
                });
            }
        }

        // Rule 3: transcode. Synthesize the canonical request.
        let reason = match family {
            ContainerFamily::Mkv => "container mkv not web-compatible".to_string(),
            ContainerFamily::Mp4 | ContainerFamily::WebM => {
                "codec, resolution, or bitrate outside device caps".to_string()
            }
            ContainerFamily::Other => format!("container {} not directly playable", media.container),
        };

        let container = target_container_for_ua(&device.user_agent);

        let quality = default_quality_for(device);
        let (video_codec, audio_codec) = codec_for_device(device, quality);

        let (max_w, max_h) = device.max_resolution;
        let resolution = if max_w > 0 && max_h > 0 {
            Some((media.width.min(max_w), media.height.min(max_h)))
        } else {
            Some((media.width, media.height))
        };

        let enable_abr = media.duration_s >= ABR_DURATION_THRESHOLD_S || device.reports_variable_bandwidth;

        let transcode_request = TranscodeRequest {
            input_path: path.to_path_buf(),
            seek_offset: 0.0,
            container,
            video_codec,
            audio_codec,
            quality,
            speed_priority: SpeedPriority::Balanced,
            resolution,
            enable_abr,
            provider_settings: Default::default(),
        };

        Ok(PlaybackDecision {
            should_transcode: true,
            reason,
            direct_play_url: None,
            transcode_request: Some(transcode_request),
        })
    }
}

fn direct_play_url(path: &Path) -> String {
    format!("/media/files/{}/stream", urlencode_path(path))
}

fn urlencode_path(path: &Path) -> String {
    // Minimal percent-encoding: the direct-play id is the filesystem path
    // itself, since this core has no media-library database to resolve an
    // opaque id from. Slashes survive as `%2F` so the path round-trips
    // through a single axum path segment.
    path.to_string_lossy().replace('%', "%25").replace('/', "%2F")
}

/// Baseline quality used when the device doesn't otherwise hint at one.
/// Devices reporting HDR support get a small quality bump since HDR
/// passthrough usually pairs with wanting less aggressive compression.
fn default_quality_for(device: &DeviceProfile) -> u8 {
    if device.supports_hdr { 85 } else { 70 }
}

fn codec_for_device(device: &DeviceProfile, quality: u8) -> (String, String) {
    if device.supports_av1 && quality >= AV1_QUALITY_THRESHOLD {
        ("av1".to_string(), "aac".to_string())
    } else if device.supports_hevc && quality >= HEVC_QUALITY_THRESHOLD {
        ("hevc".to_string(), "aac".to_string())
    } else {
        ("h264".to_string(), "aac".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(user_agent: &str) -> DeviceProfile {
        DeviceProfile {
            user_agent: user_agent.to_string(),
            supported_codecs: vec!["h264".to_string(), "aac".to_string()],
            max_resolution: (1920, 1080),
            max_bitrate_kbps: 10_000,
            supports_hevc: false,
            supports_av1: false,
            supports_hdr: false,
            supports_mkv: false,
            reports_variable_bandwidth: false,
            client_ip: None,
        }
    }

    #[test]
    fn container_family_detects_common_ffprobe_aliases() {
        assert_eq!(container_family("mov,mp4,m4a,3gp,3g2,mj2"), ContainerFamily::Mp4);
        assert_eq!(container_family("matroska,webm"), ContainerFamily::Mkv);
        assert_eq!(container_family("webm"), ContainerFamily::WebM);
        assert_eq!(container_family("avi"), ContainerFamily::Other);
    }

    #[test]
    fn ua_maps_to_expected_container() {
        assert_eq!(target_container_for_ua("Mozilla/5.0 Chrome/120"), Container::Dash);
        assert_eq!(target_container_for_ua("Mozilla/5.0 Firefox/120"), Container::Dash);
        assert_eq!(target_container_for_ua("Mozilla/5.0 (iPhone) Safari/604"), Container::Hls);
        assert_eq!(target_container_for_ua("SomeRandomClient/1.0"), Container::Mp4);
    }

    #[test]
    fn codec_selection_falls_back_to_universal_baseline() {
        let d = device("Chrome");
        let (v, a) = codec_for_device(&d, 70);
        assert_eq!(v, "h264");
        assert_eq!(a, "aac");
    }

    #[test]
    fn codec_selection_uses_hevc_for_capable_high_quality_device() {
        let mut d = device("Chrome");
        d.supports_hevc = true;
        let (v, _) = codec_for_device(&d, 85);
        assert_eq!(v, "hevc");

        let (v_low_quality, _) = codec_for_device(&d, 50);
        assert_eq!(v_low_quality, "h264");
    }
}
