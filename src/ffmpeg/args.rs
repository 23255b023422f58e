//! FFmpeg Argument Builder — the core of this crate.
//!
//! `build()` assembles a strictly-ordered argument vector — global flags,
//! input flags (including seek), `-i <input>`, per-stream encoding flags,
//! container-specific muxer flags, output path — and never reads anything
//! beyond the [TranscodeRequest], [ResourceConfig], [MediaInfo], and an
//! optional [AbrLadder]. `validate()` is a separate, side-effect-free check
//! runnable against any argument vector, fabricated or real.

use std::path::Path;

use crate::domain::{AbrLadder, Container, SpeedPriority, TranscodeRequest};
use crate::error::CoreError;
use crate::media::MediaInfo;
use crate::resources::ResourceConfig;

const ALLOWED_H264_PROFILES: &[&str] = &["baseline", "main", "high", "main10"];

pub struct ArgBuilder;

impl ArgBuilder {
    /// `BuildArgs(request, output_path) -> []string`.
    pub fn build(
        req: &TranscodeRequest,
        resources: &ResourceConfig,
        media: &MediaInfo,
        ladder: Option<&AbrLadder>,
        segment_duration_s: f64,
        output_path: &Path,
    ) -> Result<Vec<String>, CoreError> {
        if req.quality > 100 {
            return Err(CoreError::InvalidRequest(format!(
                "quality {} out of range [0,100]",
                req.quality
            )));
        }
        if req.enable_abr && req.container == Container::Mp4 {
            return Err(CoreError::UnsupportedCombination(
                "progressive mp4 cannot carry an ABR ladder".to_string(),
            ));
        }
        if req.enable_abr && ladder.is_none() {
            return Err(CoreError::InvalidRequest(
                "enable_abr set without a ladder".to_string(),
            ));
        }

        let mut args = Vec::new();
        args.extend(global_flags(req, resources));
        args.extend(input_flags(req));
        args.push("-i".to_string());
        args.push(req.input_path.to_string_lossy().to_string());
        args.extend(stream_flags(req, resources, media, ladder, segment_duration_s)?);
        args.extend(muxer_flags(req, ladder)?);
        args.push(output_path.to_string_lossy().to_string());

        let args = sanitize(args);
        Self::validate(&args)?;
        Ok(args)
    }

    /// `Validate([]string) -> error`. Side-effect-free; safe to call on any
    /// argument vector, including ones assembled outside [build].
    pub fn validate(args: &[String]) -> Result<(), CoreError> {
        if !args.iter().any(|a| a == "-i") {
            return Err(CoreError::InvalidRequest("missing -i".to_string()));
        }
        if !args.iter().any(|a| a == "-f") {
            return Err(CoreError::InvalidRequest("missing -f".to_string()));
        }
        match args.last() {
            Some(last) if !last.starts_with('-') => {}
            _ => return Err(CoreError::InvalidRequest("missing output path".to_string())),
        }

        if args.iter().any(|a| a == "-profile") {
            return Err(CoreError::InvalidRequest(
                "ambiguous -profile: must be -profile:v or -profile:a".to_string(),
            ));
        }

        let vf_count = args.iter().filter(|a| a.as_str() == "-vf").count();
        if vf_count > 1 {
            return Err(CoreError::InvalidRequest(
                "duplicate -vf on the same stream".to_string(),
            ));
        }

        for (i, arg) in args.iter().enumerate() {
            if arg.starts_with("-profile:") {
                let value = args.get(i + 1).map(String::as_str).unwrap_or("");
                if !ALLOWED_H264_PROFILES.contains(&value) {
                    return Err(CoreError::InvalidRequest(format!(
                        "invalid profile value: {}",
                        value
                    )));
                }
            }
            if arg.starts_with("-level:") {
                let value = args.get(i + 1).map(String::as_str).unwrap_or("");
                if !value.chars().all(|c| c.is_ascii_digit() || c == '.') || value.is_empty() {
                    return Err(CoreError::InvalidRequest(format!(
                        "invalid level value: {}",
                        value
                    )));
                }
            }
            if arg == "-hls_playlist_type" {
                let value = args.get(i + 1).map(String::as_str).unwrap_or("");
                if value != "vod" && value != "event" {
                    return Err(CoreError::InvalidRequest(format!(
                        "invalid hls_playlist_type: {}",
                        value
                    )));
                }
            }
            if arg == "-hwaccel" {
                let value = args.get(i + 1).map(String::as_str).unwrap_or("");
                if value != "auto" {
                    return Err(CoreError::InvalidRequest(format!(
                        "unknown -hwaccel type: {}",
                        value
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Strips known-bad flags and disambiguates a bare `-profile` to `-profile:v`.
/// Runs before [ArgBuilder::validate] inside [ArgBuilder::build].
fn sanitize(args: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.into_iter().peekable();
    while let Some(arg) = iter.next() {
        if arg == "-base_url" {
            iter.next(); // drop its value too
            continue;
        }
        if arg == "-profile" {
            out.push("-profile:v".to_string());
            continue;
        }
        out.push(arg);
    }
    out
}

fn global_flags(req: &TranscodeRequest, resources: &ResourceConfig) -> Vec<String> {
    let mut flags = vec!["-hide_banner".to_string(), "-y".to_string()];
    flags.push("-threads".to_string());
    flags.push(resources.thread_count.to_string());
    flags.push("-probesize".to_string());
    flags.push(resources.probe_size_bytes.to_string());
    flags.push("-analyzeduration".to_string());
    flags.push(resources.analyze_duration_us.to_string());
    if req.provider_settings.get("hwaccel").map(String::as_str) == Some("auto") {
        flags.push("-hwaccel".to_string());
        flags.push("auto".to_string());
    }
    flags
}

fn input_flags(req: &TranscodeRequest) -> Vec<String> {
    if req.seek_offset > 0.0 {
        vec!["-ss".to_string(), format!("{:.3}", req.seek_offset)]
    } else {
        Vec::new()
    }
}

/// GOP size `G = S·F` (segment duration times frame rate).
fn gop_size(segment_duration_s: f64, frame_rate: f64) -> u32 {
    (segment_duration_s * frame_rate).round().max(1.0) as u32
}

/// `crf = clamp(round(35 − quality·17/100), 18, 35)`.
fn crf_for_quality(quality: u8) -> u8 {
    let raw = 35.0 - (quality as f64) * 17.0 / 100.0;
    raw.round().clamp(18.0, 35.0) as u8
}

fn h264_profile_level(quality: u8) -> (&'static str, &'static str) {
    if quality < 30 {
        ("baseline", "3.0")
    } else {
        ("high", "4.1")
    }
}

fn software_codec_for(video_codec: &str) -> &'static str {
    match video_codec {
        "hevc" | "h265" => "libx265",
        "vp9" => "libvpx-vp9",
        "av1" => "libaom-av1",
        _ => "libx264",
    }
}

fn keyframe_flags(gop: u32, segment_duration_s: f64) -> Vec<String> {
    vec![
        "-g".to_string(),
        gop.to_string(),
        "-keyint_min".to_string(),
        gop.to_string(),
        "-sc_threshold".to_string(),
        "0".to_string(),
        "-flags".to_string(),
        "+cgop".to_string(),
        "-force_key_frames".to_string(),
        format!("expr:gte(t,n_forced*{})", segment_duration_s),
    ]
}

fn audio_flags(audio_bitrate_kbps: u32) -> Vec<String> {
    vec![
        "-c:a".to_string(),
        "aac".to_string(),
        "-ac".to_string(),
        "2".to_string(),
        "-ar".to_string(),
        "48000".to_string(),
        "-b:a".to_string(),
        format!("{}k", audio_bitrate_kbps),
    ]
}

fn stream_flags(
    req: &TranscodeRequest,
    resources: &ResourceConfig,
    media: &MediaInfo,
    ladder: Option<&AbrLadder>,
    segment_duration_s: f64,
) -> Result<Vec<String>, CoreError> {
    let frame_rate = if media.frame_rate > 0.0 { media.frame_rate } else { 30.0 };
    let gop = gop_size(segment_duration_s, frame_rate);
    let codec = software_codec_for(&req.video_codec);

    let mut flags = Vec::new();

    if let Some(ladder) = ladder {
        for (i, rung) in ladder.rungs.iter().enumerate() {
            flags.push("-map".to_string());
            flags.push("0:v:0".to_string());
            flags.push("-map".to_string());
            flags.push("0:a:0".to_string());

            flags.push(format!("-c:v:{}", i));
            flags.push(codec.to_string());
            flags.push(format!("-preset:v:{}", i));
            flags.push(resources.encoder_preset.to_string());
            flags.push(format!("-b:v:{}", i));
            flags.push(format!("{}k", rung.video_bitrate_kbps));
            flags.push(format!("-crf:v:{}", i));
            flags.push(rung.crf.to_string());
            flags.push(format!("-s:v:{}", i));
            flags.push(format!("{}x{}", rung.width, rung.height));
            if codec == "libx264" {
                flags.push(format!("-profile:v:{}", i));
                flags.push(rung.profile.to_string());
                flags.push(format!("-level:v:{}", i));
                flags.push(rung.level.to_string());
            }
            flags.push(format!("-max_muxing_queue_size:v:{}", i));
            flags.push(resources.muxing_queue_size.to_string());
            flags.push(format!("-bufsize:v:{}", i));
            flags.push(format!("{}k", resources.buffer_size_kb));
            flags.push(format!("-rc-lookahead:v:{}", i));
            flags.push(resources.rc_lookahead.to_string());
            flags.push(format!("-g:v:{}", i));
            flags.push(gop.to_string());
            flags.push(format!("-keyint_min:v:{}", i));
            flags.push(gop.to_string());
            flags.push(format!("-sc_threshold:v:{}", i));
            flags.push("0".to_string());

            flags.push(format!("-c:a:{}", i));
            flags.push("aac".to_string());
            flags.push(format!("-ac:a:{}", i));
            flags.push("2".to_string());
            flags.push(format!("-ar:a:{}", i));
            flags.push("48000".to_string());
            flags.push(format!("-b:a:{}", i));
            flags.push(format!("{}k", rung.audio_bitrate_kbps));
        }
        flags.push("-sc_threshold".to_string());
        flags.push("0".to_string());
        flags.push("-flags".to_string());
        flags.push("+cgop".to_string());
        flags.push("-force_key_frames".to_string());
        flags.push(format!("expr:gte(t,n_forced*{})", segment_duration_s));
    } else {
        let crf = crf_for_quality(req.quality);
        flags.push("-c:v".to_string());
        flags.push(codec.to_string());
        flags.push("-preset".to_string());
        flags.push(resources.encoder_preset.to_string());
        flags.push("-crf".to_string());
        flags.push(crf.to_string());
        if codec == "libx264" {
            let (profile, level) = h264_profile_level(req.quality);
            flags.push("-profile:v".to_string());
            flags.push(profile.to_string());
            flags.push("-level:v".to_string());
            flags.push(level.to_string());
        }
        flags.push("-max_muxing_queue_size".to_string());
        flags.push(resources.muxing_queue_size.to_string());
        flags.push("-bufsize".to_string());
        flags.push(format!("{}k", resources.buffer_size_kb));
        flags.push("-rc-lookahead".to_string());
        flags.push(resources.rc_lookahead.to_string());
        if let Some((w, h)) = req.resolution {
            flags.push("-vf".to_string());
            flags.push(format!("scale={}:-2", w.min(h.max(w))));
        }
        flags.extend(keyframe_flags(gop, segment_duration_s));
        flags.extend(audio_flags(128));
    }

    Ok(flags)
}

fn muxer_flags(req: &TranscodeRequest, ladder: Option<&AbrLadder>) -> Result<Vec<String>, CoreError> {
    match req.container {
        Container::Mp4 => Ok(vec![
            "-f".to_string(),
            "mp4".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
        ]),
        Container::Dash => {
            let mut flags = vec!["-f".to_string(), "dash".to_string()];
            if let Some(ladder) = ladder {
                if ladder.rungs.is_empty() {
                    return Err(CoreError::InvalidRequest("empty ABR ladder".to_string()));
                }
                let video_indices: Vec<String> =
                    (0..ladder.rungs.len()).map(|i| (i * 2).to_string()).collect();
                let audio_indices: Vec<String> =
                    (0..ladder.rungs.len()).map(|i| (i * 2 + 1).to_string()).collect();
                flags.push("-adaptation_sets".to_string());
                flags.push(format!(
                    "id=0,streams={} id=1,streams={}",
                    video_indices.join(","),
                    audio_indices.join(",")
                ));
            }
            flags.push("-init_seg_name".to_string());
            flags.push("init-$RepresentationID$.m4s".to_string());
            flags.push("-media_seg_name".to_string());
            flags.push("chunk-$RepresentationID$-$Number%05d$.m4s".to_string());
            flags.push("-use_timeline".to_string());
            flags.push("0".to_string());
            flags.push("-use_template".to_string());
            flags.push("1".to_string());
            flags.push("-single_file".to_string());
            flags.push("0".to_string());
            flags.push("-window_size".to_string());
            flags.push("0".to_string());
            flags.push("-remove_at_exit".to_string());
            flags.push("0".to_string());
            flags.push("-streaming".to_string());
            flags.push("0".to_string());
            flags.push("-ldash".to_string());
            flags.push("0".to_string());
            flags.push("-movflags".to_string());
            flags.push("+dash+cmaf+faststart+delay_moov".to_string());
            Ok(flags)
        }
        Container::Hls => {
            let mut flags = vec![
                "-f".to_string(),
                "hls".to_string(),
                "-hls_segment_type".to_string(),
                "fmp4".to_string(),
                "-hls_playlist_type".to_string(),
                "vod".to_string(),
                "-hls_fmp4_init_filename".to_string(),
                "init.mp4".to_string(),
            ];
            if let Some(ladder) = ladder {
                let var_stream_map: Vec<String> = (0..ladder.rungs.len())
                    .map(|i| format!("v:{},a:{}", i, i))
                    .collect();
                flags.push("-master_pl_name".to_string());
                flags.push("master.m3u8".to_string());
                flags.push("-var_stream_map".to_string());
                flags.push(var_stream_map.join(" "));
            }
            Ok(flags)
        }
    }
}

/// Segment duration: 2 s if `seek > 0` else 3 s for HLS; the configured
/// default (normally 2 s) for everything else.
pub fn segment_duration_for(req: &TranscodeRequest, default_segment_duration_s: f64) -> f64 {
    if req.container == Container::Hls {
        if req.seek_offset > 0.0 { 2.0 } else { 3.0 }
    } else {
        default_segment_duration_s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn req(container: Container, enable_abr: bool, quality: u8) -> TranscodeRequest {
        TranscodeRequest {
            input_path: PathBuf::from("/media/a.mkv"),
            seek_offset: 0.0,
            container,
            video_codec: "h264".to_string(),
            audio_codec: "aac".to_string(),
            quality,
            speed_priority: SpeedPriority::Balanced,
            resolution: None,
            enable_abr,
            provider_settings: Default::default(),
        }
    }

    fn media() -> MediaInfo {
        MediaInfo {
            container: "matroska".to_string(),
            video_codec: Some("h264".to_string()),
            audio_codec: Some("aac".to_string()),
            width: 1920,
            height: 1080,
            bitrate_kbps: 8000,
            duration_s: 3600.0,
            frame_rate: 30.0,
        }
    }

    fn resources() -> ResourceConfig {
        ResourceConfig {
            thread_count: 4,
            muxing_queue_size: 1024,
            buffer_size_kb: 512,
            rc_lookahead: 10,
            encoder_preset: "faster",
            probe_size_bytes: 5_000_000,
            analyze_duration_us: 5_000_000,
        }
    }

    #[test]
    fn crf_mapping_matches_formula() {
        assert_eq!(crf_for_quality(0), 35);
        assert_eq!(crf_for_quality(100), 18);
        assert_eq!(crf_for_quality(70), 23);
    }

    #[test]
    fn gop_size_multiplies_segment_by_frame_rate() {
        assert_eq!(gop_size(2.0, 30.0), 60);
        assert_eq!(gop_size(3.0, 24.0), 72);
    }

    #[test]
    fn build_orders_sections_strictly() {
        let r = req(Container::Mp4, false, 70);
        let args = ArgBuilder::build(&r, &resources(), &media(), None, 2.0, Path::new("/out/a.mp4"))
            .unwrap();
        let i_pos = args.iter().position(|a| a == "-i").unwrap();
        let input_pos = args.iter().position(|a| a.contains("a.mkv")).unwrap();
        assert_eq!(input_pos, i_pos + 1);
        let f_pos = args.iter().position(|a| a == "-f").unwrap();
        assert!(f_pos > i_pos);
        assert_eq!(args.last().unwrap(), "/out/a.mp4");
    }

    #[test]
    fn global_flags_emit_probe_and_analyze_duration() {
        let r = req(Container::Mp4, false, 70);
        let args = ArgBuilder::build(&r, &resources(), &media(), None, 2.0, Path::new("/out/a.mp4"))
            .unwrap();
        let probe_pos = args.iter().position(|a| a == "-probesize").unwrap();
        assert_eq!(args[probe_pos + 1], "5000000");
        let analyze_pos = args.iter().position(|a| a == "-analyzeduration").unwrap();
        assert_eq!(args[analyze_pos + 1], "5000000");
    }

    #[test]
    fn stream_flags_emit_muxing_queue_bufsize_and_lookahead() {
        let r = req(Container::Mp4, false, 70);
        let args = ArgBuilder::build(&r, &resources(), &media(), None, 2.0, Path::new("/out/a.mp4"))
            .unwrap();
        let mux_pos = args.iter().position(|a| a == "-max_muxing_queue_size").unwrap();
        assert_eq!(args[mux_pos + 1], "1024");
        let buf_pos = args.iter().position(|a| a == "-bufsize").unwrap();
        assert_eq!(args[buf_pos + 1], "512k");
        let look_pos = args.iter().position(|a| a == "-rc-lookahead").unwrap();
        assert_eq!(args[look_pos + 1], "10");
    }

    #[test]
    fn abr_stream_flags_suffix_muxing_queue_bufsize_and_lookahead_per_rung() {
        let mut r = req(Container::Dash, true, 70);
        r.resolution = Some((1920, 1080));
        let ladder = crate::ladder::generate(1920, 1080, 70);
        let args =
            ArgBuilder::build(&r, &resources(), &media(), Some(&ladder), 2.0, Path::new("/out/manifest.mpd"))
                .unwrap();
        assert!(args.iter().any(|a| a == "-max_muxing_queue_size:v:0"));
        assert!(args.iter().any(|a| a == "-bufsize:v:0"));
        assert!(args.iter().any(|a| a == "-rc-lookahead:v:0"));
    }

    #[test]
    fn abr_dash_emits_adaptation_sets_and_window_size_zero() {
        let mut r = req(Container::Dash, true, 70);
        r.resolution = Some((1920, 1080));
        let ladder = crate::ladder::generate(1920, 1080, 70);
        assert!(ladder.rungs.len() >= 3);
        let args =
            ArgBuilder::build(&r, &resources(), &media(), Some(&ladder), 2.0, Path::new("/out/manifest.mpd"))
                .unwrap();

        let as_pos = args.iter().position(|a| a == "-adaptation_sets").unwrap();
        let spec = &args[as_pos + 1];
        assert!(spec.starts_with("id=0,streams=0,2,4"));
        assert!(spec.contains("id=1,streams=1,3,5"));

        let ws_pos = args.iter().position(|a| a == "-window_size").unwrap();
        assert_eq!(args[ws_pos + 1], "0");
        assert!(args.iter().any(|a| a == "-use_template"));
        assert!(args.iter().any(|a| a == "-use_timeline"));
    }

    #[test]
    fn mp4_rejects_abr() {
        let r = req(Container::Mp4, true, 70);
        let err =
            ArgBuilder::build(&r, &resources(), &media(), None, 2.0, Path::new("/out/a.mp4")).unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedCombination(_)));
    }

    #[test]
    fn validate_rejects_bare_profile() {
        let args: Vec<String> = vec![
            "-i".into(), "in.mp4".into(), "-profile".into(), "high".into(), "-f".into(), "mp4".into(), "out.mp4".into(),
        ];
        assert!(ArgBuilder::validate(&args).is_err());
    }

    #[test]
    fn validate_rejects_duplicate_vf() {
        let args: Vec<String> = vec![
            "-i".into(), "in.mp4".into(), "-vf".into(), "scale=640:-2".into(),
            "-vf".into(), "scale=1280:-2".into(), "-f".into(), "mp4".into(), "out.mp4".into(),
        ];
        assert!(ArgBuilder::validate(&args).is_err());
    }

    #[test]
    fn validate_rejects_missing_output() {
        let args: Vec<String> = vec!["-i".into(), "in.mp4".into(), "-f".into(), "mp4".into()];
        assert!(ArgBuilder::validate(&args).is_err());
    }

    #[test]
    fn sanitizer_strips_base_url_and_disambiguates_profile() {
        let raw = vec![
            "-base_url".to_string(), "http://evil".to_string(),
            "-profile".to_string(), "high".to_string(),
        ];
        let cleaned = sanitize(raw);
        assert!(!cleaned.iter().any(|a| a == "-base_url"));
        assert!(cleaned.iter().any(|a| a == "-profile:v"));
    }

    #[test]
    fn build_is_deterministic() {
        let r = req(Container::Mp4, false, 70);
        let a = ArgBuilder::build(&r, &resources(), &media(), None, 2.0, Path::new("/out/a.mp4")).unwrap();
        let b = ArgBuilder::build(&r, &resources(), &media(), None, 2.0, Path::new("/out/a.mp4")).unwrap();
        assert_eq!(a, b);
    }
}
