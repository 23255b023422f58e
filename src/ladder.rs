//! ABR Ladder Generator: given source dimensions and a target quality,
//! produce a deterministic, descending-bitrate ladder of rungs.

use crate::domain::{AbrLadder, Rung};

/// Fixed rung catalog, ascending order (index 0 is the lowest rendition).
const CATALOG: &[Rung] = &[
    Rung { label: "240p", width: 426, height: 240, video_bitrate_kbps: 400, audio_bitrate_kbps: 64, profile: "baseline", level: "3.0", crf: 28 },
    Rung { label: "360p", width: 640, height: 360, video_bitrate_kbps: 800, audio_bitrate_kbps: 64, profile: "baseline", level: "3.0", crf: 26 },
    Rung { label: "480p", width: 854, height: 480, video_bitrate_kbps: 1400, audio_bitrate_kbps: 96, profile: "main", level: "3.1", crf: 24 },
    Rung { label: "720p", width: 1280, height: 720, video_bitrate_kbps: 2800, audio_bitrate_kbps: 96, profile: "main", level: "3.1", crf: 23 },
    Rung { label: "1080p", width: 1920, height: 1080, video_bitrate_kbps: 5000, audio_bitrate_kbps: 128, profile: "high", level: "4.1", crf: 21 },
    Rung { label: "1440p", width: 2560, height: 1440, video_bitrate_kbps: 9000, audio_bitrate_kbps: 128, profile: "high", level: "5.1", crf: 20 },
    Rung { label: "2160p", width: 3840, height: 2160, video_bitrate_kbps: 16000, audio_bitrate_kbps: 128, profile: "high", level: "5.2", crf: 19 },
];

const MAX_RUNGS: usize = 6;

/// Build a ladder whose top rung does not exceed the source resolution.
/// Quality in `[0,100]` shifts the CRF floor and, at the low end, drops the
/// highest rungs so low-quality requests don't waste bandwidth on a rendition
/// nobody will pick.
pub fn generate(source_width: u32, source_height: u32, quality: u8) -> AbrLadder {
    let mut eligible: Vec<Rung> = CATALOG
        .iter()
        .copied()
        .filter(|r| r.width <= source_width.max(1) && r.height <= source_height.max(1))
        .collect();

    if eligible.is_empty() {
        // Source is smaller than our lowest catalog rung; still need ≥1 rung,
        // so fall back to the source's own dimensions at the lowest tier.
        let lowest = CATALOG[0];
        eligible.push(Rung {
            width: source_width.max(1),
            height: source_height.max(1),
            ..lowest
        });
    }

    // Lower quality settings drop the highest rungs first.
    let keep = match quality {
        0..=20 => 1,
        21..=40 => 2,
        41..=60 => 3,
        61..=80 => 4,
        81..=95 => 5,
        _ => MAX_RUNGS,
    };
    if eligible.len() > keep {
        let drop = eligible.len() - keep;
        eligible.drain(0..drop);
    }
    eligible.truncate(MAX_RUNGS);

    // Higher quality raises the CRF floor (lower CRF = higher quality) for
    // every surviving rung, clamped to the codec-sane [18, 35] window.
    let crf_adjustment: i16 = 18 - (quality as i16 * 17 / 100);
    for rung in &mut eligible {
        let adjusted = rung.crf as i16 + crf_adjustment;
        rung.crf = adjusted.clamp(18, 35) as u8;
    }

    eligible.sort_by(|a, b| b.video_bitrate_kbps.cmp(&a.video_bitrate_kbps));
    AbrLadder { rungs: eligible }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_rung_never_exceeds_source_resolution() {
        let ladder = generate(1920, 1080, 70);
        assert!(ladder.rungs.iter().all(|r| r.width <= 1920 && r.height <= 1080));
        assert_eq!(ladder.rungs[0].label, "1080p");
    }

    #[test]
    fn rungs_descend_by_bitrate() {
        let ladder = generate(3840, 2160, 90);
        for pair in ladder.rungs.windows(2) {
            assert!(pair[0].video_bitrate_kbps >= pair[1].video_bitrate_kbps);
        }
    }

    #[test]
    fn ladder_bounds_are_respected() {
        let ladder = generate(3840, 2160, 100);
        assert!(!ladder.rungs.is_empty());
        assert!(ladder.rungs.len() <= 6);

        let low_quality = generate(3840, 2160, 5);
        assert_eq!(low_quality.rungs.len(), 1);
    }

    #[test]
    fn tiny_source_still_yields_one_rung() {
        let ladder = generate(320, 180, 50);
        assert_eq!(ladder.rungs.len(), 1);
        assert_eq!(ladder.rungs[0].width, 320);
        assert_eq!(ladder.rungs[0].height, 180);
    }
}
