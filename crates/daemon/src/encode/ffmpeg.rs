//! ffmpeg command builder for synthetic live streams
//!
//! Produces a lavfi test pattern with a burned-in caption and a looping
//! beep, packaged as segmented DASH (and optionally HLS) output.

use crate::jobs::OutputFormat;
use crate::validate::{JobSpec, VideoCodec};
use std::path::Path;
use std::process::Command;

/// Overlay shown when a job has no description.
pub const FALLBACK_OVERLAY_TEXT: &str = "Test Live Stream";

/// Longest caption burned into the video, in characters.
pub const MAX_OVERLAY_CHARS: usize = 50;

/// Punctuation allowed through into the drawtext expression besides
/// alphanumerics and spaces. Nothing here is special to the filtergraph
/// parser or to drawtext's `%{...}` expansion.
const OVERLAY_PUNCTUATION: &[char] = &['-', '_', '.', '!', '?', '#', '@', '+', '(', ')', '/'];

const BEEP_SOURCE: &str = "sine=frequency=1200:sample_rate={rate}:duration=0.03,afade=t=out:st=0.02:d=0.01,apad=pad_dur=0.97";

/// Caption text for a job description.
///
/// Falls back to [`FALLBACK_OVERLAY_TEXT`] when empty, truncates to
/// [`MAX_OVERLAY_CHARS`] characters and drops everything outside the
/// allow-list. A description with nothing printable left also falls back.
pub fn overlay_text(description: &str) -> String {
    let source = if description.is_empty() {
        FALLBACK_OVERLAY_TEXT
    } else {
        description
    };

    let text: String = source
        .chars()
        .take(MAX_OVERLAY_CHARS)
        .filter(|c| c.is_alphanumeric() || *c == ' ' || OVERLAY_PUNCTUATION.contains(c))
        .collect();

    if text.trim().is_empty() {
        FALLBACK_OVERLAY_TEXT.to_string()
    } else {
        text
    }
}

fn filter_graph(spec: &JobSpec) -> String {
    let caption = overlay_text(&spec.description);
    let tracks = spec.audio_track_count();

    let audio_labels: String = (0..tracks).map(|i| format!("[a{}]", i)).collect();
    let audio_chain = if tracks > 1 {
        format!(
            "[1:a]aloop=loop=-1:size={},asplit={}{}",
            spec.audio.sample_rate, tracks, audio_labels
        )
    } else {
        format!("[1:a]aloop=loop=-1:size={}{}", spec.audio.sample_rate, audio_labels)
    };

    format!(
        "[0:v]drawtext=text='{}':fontsize=42:fontcolor=white:x=50+500*abs(sin(t/2)):y=(h-text_h)/3:box=1:boxcolor=black@0.7,\
         drawtext=text='Frame %{{frame_num}}':fontsize=28:fontcolor=cyan:x=10:y=h-40:box=1:boxcolor=black@0.7[v];{}",
        caption, audio_chain
    )
}

/// Build the encoder command for a job
///
/// # Arguments
/// * `program` - Encoder executable
/// * `spec` - Validated encode configuration
/// * `output_dir` - Job output directory; the DASH manifest is written as
///   `manifest.mpd` inside it
pub fn build_encoder_command(program: &str, spec: &JobSpec, output_dir: &Path) -> Command {
    let mut cmd = Command::new(program);
    let video = &spec.video;
    let audio = &spec.audio;

    cmd.args(["-hide_banner", "-nostdin", "-loglevel", "warning", "-re"]);

    // Sources
    cmd.arg("-f").arg("lavfi");
    cmd.arg("-i").arg(format!(
        "testsrc=size={}x{}:rate={}",
        video.width, video.height, video.framerate
    ));
    cmd.arg("-f").arg("lavfi");
    cmd.arg("-i")
        .arg(BEEP_SOURCE.replace("{rate}", &audio.sample_rate.to_string()));

    cmd.arg("-filter_complex").arg(filter_graph(spec));
    cmd.arg("-map").arg("[v]");
    for i in 0..spec.audio_track_count() {
        cmd.arg("-map").arg(format!("[a{}]", i));
    }

    // Video: keyframe on every segment boundary
    let gop = (u64::from(video.framerate) * u64::from(spec.segment_length)).to_string();
    cmd.arg("-c:v").arg(video.codec.encoder());
    cmd.arg("-b:v").arg(format!("{}k", video.bitrate_kbps));
    cmd.arg("-g").arg(&gop);
    cmd.arg("-keyint_min").arg(&gop);
    match video.codec {
        VideoCodec::H264 => {
            cmd.arg("-x264-params").arg("scenecut=0:open_gop=0");
            cmd.arg("-preset").arg("fast");
        }
        VideoCodec::H265 => {
            cmd.arg("-x265-params").arg("scenecut=0:open-gop=0");
            cmd.arg("-preset").arg("fast");
        }
        VideoCodec::Vp9 | VideoCodec::Av1 => {
            cmd.arg("-sc_threshold").arg("0");
        }
    }

    // Audio
    cmd.arg("-c:a").arg(audio.codec.encoder());
    cmd.arg("-b:a").arg(format!("{}k", audio.bitrate_kbps));
    cmd.arg("-ar").arg(audio.sample_rate.to_string());
    cmd.arg("-ac").arg(audio.channels.to_string());
    if let Some(langs) = &spec.audio_languages {
        for (i, lang) in langs.languages.iter().enumerate() {
            cmd.arg(format!("-metadata:s:a:{}", i))
                .arg(format!("language={}", lang));
            let is_default = langs.default_language.as_deref() == Some(lang.as_str());
            cmd.arg(format!("-disposition:a:{}", i))
                .arg(if is_default { "default" } else { "0" });
        }
    }

    // Packaging
    cmd.arg("-f").arg("dash");
    cmd.arg("-seg_duration").arg(spec.segment_length.to_string());
    cmd.arg("-window_size").arg(spec.window_size.to_string());
    cmd.arg("-use_template").arg("1");
    cmd.arg("-use_timeline").arg("1");
    if spec.has_format(OutputFormat::Hls) {
        cmd.arg("-hls_playlist").arg("1");
    }
    cmd.arg("-streaming").arg("1");
    cmd.arg("-write_prft").arg("1");
    cmd.arg("-y")
        .arg(output_dir.join(OutputFormat::Dash.manifest_name()));

    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::{validate, AudioConfigRequest, JobCreateRequest, VideoTrackRequest};
    use livesynth_config::{EncoderConfig, LimitsConfig};
    use proptest::prelude::*;
    use std::ffi::OsStr;
    use std::path::PathBuf;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn has_flag(args: &[String], flag: &str) -> bool {
        args.iter().any(|arg| arg == flag)
    }

    fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.windows(2)
            .find(|pair| pair[0] == flag)
            .map(|pair| pair[1].as_str())
    }

    fn spec_for(request: JobCreateRequest) -> JobSpec {
        validate(&request, &LimitsConfig::default(), &EncoderConfig::default()).unwrap()
    }

    fn default_spec(description: &str) -> JobSpec {
        spec_for(JobCreateRequest {
            description: description.to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_overlay_empty_description_falls_back() {
        assert_eq!(overlay_text(""), FALLBACK_OVERLAY_TEXT);
    }

    #[test]
    fn test_overlay_truncates_to_50_chars() {
        let long = "a".repeat(80);
        let text = overlay_text(&long);
        assert_eq!(text.chars().count(), 50);
        assert_eq!(text, "a".repeat(50));

        // multi-byte characters are counted, not bytes
        let wide = "é".repeat(60);
        assert_eq!(overlay_text(&wide).chars().count(), 50);
    }

    #[test]
    fn test_overlay_strips_filter_syntax() {
        let hostile = "x':text='pwned':fontfile=/etc/passwd,[v];%{pts}\\";
        let text = overlay_text(hostile);
        for forbidden in ['\'', ':', ',', ';', '[', ']', '%', '{', '}', '\\', '='] {
            assert!(!text.contains(forbidden), "{:?} leaked into {:?}", forbidden, text);
        }
        assert_eq!(overlay_text("'''::"), FALLBACK_OVERLAY_TEXT);
    }

    #[test]
    fn test_command_defaults() {
        let spec = default_spec("Test job");
        let out = PathBuf::from("/srv/media/job-1");
        let cmd = build_encoder_command("ffmpeg", &spec, &out);
        let args = get_command_args(&cmd);

        assert_eq!(cmd.get_program(), OsStr::new("ffmpeg"));
        assert!(has_flag_with_value(&args, "-i", "testsrc=size=1280x720:rate=30"));
        assert!(has_flag_with_value(&args, "-c:v", "libx264"));
        assert!(has_flag_with_value(&args, "-b:v", "1000k"));
        assert!(has_flag_with_value(&args, "-g", "180"));
        assert!(has_flag_with_value(&args, "-keyint_min", "180"));
        assert!(has_flag_with_value(&args, "-c:a", "aac"));
        assert!(has_flag_with_value(&args, "-b:a", "128k"));
        assert!(has_flag_with_value(&args, "-ar", "44100"));
        assert!(has_flag_with_value(&args, "-ac", "2"));
        assert!(has_flag_with_value(&args, "-f", "dash"));
        assert!(has_flag_with_value(&args, "-seg_duration", "6"));
        assert!(has_flag_with_value(&args, "-window_size", "6"));
        assert!(has_flag_with_value(&args, "-hls_playlist", "1"));
        assert!(has_flag_with_value(&args, "-map", "[v]"));
        assert!(has_flag_with_value(&args, "-map", "[a0]"));
        assert!(has_flag(&args, "-re"));
        assert_eq!(
            args.last().map(String::as_str),
            Some("/srv/media/job-1/manifest.mpd")
        );

        let filter = flag_value(&args, "-filter_complex").unwrap();
        assert!(filter.contains("drawtext=text='Test job'"));
        assert!(filter.contains("[1:a]aloop=loop=-1:size=44100[a0]"));
    }

    #[test]
    fn test_command_dash_only_omits_hls_playlist() {
        let spec = spec_for(JobCreateRequest {
            output_format: vec![OutputFormat::Dash],
            window_size: Some(0),
            ..Default::default()
        });
        let args = get_command_args(&build_encoder_command("ffmpeg", &spec, Path::new("out")));

        assert!(!has_flag(&args, "-hls_playlist"));
        assert!(has_flag_with_value(&args, "-window_size", "0"));
    }

    #[test]
    fn test_command_maps_each_language_track() {
        let spec = spec_for(JobCreateRequest {
            audio_config: Some(AudioConfigRequest {
                audio_tracks: 3,
                audio_languages: vec!["en".into(), "fr".into(), "de".into()],
                audio_default_language: "FR".into(),
            }),
            ..Default::default()
        });
        let args = get_command_args(&build_encoder_command("ffmpeg", &spec, Path::new("out")));

        for (i, lang) in ["en", "fr", "de"].iter().enumerate() {
            assert!(has_flag_with_value(&args, "-map", &format!("[a{}]", i)));
            assert!(has_flag_with_value(
                &args,
                &format!("-metadata:s:a:{}", i),
                &format!("language={}", lang)
            ));
        }
        assert!(has_flag_with_value(&args, "-disposition:a:1", "default"));
        assert!(has_flag_with_value(&args, "-disposition:a:0", "0"));

        let filter = flag_value(&args, "-filter_complex").unwrap();
        assert!(filter.ends_with("asplit=3[a0][a1][a2]"));
    }

    #[test]
    fn test_command_codec_specific_flags() {
        let spec = spec_for(JobCreateRequest {
            video: Some(VideoTrackRequest {
                codec: "vp9".into(),
                framerate: "25".into(),
                ..Default::default()
            }),
            segment_length: Some(2),
            ..Default::default()
        });
        let args = get_command_args(&build_encoder_command("ffmpeg", &spec, Path::new("out")));

        assert!(has_flag_with_value(&args, "-c:v", "libvpx-vp9"));
        assert!(has_flag_with_value(&args, "-sc_threshold", "0"));
        assert!(!has_flag(&args, "-x264-params"));
        assert!(has_flag_with_value(&args, "-g", "50"));
    }

    #[test]
    fn test_command_gop_does_not_overflow() {
        let mut spec = default_spec("Long segments");
        spec.video.framerate = u32::MAX;
        spec.segment_length = u32::MAX;
        let args = get_command_args(&build_encoder_command("ffmpeg", &spec, Path::new("out")));

        let expected = (u64::from(u32::MAX) * u64::from(u32::MAX)).to_string();
        assert!(has_flag_with_value(&args, "-g", &expected));
        assert!(has_flag_with_value(&args, "-keyint_min", &expected));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_overlay_is_bounded_and_safe(description in ".{0,120}") {
            let text = overlay_text(&description);
            prop_assert!(!text.is_empty());
            prop_assert!(text.chars().count() <= MAX_OVERLAY_CHARS);
            prop_assert!(text
                .chars()
                .all(|c| c.is_alphanumeric() || c == ' ' || OVERLAY_PUNCTUATION.contains(&c)));
        }

        #[test]
        fn prop_overlay_keeps_plain_prefix(description in "[a-zA-Z0-9]{1,120}") {
            let expected: String = description.chars().take(MAX_OVERLAY_CHARS).collect();
            prop_assert_eq!(overlay_text(&description), expected);
        }
    }
}
