//! Job request validation.
//!
//! Turns an untrusted [`JobCreateRequest`] into an immutable [`JobSpec`],
//! filling in defaults and collecting every rule violation rather than
//! stopping at the first one.

use crate::jobs::OutputFormat;
use livesynth_config::{EncoderConfig, LimitsConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Video codecs accepted in requests.
pub const VALID_VIDEO_CODECS: &[&str] = &["h264", "h265", "vp9", "av1"];

/// Audio codecs accepted in requests.
pub const VALID_AUDIO_CODECS: &[&str] = &["aac", "opus", "mp3"];

const DEFAULT_VIDEO_BITRATE: &str = "1M";
const DEFAULT_RESOLUTION: &str = "1280x720";
const DEFAULT_FRAMERATE: &str = "30";
const DEFAULT_VIDEO_CODEC: &str = "h264";
const DEFAULT_AUDIO_CODEC: &str = "aac";
const DEFAULT_AUDIO_BITRATE: &str = "128k";
const DEFAULT_SAMPLE_RATE: &str = "44100";
const DEFAULT_CHANNELS: &str = "2";

const MIN_SAMPLE_RATE: u32 = 8000;
const MAX_SAMPLE_RATE: u32 = 192_000;
const MAX_AUDIO_CHANNELS: u32 = 8;

/// All rule violations found in a request.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{}", .errors.join("; "))]
pub struct ValidationError {
    pub errors: Vec<String>,
}

/// Raw job creation request as received over HTTP.
///
/// Empty strings mean "use the default", matching the wire format clients
/// already send.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobCreateRequest {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub video: Option<VideoTrackRequest>,
    #[serde(default)]
    pub audio: Option<AudioTrackRequest>,
    #[serde(default)]
    pub audio_config: Option<AudioConfigRequest>,
    #[serde(default)]
    pub output_format: Vec<OutputFormat>,
    /// Segment length in seconds; absent or 0 selects the default.
    #[serde(default)]
    pub segment_length: Option<i64>,
    /// Segments kept in the playlist; absent selects the default, 0 keeps all.
    #[serde(default)]
    pub window_size: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VideoTrackRequest {
    #[serde(default)]
    pub bitrate: String,
    #[serde(default)]
    pub resolution: String,
    #[serde(default)]
    pub framerate: String,
    #[serde(default)]
    pub codec: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AudioTrackRequest {
    #[serde(default)]
    pub codec: String,
    #[serde(default)]
    pub bitrate: String,
    #[serde(default)]
    pub sample_rate: String,
    #[serde(default)]
    pub channels: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AudioConfigRequest {
    #[serde(default)]
    pub audio_tracks: i64,
    #[serde(default)]
    pub audio_languages: Vec<String>,
    #[serde(default)]
    pub audio_default_language: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    H265,
    Vp9,
    Av1,
}

impl VideoCodec {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "h264" => Some(Self::H264),
            "h265" => Some(Self::H265),
            "vp9" => Some(Self::Vp9),
            "av1" => Some(Self::Av1),
            _ => None,
        }
    }

    /// ffmpeg encoder implementing this codec.
    pub fn encoder(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "libx264",
            VideoCodec::H265 => "libx265",
            VideoCodec::Vp9 => "libvpx-vp9",
            VideoCodec::Av1 => "libsvtav1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Aac,
    Opus,
    Mp3,
}

impl AudioCodec {
    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "aac" => Some(Self::Aac),
            "opus" => Some(Self::Opus),
            "mp3" => Some(Self::Mp3),
            _ => None,
        }
    }

    /// ffmpeg encoder implementing this codec.
    pub fn encoder(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "aac",
            AudioCodec::Opus => "libopus",
            AudioCodec::Mp3 => "libmp3lame",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSpec {
    pub codec: VideoCodec,
    pub bitrate_kbps: u32,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSpec {
    pub codec: AudioCodec,
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
    pub channels: u32,
}

/// Multi-language audio layout: one output audio track per language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioLanguages {
    pub languages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_language: Option<String>,
}

/// Validated, immutable encode configuration of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub description: String,
    pub video: VideoSpec,
    pub audio: AudioSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_languages: Option<AudioLanguages>,
    pub output_formats: Vec<OutputFormat>,
    /// Segment duration in seconds (> 0).
    pub segment_length: u32,
    /// Segments kept in the playlist; 0 keeps every segment.
    pub window_size: u32,
}

impl JobSpec {
    /// Number of audio output tracks the encoder produces.
    pub fn audio_track_count(&self) -> usize {
        self.audio_languages
            .as_ref()
            .map(|a| a.languages.len())
            .unwrap_or(1)
    }

    pub fn has_format(&self, format: OutputFormat) -> bool {
        self.output_formats.contains(&format)
    }
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}

/// Validate a request and produce its [`JobSpec`].
pub fn validate(
    request: &JobCreateRequest,
    limits: &LimitsConfig,
    defaults: &EncoderConfig,
) -> Result<JobSpec, ValidationError> {
    let mut errors = Vec::new();

    let video_req = request.video.clone().unwrap_or_default();
    let audio_req = request.audio.clone().unwrap_or_default();

    let video = validate_video(&video_req, limits, &mut errors);
    let audio = validate_audio(&audio_req, limits, &mut errors);
    let audio_languages = request
        .audio_config
        .as_ref()
        .and_then(|cfg| validate_audio_config(cfg, limits, &mut errors));

    let segment_length = match request.segment_length {
        None | Some(0) => defaults.default_segment_length,
        Some(n) if n < 0 => {
            errors.push("segment_length must be greater than 0".to_string());
            0
        }
        Some(n) if n > i64::from(limits.max_segment_length_secs) => {
            errors.push(format!(
                "segment_length must be at most {} seconds",
                limits.max_segment_length_secs
            ));
            0
        }
        Some(n) => u32::try_from(n).unwrap_or_else(|_| {
            errors.push("segment_length is too large".to_string());
            0
        }),
    };

    let window_size = match request.window_size {
        None => defaults.default_window_size,
        Some(n) if n < 0 => {
            errors.push("window_size must not be negative".to_string());
            0
        }
        Some(n) => u32::try_from(n).unwrap_or_else(|_| {
            errors.push("window_size is too large".to_string());
            0
        }),
    };

    let mut output_formats = Vec::new();
    for format in &request.output_format {
        if !output_formats.contains(format) {
            output_formats.push(*format);
        }
    }
    if output_formats.is_empty() {
        output_formats = vec![OutputFormat::Dash, OutputFormat::Hls];
    }

    match (video, audio) {
        (Some(video), Some(audio)) if errors.is_empty() => Ok(JobSpec {
            description: request.description.clone(),
            video,
            audio,
            audio_languages,
            output_formats,
            segment_length,
            window_size,
        }),
        _ => Err(ValidationError { errors }),
    }
}

fn validate_video(
    req: &VideoTrackRequest,
    limits: &LimitsConfig,
    errors: &mut Vec<String>,
) -> Option<VideoSpec> {
    let start = errors.len();
    let max_mbps = limits.max_video_bitrate_mbps;

    let bitrate = or_default(&req.bitrate, DEFAULT_VIDEO_BITRATE);
    let bitrate_kbps = parse_video_bitrate(bitrate, max_mbps).map_err(|e| errors.push(e)).ok();

    let resolution = or_default(&req.resolution, DEFAULT_RESOLUTION);
    let dimensions = match resolution.split_once('x') {
        None => {
            errors.push("video resolution must be in the format WxH (e.g., 1280x720)".to_string());
            None
        }
        Some((w, h)) => match (w.parse::<i64>(), h.parse::<i64>()) {
            (Ok(width), Ok(height)) => {
                if width <= 0 || height <= 0 {
                    errors.push("video resolution must be greater than 0".to_string());
                    None
                } else if width > i64::from(limits.max_video_width)
                    || height > i64::from(limits.max_video_height)
                {
                    errors.push(format!(
                        "video resolution must not exceed {}x{}",
                        limits.max_video_width, limits.max_video_height
                    ));
                    None
                } else {
                    Some((width as u32, height as u32))
                }
            }
            _ => {
                errors.push("video resolution must be valid integers".to_string());
                None
            }
        },
    };

    let framerate = match or_default(&req.framerate, DEFAULT_FRAMERATE).parse::<i64>() {
        Ok(fps) if fps >= 1 && fps <= i64::from(limits.max_video_fps) => Some(fps as u32),
        Ok(_) => {
            errors.push(format!(
                "video framerate must be between 1 and {}",
                limits.max_video_fps
            ));
            None
        }
        Err(_) => {
            errors.push("video framerate must be a valid integer".to_string());
            None
        }
    };

    let codec = VideoCodec::from_name(or_default(&req.codec, DEFAULT_VIDEO_CODEC));
    if codec.is_none() {
        errors.push(format!(
            "video codec must be one of: {}",
            VALID_VIDEO_CODECS.join(", ")
        ));
    }

    if errors.len() > start {
        return None;
    }
    let (width, height) = dimensions?;
    Some(VideoSpec {
        codec: codec?,
        bitrate_kbps: bitrate_kbps?,
        width,
        height,
        framerate: framerate?,
    })
}

/// Parse `<number>k` or `<number>M` into kbps within `[10k, max_mbps]`.
fn parse_video_bitrate(bitrate: &str, max_mbps: u32) -> Result<u32, String> {
    if bitrate.len() < 2 {
        return Err("video bitrate must be at least 2 characters long".to_string());
    }
    let (number, kbps_per_unit) = if let Some(n) = bitrate.strip_suffix('k') {
        (n, 1.0)
    } else if let Some(n) = bitrate.strip_suffix('M') {
        (n, 1000.0)
    } else {
        return Err("video bitrate must end with k or M".to_string());
    };
    let value: f64 = number
        .parse()
        .map_err(|_| "video bitrate must be a valid number".to_string())?;
    let kbps = value * kbps_per_unit;
    let max_kbps = f64::from(max_mbps) * 1000.0;
    if !kbps.is_finite() || kbps < 10.0 || kbps > max_kbps {
        return Err(format!(
            "video bitrate must be between 10k and {}k (0.01M and {}M)",
            max_mbps * 1000,
            max_mbps
        ));
    }
    Ok(kbps.round() as u32)
}

fn validate_audio(
    req: &AudioTrackRequest,
    limits: &LimitsConfig,
    errors: &mut Vec<String>,
) -> Option<AudioSpec> {
    let start = errors.len();

    let codec = AudioCodec::from_name(or_default(&req.codec, DEFAULT_AUDIO_CODEC));
    if codec.is_none() {
        errors.push(format!(
            "audio codec must be one of: {}",
            VALID_AUDIO_CODECS.join(", ")
        ));
    }

    let bitrate = or_default(&req.bitrate, DEFAULT_AUDIO_BITRATE);
    let bitrate_kbps = match bitrate.strip_suffix('k') {
        None => {
            errors.push("audio bitrate must end with k".to_string());
            None
        }
        Some(number) => match number.parse::<u32>() {
            Ok(kbps) if kbps >= 32 && kbps <= limits.max_audio_bitrate_kbps => Some(kbps),
            Ok(_) => {
                errors.push(format!(
                    "audio bitrate must be between 32k and {}k",
                    limits.max_audio_bitrate_kbps
                ));
                None
            }
            Err(_) => {
                errors.push("audio bitrate must be a valid number".to_string());
                None
            }
        },
    };

    let sample_rate = match or_default(&req.sample_rate, DEFAULT_SAMPLE_RATE).parse::<i64>() {
        Ok(rate) if rate >= i64::from(MIN_SAMPLE_RATE) && rate <= i64::from(MAX_SAMPLE_RATE) => {
            Some(rate as u32)
        }
        Ok(_) => {
            errors.push(format!(
                "audio sample rate must be between {} and {} Hz",
                MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
            ));
            None
        }
        Err(_) => {
            errors.push("audio sample rate must be a valid integer".to_string());
            None
        }
    };

    let channels = match or_default(&req.channels, DEFAULT_CHANNELS).parse::<i64>() {
        Ok(n) if n >= 1 && n <= i64::from(MAX_AUDIO_CHANNELS) => Some(n as u32),
        Ok(_) => {
            errors.push(format!(
                "audio channels must be between 1 and {}",
                MAX_AUDIO_CHANNELS
            ));
            None
        }
        Err(_) => {
            errors.push("audio channels must be a valid integer".to_string());
            None
        }
    };

    if errors.len() > start {
        return None;
    }
    Some(AudioSpec {
        codec: codec?,
        bitrate_kbps: bitrate_kbps?,
        sample_rate: sample_rate?,
        channels: channels?,
    })
}

fn validate_audio_config(
    req: &AudioConfigRequest,
    limits: &LimitsConfig,
    errors: &mut Vec<String>,
) -> Option<AudioLanguages> {
    let start = errors.len();
    let max_tracks = limits.max_audio_languages as i64;

    if req.audio_tracks <= 0 || req.audio_tracks > max_tracks {
        errors.push(format!(
            "audio_tracks must be between 1 and {}",
            max_tracks
        ));
    }
    if req.audio_languages.len() as i64 != req.audio_tracks {
        errors.push("audio_languages must match the number of audio_tracks".to_string());
    }
    if req.audio_languages.iter().any(|l| l.trim().is_empty()) {
        errors.push("audio_languages must not contain empty entries".to_string());
    }

    let default_language = if req.audio_default_language.is_empty() {
        None
    } else {
        match req
            .audio_languages
            .iter()
            .find(|lang| lang.eq_ignore_ascii_case(&req.audio_default_language))
        {
            Some(lang) => Some(lang.clone()),
            None => {
                errors.push(
                    "audio_default_language must be one of the audio_languages".to_string(),
                );
                None
            }
        }
    };

    if errors.len() > start {
        return None;
    }
    Some(AudioLanguages {
        languages: req.audio_languages.clone(),
        default_language,
    })
}
