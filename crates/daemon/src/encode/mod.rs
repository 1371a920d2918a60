//! Encoder invocation for livesynth jobs

pub mod ffmpeg;

pub use ffmpeg::{build_encoder_command, overlay_text, FALLBACK_OVERLAY_TEXT, MAX_OVERLAY_CHARS};
