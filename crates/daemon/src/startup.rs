//! Startup checks for the live-stream daemon
//!
//! Preflight checks run before the HTTP server binds:
//! - Media root exists (created if missing) and is a directory
//! - The encoder runs `-version`

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Media root {path} is unusable: {reason}")]
    MediaRoot { path: String, reason: String },

    #[error("Encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Create the media root if missing and check that it is a directory.
pub fn ensure_media_root(root: &Path) -> Result<(), StartupError> {
    if root.exists() && !root.is_dir() {
        return Err(StartupError::MediaRoot {
            path: root.display().to_string(),
            reason: "not a directory".to_string(),
        });
    }
    std::fs::create_dir_all(root).map_err(|e| StartupError::MediaRoot {
        path: root.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(())
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 7.1 ..."
/// - N-prefixed: "ffmpeg version n7.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let major_str = version_part
        .trim_start_matches('n')
        .split(|c| c == '.' || c == '-')
        .next()?;

    major_str.parse().ok()
}

/// Check that the encoder runs `-version`
///
/// Returns the parsed major version when the output looks like FFmpeg's.
pub fn check_encoder_available(program: &str) -> Result<Option<u32>, StartupError> {
    let output = Command::new(program)
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::EncoderUnavailable(format!(
                "{} -version failed; is it installed and in PATH? Error: {}",
                program, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::EncoderUnavailable(format!(
            "{} -version exited with {}",
            program, output.status
        )));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let major = parse_ffmpeg_version(&version_output);
    match major {
        Some(major) => info!(program, major, "Encoder available"),
        None => warn!(
            program,
            first_line = version_output.lines().next().unwrap_or("(empty)"),
            "Encoder available, but version not recognised"
        ),
    }
    Ok(major)
}

/// Run all startup checks in order
///
/// 1. Media root
/// 2. Encoder availability
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    ensure_media_root(&cfg.media.root)?;
    check_encoder_available(&cfg.encoder.program)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_version_parsing_standard(
            major in 1u32..20,
            minor in 0u32..10,
            patch in 0u32..10,
        ) {
            let version_output = format!(
                "ffmpeg version {}.{}.{} Copyright (c) 2000-2024 the FFmpeg developers",
                major, minor, patch
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }

        #[test]
        fn prop_ffmpeg_version_parsing_n_prefixed(
            major in 1u32..20,
            minor in 0u32..10,
            git_hash in "[a-f0-9]{7}",
        ) {
            let version_output = format!(
                "ffmpeg version n{}.{}-123-g{} Copyright (c) 2000-2024\nbuilt with gcc 12.2.0",
                major, minor, git_hash
            );
            prop_assert_eq!(parse_ffmpeg_version(&version_output), Some(major));
        }
    }

    #[test]
    fn test_parse_ffmpeg_version_invalid() {
        assert_eq!(parse_ffmpeg_version("not ffmpeg output"), None);
        assert_eq!(parse_ffmpeg_version("ffmpeg version"), None);
        assert_eq!(parse_ffmpeg_version(""), None);
    }

    #[test]
    fn test_ensure_media_root_creates_missing() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("media").join("live");

        ensure_media_root(&root).unwrap();
        assert!(root.is_dir());

        // existing directory is fine
        ensure_media_root(&root).unwrap();
    }

    #[test]
    fn test_ensure_media_root_rejects_file() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("media");
        std::fs::write(&root, b"x").unwrap();

        let err = ensure_media_root(&root).unwrap_err();
        assert!(matches!(err, StartupError::MediaRoot { .. }));
    }

    #[test]
    fn test_missing_encoder_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let program = tmp.path().join("no-such-encoder");

        let err = check_encoder_available(&program.to_string_lossy()).unwrap_err();
        assert!(matches!(err, StartupError::EncoderUnavailable(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_encoder_version_is_parsed() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let program = tmp.path().join("ffmpeg");
        std::fs::write(
            &program,
            "#!/bin/sh\necho 'ffmpeg version n7.1-12-gabcdef0 Copyright (c) 2000-2024'\n",
        )
        .unwrap();
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();

        let major = check_encoder_available(&program.to_string_lossy()).unwrap();
        assert_eq!(major, Some(7));
    }
}
