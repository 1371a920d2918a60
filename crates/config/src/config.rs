//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Values that parse but cannot be used
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read livesynth config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse livesynth config: {}", e),
            ConfigError::Invalid(reason) => write!(f, "Invalid livesynth config: {}", reason),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds in-flight requests get to drain after a shutdown signal
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Prefix for playback URLs (e.g. `https://live.example.com`); path-only when unset
    #[serde(default)]
    pub public_base_url: Option<String>,
}

fn default_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9090
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            port: default_port(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            public_base_url: None,
        }
    }
}

/// Media output configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaConfig {
    /// Root directory holding one output directory per job
    #[serde(default = "default_media_root")]
    pub root: PathBuf,
}

fn default_media_root() -> PathBuf {
    PathBuf::from("media")
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: default_media_root(),
        }
    }
}

/// External encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Encoder executable (looked up in PATH unless absolute)
    #[serde(default = "default_program")]
    pub program: String,
    /// SIGINT deliveries before the forceful kill
    #[serde(default = "default_interrupt_attempts")]
    pub interrupt_attempts: u32,
    /// Pause between SIGINT deliveries, in milliseconds
    #[serde(default = "default_interrupt_interval_ms")]
    pub interrupt_interval_ms: u64,
    /// How long to wait for the process to be reaped after SIGKILL, in milliseconds
    #[serde(default = "default_exit_wait_ms")]
    pub exit_wait_ms: u64,
    /// Segment length (seconds) used when a request does not set one
    #[serde(default = "default_segment_length")]
    pub default_segment_length: u32,
    /// Playlist window (segments) used when a request does not set one
    #[serde(default = "default_window_size")]
    pub default_window_size: u32,
}

fn default_program() -> String {
    "ffmpeg".to_string()
}

fn default_interrupt_attempts() -> u32 {
    3
}

fn default_interrupt_interval_ms() -> u64 {
    1000
}

fn default_exit_wait_ms() -> u64 {
    5000
}

fn default_segment_length() -> u32 {
    6
}

fn default_window_size() -> u32 {
    6
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            interrupt_attempts: default_interrupt_attempts(),
            interrupt_interval_ms: default_interrupt_interval_ms(),
            exit_wait_ms: default_exit_wait_ms(),
            default_segment_length: default_segment_length(),
            default_window_size: default_window_size(),
        }
    }
}

/// Upper bounds applied when validating job requests
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    /// Maximum number of jobs running at once (0 = unlimited)
    #[serde(default = "default_max_running_jobs")]
    pub max_running_jobs: usize,
    #[serde(default = "default_max_video_bitrate_mbps")]
    pub max_video_bitrate_mbps: u32,
    #[serde(default = "default_max_video_width")]
    pub max_video_width: u32,
    #[serde(default = "default_max_video_height")]
    pub max_video_height: u32,
    #[serde(default = "default_max_video_fps")]
    pub max_video_fps: u32,
    #[serde(default = "default_max_audio_bitrate_kbps")]
    pub max_audio_bitrate_kbps: u32,
    #[serde(default = "default_max_audio_languages")]
    pub max_audio_languages: usize,
    /// Longest accepted segment duration in seconds
    #[serde(default = "default_max_segment_length_secs")]
    pub max_segment_length_secs: u32,
}

fn default_max_running_jobs() -> usize {
    2
}

fn default_max_video_bitrate_mbps() -> u32 {
    50
}

fn default_max_video_width() -> u32 {
    3840
}

fn default_max_video_height() -> u32 {
    2160
}

fn default_max_video_fps() -> u32 {
    60
}

fn default_max_audio_bitrate_kbps() -> u32 {
    320
}

fn default_max_audio_languages() -> usize {
    8
}

fn default_max_segment_length_secs() -> u32 {
    60
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_running_jobs: default_max_running_jobs(),
            max_video_bitrate_mbps: default_max_video_bitrate_mbps(),
            max_video_width: default_max_video_width(),
            max_video_height: default_max_video_height(),
            max_video_fps: default_max_video_fps(),
            max_audio_bitrate_kbps: default_max_audio_bitrate_kbps(),
            max_audio_languages: default_max_audio_languages(),
            max_segment_length_secs: default_max_segment_length_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    /// Filter directive used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but would break job handling
    ///
    /// - `encoder.default_segment_length` must be in 1..=`limits.max_segment_length_secs`
    /// - `encoder.interrupt_attempts` must be at least 1
    pub fn validate(&self) -> Result<(), ConfigError> {
        let segment = self.encoder.default_segment_length;
        if segment == 0 {
            return Err(ConfigError::Invalid(
                "encoder.default_segment_length must be greater than 0".to_string(),
            ));
        }
        if segment > self.limits.max_segment_length_secs {
            return Err(ConfigError::Invalid(format!(
                "encoder.default_segment_length {} exceeds limits.max_segment_length_secs {}",
                segment, self.limits.max_segment_length_secs
            )));
        }
        if self.encoder.interrupt_attempts == 0 {
            return Err(ConfigError::Invalid(
                "encoder.interrupt_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - LIVESYNTH_ADDR -> server.addr
    /// - LIVESYNTH_PORT -> server.port
    /// - LIVESYNTH_MEDIA_ROOT -> media.root
    /// - LIVESYNTH_ENCODER -> encoder.program
    /// - LIVESYNTH_MAX_RUNNING_JOBS -> limits.max_running_jobs
    /// - LIVESYNTH_LOG_LEVEL -> log.level
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("LIVESYNTH_ADDR") {
            if !val.is_empty() {
                self.server.addr = val;
            }
        }

        if let Ok(val) = env::var("LIVESYNTH_PORT") {
            if let Ok(port) = val.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(val) = env::var("LIVESYNTH_MEDIA_ROOT") {
            if !val.is_empty() {
                self.media.root = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("LIVESYNTH_ENCODER") {
            if !val.is_empty() {
                self.encoder.program = val;
            }
        }

        if let Ok(val) = env::var("LIVESYNTH_MAX_RUNNING_JOBS") {
            if let Ok(max) = val.parse::<usize>() {
                self.limits.max_running_jobs = max;
            }
        }

        if let Ok(val) = env::var("LIVESYNTH_LOG_LEVEL") {
            if !val.is_empty() {
                self.log.level = val;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Built-in defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// `addr:port` string for binding the HTTP listener
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.addr, self.server.port)
    }
}
