//! Job model for the live-stream job registry.
//!
//! A `Job` is the client-visible record of one synthetic live-stream: its
//! lifecycle status, timestamps, the validated encode configuration and the
//! playback URLs exposed once segments appear on disk.

use crate::validate::JobSpec;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Status of a job.
///
/// `Created` → `Running` → `Completed` | `Failed`; `Created` → `Failed` on
/// launch failure. Terminal statuses only leave the registry by deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job exists but its encoder has not been started.
    Created,
    /// Encoder process is running.
    Running,
    /// Encoder was stopped (or exited cleanly).
    Completed,
    /// Launch failed or the encoder died on its own.
    Failed,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Created
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Created => write!(f, "created"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Packaging format written by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Hls,
    Dash,
}

impl OutputFormat {
    /// File name of the manifest the encoder writes for this format.
    pub fn manifest_name(&self) -> &'static str {
        match self {
            OutputFormat::Dash => "manifest.mpd",
            OutputFormat::Hls => "master.m3u8",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Hls => write!(f, "hls"),
            OutputFormat::Dash => write!(f, "dash"),
        }
    }
}

/// Playback URL for one output format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackUrl {
    pub format: OutputFormat,
    pub url: String,
}

/// One synthetic live-stream job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Unique job identifier (UUID), also the output directory name.
    pub id: String,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Unix timestamp (milliseconds) when the job was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) when the encoder was started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_started_at: Option<i64>,
    /// Unix timestamp (milliseconds) when the job reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    /// Unix timestamp (milliseconds) of the most recent segment file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_segment_at: Option<i64>,
    /// One URL per output format, filled in once segments appear.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub playback_urls: Vec<PlaybackUrl>,
    /// Validated encode configuration.
    pub config: JobSpec,
    /// Why the job failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    /// Creates a job in `Created` status with a fresh UUID.
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Created,
            created_at: current_timestamp_ms(),
            streaming_started_at: None,
            completed_at: None,
            last_segment_at: None,
            playback_urls: Vec::new(),
            config: spec,
            error: None,
        }
    }

    /// Transition to `Running`, stamping the streaming start time.
    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.streaming_started_at = Some(current_timestamp_ms());
    }

    /// Transition to `Completed`, stamping the completion time.
    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(current_timestamp_ms());
    }

    /// Transition to `Failed` with a reason.
    pub fn fail(&mut self, reason: &str) {
        self.status = JobStatus::Failed;
        self.completed_at = Some(current_timestamp_ms());
        self.error = Some(reason.to_string());
    }

    /// Check if the job is in a terminal state (completed or failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }

    /// Populate playback URLs for every configured output format.
    ///
    /// `base_url` is prepended verbatim when set; otherwise URLs are
    /// path-only (`/media/<id>/<manifest>`).
    pub fn publish_playback_urls(&mut self, base_url: Option<&str>) {
        let prefix = base_url.unwrap_or("").trim_end_matches('/');
        self.playback_urls = self
            .config
            .output_formats
            .iter()
            .map(|format| PlaybackUrl {
                format: *format,
                url: format!("{}/media/{}/{}", prefix, self.id, format.manifest_name()),
            })
            .collect();
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
