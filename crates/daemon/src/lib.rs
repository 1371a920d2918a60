//! livesynth
//!
//! HTTP job server that runs synthetic live streams: each job drives one
//! external encoder producing segmented DASH/HLS output under the media root.

pub mod api;
pub mod daemon;
pub mod encode;
pub mod jobs;
pub mod registry;
pub mod startup;
pub mod supervisor;
pub mod validate;
pub mod watcher;

pub use livesynth_config as config;
pub use livesynth_config::Config;
pub use api::{create_router, ApiError, ApiState};
pub use daemon::{shutdown_signal, Daemon, DaemonError, ServerError};
pub use encode::{build_encoder_command, overlay_text};
pub use jobs::{current_timestamp_ms, Job, JobStatus, OutputFormat, PlaybackUrl};
pub use registry::{JobError, JobRegistry, RegistrySettings};
pub use startup::{check_encoder_available, ensure_media_root, parse_ffmpeg_version, run_startup_checks, StartupError};
pub use supervisor::{LaunchError, ProcessHandle, SupervisorEvent, TerminationError};
pub use validate::{validate, JobCreateRequest, JobSpec, ValidationError};
pub use watcher::{Liveness, SegmentWatcher, WatchError};
