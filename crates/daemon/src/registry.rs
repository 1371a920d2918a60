//! Job registry
//!
//! The authoritative map from job id to job record and to the process
//! handle of its running encoder. Every read-then-write goes through one
//! registry-wide lock; encoder stops happen outside of it.

use crate::jobs::{Job, JobStatus};
use crate::supervisor::{self, EventSender, LaunchError, ProcessHandle, SupervisorEvent, TerminationError};
use crate::validate::JobSpec;
use livesynth_config::{Config, EncoderConfig};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Errors from registry operations
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job {0} not found")]
    NotFound(String),

    #[error("Job {id} cannot be started: {reason}")]
    InvalidState { id: String, reason: String },

    #[error("Running job limit of {limit} reached")]
    CapacityExceeded { limit: usize },

    #[error("Failed to start job {id}: {source}")]
    Launch {
        id: String,
        #[source]
        source: LaunchError,
    },

    #[error("Failed to stop job {id}: {source}")]
    Termination {
        id: String,
        #[source]
        source: TerminationError,
    },
}

impl JobError {
    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Termination { .. } | JobError::CapacityExceeded { .. }
        )
    }
}

/// Registry settings derived from the daemon config
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Directory holding one output directory per job.
    pub media_root: PathBuf,
    pub encoder: EncoderConfig,
    /// Maximum concurrently running jobs, 0 for no limit.
    pub max_running_jobs: usize,
    /// Prefix for playback URLs; path-only URLs when unset.
    pub public_base_url: Option<String>,
}

impl RegistrySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            media_root: config.media.root.clone(),
            encoder: config.encoder.clone(),
            max_running_jobs: config.limits.max_running_jobs,
            public_base_url: config.server.public_base_url.clone(),
        }
    }
}

#[derive(Default)]
struct State {
    jobs: HashMap<String, Job>,
    handles: HashMap<String, Arc<ProcessHandle>>,
    /// Jobs whose encoder is being launched.
    starting: HashSet<String>,
    /// Exits reported while the job was still in `starting`.
    early_exits: HashMap<String, (bool, String)>,
}

struct Inner {
    state: RwLock<State>,
    settings: RegistrySettings,
    events: EventSender,
}

/// Shared handle to the job registry
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<Inner>,
}

impl JobRegistry {
    /// Create an empty registry.
    ///
    /// Spawns the task applying supervisor events, so it must be called
    /// from within a tokio runtime.
    pub fn new(settings: RegistrySettings) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            state: RwLock::new(State::default()),
            settings,
            events,
        });
        tokio::spawn(pump_events(Arc::downgrade(&inner), rx));
        Self { inner }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    /// Output directory of a job.
    pub fn output_dir(&self, id: &str) -> PathBuf {
        self.inner.settings.media_root.join(id)
    }

    pub fn media_root(&self) -> &Path {
        &self.inner.settings.media_root
    }

    /// Register a new job in `created` status.
    pub async fn create(&self, spec: JobSpec) -> Job {
        let job = Job::new(spec);
        self.inner
            .state
            .write()
            .await
            .jobs
            .insert(job.id.clone(), job.clone());
        info!(job_id = %job.id, description = %job.config.description, "Job created");
        job
    }

    /// Snapshot of all jobs, oldest first.
    pub async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.inner.state.read().await.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        self.inner.state.read().await.jobs.get(id).cloned()
    }

    /// Launch the encoder for a `created` job
    ///
    /// The job is reserved under the lock before launching, so a concurrent
    /// second `start` is rejected instead of spawning another encoder.
    ///
    /// # Errors
    /// `NotFound`, `InvalidState` when the job is not `created` or already
    /// being started, `CapacityExceeded` when the running limit is reached,
    /// and `Launch` when the encoder could not be started (the job is then
    /// `failed`).
    pub async fn start(&self, id: &str) -> Result<Job, JobError> {
        let (spec, reservation) = self.reserve(id).await?;
        let result = supervisor::launch(
            id,
            &spec,
            self.output_dir(id),
            &self.inner.settings.encoder,
            self.inner.events.clone(),
        )
        .await;
        self.finish_start(reservation, result).await
    }

    /// Check that a job may start and mark it as starting.
    async fn reserve(&self, id: &str) -> Result<(JobSpec, StartReservation), JobError> {
        let mut guard = self.inner.state.write().await;
        let state = &mut *guard;
        let job = state
            .jobs
            .get(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        if state.starting.contains(id) {
            return Err(JobError::InvalidState {
                id: id.to_string(),
                reason: "a start is already in progress".to_string(),
            });
        }
        if job.status != JobStatus::Created {
            return Err(JobError::InvalidState {
                id: id.to_string(),
                reason: format!("job is {}", job.status),
            });
        }
        let limit = self.inner.settings.max_running_jobs;
        if limit > 0 && state.handles.len() + state.starting.len() >= limit {
            warn!(job_id = id, limit, "Running job limit reached");
            return Err(JobError::CapacityExceeded { limit });
        }
        let spec = job.config.clone();
        state.starting.insert(id.to_string());
        Ok((
            spec,
            StartReservation {
                inner: self.inner.clone(),
                id: id.to_string(),
                armed: true,
            },
        ))
    }

    /// Record the outcome of a launch against its reservation.
    async fn finish_start(
        &self,
        reservation: StartReservation,
        result: Result<ProcessHandle, LaunchError>,
    ) -> Result<Job, JobError> {
        let job_id = reservation.id.clone();
        let id = job_id.as_str();
        let mut guard = self.inner.state.write().await;
        let state = &mut *guard;
        let early_exit = reservation.release(state);

        let handle = match result {
            Ok(handle) => Arc::new(handle),
            Err(source) => {
                if let Some(job) = state.jobs.get_mut(id) {
                    job.fail(&source.to_string());
                }
                error!(job_id = id, error = %source, "Job failed to start");
                return Err(JobError::Launch {
                    id: id.to_string(),
                    source,
                });
            }
        };

        let Some(job) = state.jobs.get_mut(id) else {
            // deleted while launching; its directory was recreated by the launch
            drop(guard);
            if let Err(e) = handle.terminate().await {
                warn!(job_id = id, error = %e, "Failed to stop encoder of deleted job");
            }
            self.remove_output_dir(id).await;
            return Err(JobError::NotFound(id.to_string()));
        };

        job.mark_running();
        info!(job_id = id, pid = handle.pid(), "Job running");

        match early_exit {
            Some((success, detail)) => {
                finish_after_exit(job, success, &detail);
                let job = job.clone();
                drop(guard);
                let _ = handle.terminate().await;
                Ok(job)
            }
            None => {
                let job = job.clone();
                state.handles.insert(id.to_string(), handle);
                Ok(job)
            }
        }
    }

    /// Stop a job's encoder
    ///
    /// A job without an encoder is left alone. The lock is not held while
    /// the encoder is being stopped.
    ///
    /// # Errors
    /// `NotFound` for unknown ids. `Termination` when the encoder could not
    /// be signalled; the job then stays `running` and the stop may be
    /// retried.
    pub async fn stop(&self, id: &str) -> Result<(), JobError> {
        let handle = {
            let state = self.inner.state.read().await;
            if !state.jobs.contains_key(id) {
                return Err(JobError::NotFound(id.to_string()));
            }
            match state.handles.get(id) {
                Some(handle) => handle.clone(),
                None => {
                    debug!(job_id = id, "Stop requested for job without encoder");
                    return Ok(());
                }
            }
        };

        handle
            .terminate()
            .await
            .map_err(|source| JobError::Termination {
                id: id.to_string(),
                source,
            })?;

        let mut guard = self.inner.state.write().await;
        let state = &mut *guard;
        if state
            .handles
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, &handle))
        {
            state.handles.remove(id);
        }
        if let Some(job) = state.jobs.get_mut(id) {
            if job.status == JobStatus::Running {
                job.mark_completed();
                info!(job_id = id, "Job completed");
            }
        }
        Ok(())
    }

    /// Remove a job, its encoder and its output directory
    ///
    /// Stopping the encoder and removing the directory are best effort;
    /// failures are logged and do not block the removal. Returns the
    /// removed record, or None for an unknown id.
    pub async fn delete(&self, id: &str) -> Option<Job> {
        let handle = {
            let mut state = self.inner.state.write().await;
            if !state.jobs.contains_key(id) {
                return None;
            }
            state.handles.remove(id)
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.terminate().await {
                warn!(job_id = id, error = %e, "Failed to stop encoder of deleted job");
            }
        }

        self.remove_output_dir(id).await;

        let removed = self.inner.state.write().await.jobs.remove(id);
        if removed.is_some() {
            info!(job_id = id, "Job deleted");
        }
        removed
    }

    /// Stop every running job, concurrently.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self
            .inner
            .state
            .read()
            .await
            .handles
            .keys()
            .cloned()
            .collect();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "Stopping running jobs");

        let mut tasks = JoinSet::new();
        for id in ids {
            let registry = self.clone();
            tasks.spawn(async move {
                if let Err(e) = registry.stop(&id).await {
                    error!(job_id = %id, error = %e, "Failed to stop job");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Best-effort removal of a job's output directory.
    async fn remove_output_dir(&self, id: &str) {
        let dir = self.output_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(job_id = id, path = %dir.display(), "Removed output directory"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(job_id = id, path = %dir.display(), error = %e, "Failed to remove output directory")
            }
        }
    }

    pub async fn has_process_handle(&self, id: &str) -> bool {
        self.inner.state.read().await.handles.contains_key(id)
    }

    /// Encoder pid of a running job.
    pub async fn process_id(&self, id: &str) -> Option<u32> {
        self.inner
            .state
            .read()
            .await
            .handles
            .get(id)
            .map(|handle| handle.pid())
    }

    #[cfg(test)]
    pub(crate) async fn process_handle(&self, id: &str) -> Option<Arc<ProcessHandle>> {
        self.inner.state.read().await.handles.get(id).cloned()
    }

    pub async fn running_count(&self) -> usize {
        self.inner.state.read().await.handles.len()
    }
}

/// A job's entry in `starting`
///
/// Released explicitly once the launch outcome is recorded. If the start
/// is cancelled or panics first, dropping the reservation clears the entry
/// so the job can be started again.
struct StartReservation {
    inner: Arc<Inner>,
    id: String,
    armed: bool,
}

impl StartReservation {
    /// Clear the entry under an already held lock, returning any exit
    /// parked while the launch was in flight.
    fn release(mut self, state: &mut State) -> Option<(bool, String)> {
        self.armed = false;
        state.starting.remove(&self.id);
        state.early_exits.remove(&self.id)
    }
}

impl Drop for StartReservation {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = std::mem::take(&mut self.id);
        warn!(job_id = %id, "Start abandoned, releasing reservation");
        if let Ok(mut state) = self.inner.state.try_write() {
            state.starting.remove(&id);
            state.early_exits.remove(&id);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = self.inner.clone();
                runtime.spawn(async move {
                    let mut state = inner.state.write().await;
                    state.starting.remove(&id);
                    state.early_exits.remove(&id);
                });
            }
            Err(_) => error!(job_id = %id, "No runtime left to release start reservation"),
        }
    }
}

fn finish_after_exit(job: &mut Job, success: bool, detail: &str) {
    if success {
        job.mark_completed();
        info!(job_id = %job.id, "Encoder finished, job completed");
    } else {
        job.fail(&format!("encoder exited unexpectedly: {}", detail));
        warn!(job_id = %job.id, status = detail, "Encoder died, job failed");
    }
}

async fn pump_events(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<SupervisorEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        apply_event(&inner, event).await;
    }
}

async fn apply_event(inner: &Inner, event: SupervisorEvent) {
    match event {
        SupervisorEvent::SegmentObserved { job_id, at } => {
            let mut state = inner.state.write().await;
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return;
            };
            job.last_segment_at = Some(job.last_segment_at.map_or(at, |prev| prev.max(at)));
            if job.playback_urls.is_empty() {
                job.publish_playback_urls(inner.settings.public_base_url.as_deref());
                info!(job_id = %job_id, "First segment written, playback available");
            }
        }
        SupervisorEvent::ProcessExited {
            job_id,
            success,
            detail,
        } => {
            let mut guard = inner.state.write().await;
            let state = &mut *guard;
            if state.starting.contains(&job_id) {
                state.early_exits.insert(job_id, (success, detail));
                return;
            }
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return;
            };
            if job.status != JobStatus::Running {
                return;
            }
            finish_after_exit(job, success, &detail);
            let handle = state.handles.remove(&job_id);
            drop(guard);

            // releases the watcher and reaps the exit waiter
            if let Some(handle) = handle {
                tokio::spawn(async move {
                    let _ = handle.terminate().await;
                });
            }
        }
    }
}
