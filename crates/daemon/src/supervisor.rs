//! Encoder process supervision
//!
//! One [`ProcessHandle`] owns one running encoder: the OS process, the task
//! waiting for it to exit, the task draining its stderr and the segment
//! watcher over its output directory.

use crate::encode::build_encoder_command;
use crate::validate::JobSpec;
use crate::watcher::{Liveness, SegmentWatcher};
use livesynth_config::EncoderConfig;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Error type for starting an encoder
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The job output directory could not be created
    #[error("Failed to create output directory {}: {source}", .path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The encoder process could not be started
    #[error("Failed to start encoder '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Error type for stopping an encoder
#[derive(Debug, Error)]
pub enum TerminationError {
    /// A signal could not be delivered for a reason other than the process being gone
    #[error("Failed to send {signal} to process {pid}: {errno}")]
    Signal {
        pid: u32,
        signal: Signal,
        #[source]
        errno: Errno,
    },
}

/// Notifications from supervisor tasks back to the job registry
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    /// A new segment file appeared in the job's output directory
    SegmentObserved { job_id: String, at: i64 },
    /// The encoder exited without `terminate` having been called
    ProcessExited {
        job_id: String,
        success: bool,
        detail: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<SupervisorEvent>;

/// Delivers a signal to a process.
pub(crate) type SignalFn = fn(Pid, Signal) -> nix::Result<()>;

pub(crate) fn send_signal(pid: Pid, signal: Signal) -> nix::Result<()> {
    kill(pid, signal)
}

struct Tasks {
    watcher: Option<SegmentWatcher>,
    waiter: JoinHandle<()>,
}

/// Supervisory record binding a job to its running encoder
pub struct ProcessHandle {
    job_id: String,
    pid: u32,
    output_dir: PathBuf,
    liveness: Arc<Liveness>,
    watcher_error: Option<String>,
    stopping: Arc<AtomicBool>,
    exited: watch::Receiver<bool>,
    interrupt_attempts: u32,
    interrupt_interval: Duration,
    exit_wait: Duration,
    signal_fn: std::sync::Mutex<SignalFn>,
    tasks: Mutex<Option<Tasks>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("job_id", &self.job_id)
            .field("pid", &self.pid)
            .field("output_dir", &self.output_dir)
            .field("last_segment_at", &self.liveness.last_segment_at())
            .field("exited", &self.has_exited())
            .finish()
    }
}

/// Start the encoder for a job
///
/// Creates `output_dir`, starts the segment watcher over it, then spawns
/// the encoder. Returns as soon as the process has been started; waiting
/// for it happens on a background task.
///
/// # Errors
/// Returns `LaunchError` if the output directory cannot be created or the
/// encoder cannot be spawned. A watcher that cannot be set up is logged
/// and reported through [`ProcessHandle::watcher_error`] instead.
pub async fn launch(
    job_id: &str,
    spec: &JobSpec,
    output_dir: PathBuf,
    settings: &EncoderConfig,
    events: EventSender,
) -> Result<ProcessHandle, LaunchError> {
    tokio::fs::create_dir_all(&output_dir)
        .await
        .map_err(|source| {
            error!(job_id, path = %output_dir.display(), error = %source, "Failed to create output directory");
            LaunchError::OutputDir {
                path: output_dir.clone(),
                source,
            }
        })?;

    let liveness = Arc::new(Liveness::new());
    let (mut watcher, watcher_error) = {
        let events = events.clone();
        let id = job_id.to_string();
        match SegmentWatcher::start(&output_dir, liveness.clone(), move |at| {
            let _ = events.send(SupervisorEvent::SegmentObserved {
                job_id: id.clone(),
                at,
            });
        }) {
            Ok(watcher) => (Some(watcher), None),
            Err(e) => {
                warn!(job_id, error = %e, "Failed to start directory monitoring");
                (None, Some(e.to_string()))
            }
        }
    };

    let mut cmd = Command::from(build_encoder_command(&settings.program, spec, &output_dir));
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            error!(job_id, program = %settings.program, error = %source, "Failed to start encoder");
            if let Some(w) = watcher.as_mut() {
                w.stop().await;
            }
            return Err(LaunchError::Spawn {
                program: settings.program.clone(),
                source,
            });
        }
    };

    let pid = child.id().unwrap_or(0);
    info!(job_id, pid, output_dir = %output_dir.display(), "Encoder started");

    if let Some(stderr) = child.stderr.take() {
        let id = job_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(job_id = %id, "encoder: {}", line);
            }
        });
    }

    let (exited_tx, exited_rx) = watch::channel(false);
    let stopping = Arc::new(AtomicBool::new(false));
    let waiter = {
        let stopping = stopping.clone();
        let id = job_id.to_string();
        tokio::spawn(async move {
            let result = child.wait().await;
            exited_tx.send_replace(true);
            let requested = stopping.load(Ordering::SeqCst);
            let (success, detail) = match result {
                Ok(status) => (status.success(), status.to_string()),
                Err(e) => (false, format!("failed to wait for encoder: {}", e)),
            };
            if requested {
                info!(job_id = %id, pid, status = %detail, "Encoder exited after stop request");
            } else {
                warn!(job_id = %id, pid, status = %detail, "Encoder exited on its own");
                let _ = events.send(SupervisorEvent::ProcessExited {
                    job_id: id,
                    success,
                    detail,
                });
            }
        })
    };

    Ok(ProcessHandle {
        job_id: job_id.to_string(),
        pid,
        output_dir,
        liveness,
        watcher_error,
        stopping,
        exited: exited_rx,
        interrupt_attempts: settings.interrupt_attempts,
        interrupt_interval: Duration::from_millis(settings.interrupt_interval_ms),
        exit_wait: Duration::from_millis(settings.exit_wait_ms),
        signal_fn: std::sync::Mutex::new(send_signal),
        tasks: Mutex::new(Some(Tasks { watcher, waiter })),
    })
}

impl ProcessHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// OS process id of the encoder (0 if it was never observed).
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Unix milliseconds of the newest segment, if any.
    pub fn last_segment_at(&self) -> Option<i64> {
        self.liveness.last_segment_at()
    }

    /// Why liveness tracking is unavailable, if it is.
    pub fn watcher_error(&self) -> Option<&str> {
        self.watcher_error.as_deref()
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Whether `terminate` has completed for this handle.
    pub async fn is_terminated(&self) -> bool {
        self.tasks.lock().await.is_none()
    }

    /// Stop the encoder and its watcher
    ///
    /// Sends SIGINT up to `interrupt_attempts` times, pausing
    /// `interrupt_interval` after each (the encoder writing DASH and HLS at
    /// once does not always honour the first one), then SIGKILL. A process
    /// that is already gone is not an error. Afterwards the watcher is
    /// stopped and the exit waiter joined.
    ///
    /// Calling it again after a successful call is a no-op. On failure the
    /// handle stays intact so the call can be retried.
    pub async fn terminate(&self) -> Result<(), TerminationError> {
        let mut guard = self.tasks.lock().await;
        let Some(tasks) = guard.as_mut() else {
            debug!(job_id = %self.job_id, "Encoder already stopped");
            return Ok(());
        };

        self.stopping.store(true, Ordering::SeqCst);
        info!(job_id = %self.job_id, pid = self.pid, "Stopping encoder");

        if let Err(e) = self.signal_until_exit().await {
            self.stopping.store(false, Ordering::SeqCst);
            error!(job_id = %self.job_id, error = %e, "Failed to stop encoder");
            return Err(e);
        }

        if let Some(watcher) = tasks.watcher.as_mut() {
            watcher.stop().await;
        }
        if tokio::time::timeout(self.exit_wait, &mut tasks.waiter)
            .await
            .is_err()
        {
            warn!(job_id = %self.job_id, pid = self.pid, "Encoder not reaped after kill");
        }

        *guard = None;
        Ok(())
    }

    /// Replace how signals reach the encoder.
    #[cfg(test)]
    pub(crate) fn set_signal_fn(&self, signal_fn: SignalFn) {
        *self.signal_fn.lock().unwrap_or_else(|e| e.into_inner()) = signal_fn;
    }

    fn signal(&self, pid: Pid, signal: Signal) -> nix::Result<()> {
        let signal_fn = *self.signal_fn.lock().unwrap_or_else(|e| e.into_inner());
        signal_fn(pid, signal)
    }

    async fn signal_until_exit(&self) -> Result<(), TerminationError> {
        if self.pid == 0 || self.has_exited() {
            return Ok(());
        }
        let pid = Pid::from_raw(self.pid as i32);
        let mut exited = self.exited.clone();

        for attempt in 1..=self.interrupt_attempts {
            if self.has_exited() {
                return Ok(());
            }
            info!(job_id = %self.job_id, pid = self.pid, attempt, "Sending SIGINT to encoder");
            match self.signal(pid, Signal::SIGINT) {
                Ok(()) => {}
                Err(Errno::ESRCH) => return Ok(()),
                Err(errno) => {
                    return Err(TerminationError::Signal {
                        pid: self.pid,
                        signal: Signal::SIGINT,
                        errno,
                    })
                }
            }
            let _ = tokio::time::timeout(self.interrupt_interval, exited.wait_for(|done| *done))
                .await;
        }

        if self.has_exited() {
            return Ok(());
        }
        match self.signal(pid, Signal::SIGKILL) {
            Ok(()) => {
                info!(job_id = %self.job_id, pid = self.pid, "Encoder killed");
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!(job_id = %self.job_id, pid = self.pid, "Encoder already terminated");
                Ok(())
            }
            Err(errno) => Err(TerminationError::Signal {
                pid: self.pid,
                signal: Signal::SIGKILL,
                errno,
            }),
        }
    }
}

#[cfg(all(test, unix))]
pub(crate) mod test_support {
    use livesynth_config::EncoderConfig;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Writes a `/bin/sh` stand-in encoder and returns settings that run it.
    ///
    /// `$last` holds the manifest path, so `$(dirname "$last")` is the
    /// job output directory.
    pub fn fake_encoder(dir: &Path, name: &str, body: &str) -> EncoderConfig {
        let path = dir.join(name);
        let script = format!(
            "#!/bin/sh\nfor last; do :; done\nout=$(dirname \"$last\")\n{}\n",
            body
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        EncoderConfig {
            program: path.to_string_lossy().into_owned(),
            interrupt_attempts: 3,
            interrupt_interval_ms: 100,
            exit_wait_ms: 2000,
            ..EncoderConfig::default()
        }
    }

    pub const SLEEPER: &str = "exec sleep 30";
    pub const SEGMENT_THEN_SLEEP: &str = "touch \"$out/chunk-stream0-00001.m4s\"\nexec sleep 30";
    pub const IGNORES_SIGINT: &str = "trap '' INT\nexec sleep 30";
}
