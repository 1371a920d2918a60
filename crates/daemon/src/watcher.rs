//! Segment watcher
//!
//! Watches a job's output directory and records when the encoder produces
//! a new media segment. The timestamp is the job's liveness signal.

use crate::jobs::current_timestamp_ms;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// File suffixes that count as finished media segments.
pub const SEGMENT_SUFFIXES: &[&str] = &[".m4s", ".ts"];

/// Error setting up a directory watch
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Last time a segment appeared, shared between the watcher and its owner.
#[derive(Debug, Default)]
pub struct Liveness {
    last_segment_ms: AtomicI64,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unix milliseconds of the newest segment, or None before the first one.
    pub fn last_segment_at(&self) -> Option<i64> {
        match self.last_segment_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn record(&self, at_ms: i64) {
        self.last_segment_ms.fetch_max(at_ms, Ordering::AcqRel);
    }
}

/// Whether a path names a finished media segment.
pub fn is_segment_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| SEGMENT_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)))
        .unwrap_or(false)
}

/// Segment paths carried by an event that announces a new file.
///
/// The encoder writes `*.tmp` files and renames them into place, so the
/// rename target counts as a creation.
fn new_segments(event: &Event) -> impl Iterator<Item = &PathBuf> {
    let announces_file = matches!(
        event.kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Name(RenameMode::To))
            | EventKind::Modify(ModifyKind::Name(RenameMode::Both))
    );
    event
        .paths
        .iter()
        .filter(move |path| announces_file && is_segment_file(path))
}

/// A running directory watch
pub struct SegmentWatcher {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SegmentWatcher {
    /// Start watching `dir`.
    ///
    /// Every new segment updates `liveness` and is passed to `on_segment`
    /// with its timestamp.
    pub fn start<F>(dir: &Path, liveness: Arc<Liveness>, on_segment: F) -> Result<Self, WatchError>
    where
        F: Fn(i64) + Send + 'static,
    {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| {
                let _ = event_tx.send(res);
            })
            .map_err(|source| WatchError::Watch {
                path: dir.to_path_buf(),
                source,
            })?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Watch {
                path: dir.to_path_buf(),
                source,
            })?;

        info!(directory = %dir.display(), "Monitoring directory");

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let dir = dir.to_path_buf();
        let task = tokio::spawn(async move {
            // The watch lives exactly as long as this task.
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    event = event_rx.recv() => match event {
                        Some(Ok(event)) => {
                            for path in new_segments(&event) {
                                let now = current_timestamp_ms();
                                debug!(file = %path.display(), "New media segment");
                                liveness.record(now);
                                on_segment(now);
                            }
                        }
                        Some(Err(e)) => warn!(error = %e, "Watcher error"),
                        None => break,
                    },
                }
            }
            info!(directory = %dir.display(), "Stopped directory monitoring");
        });

        Ok(Self {
            stop_tx: Some(stop_tx),
            task: Some(task),
        })
    }

    /// Signal the watcher to stop and wait for it to release the watch.
    /// Calling it again is a no-op.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Watcher task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl Drop for SegmentWatcher {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
        for _ in 0..100 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cond()
    }

    #[test]
    fn test_is_segment_file() {
        assert!(is_segment_file(Path::new("/m/job/chunk-stream0-00001.m4s")));
        assert!(is_segment_file(Path::new("media_3.ts")));
        assert!(!is_segment_file(Path::new("chunk-stream0-00001.m4s.tmp")));
        assert!(!is_segment_file(Path::new("manifest.mpd")));
        assert!(!is_segment_file(Path::new("master.m3u8")));
        assert!(!is_segment_file(Path::new("init-stream0.m4s.part")));
    }

    #[test]
    fn test_liveness_is_monotonic() {
        let liveness = Liveness::new();
        assert_eq!(liveness.last_segment_at(), None);
        liveness.record(2_000);
        liveness.record(1_000);
        assert_eq!(liveness.last_segment_at(), Some(2_000));
    }

    #[tokio::test]
    async fn test_segment_creation_updates_liveness() {
        let dir = TempDir::new().unwrap();
        let liveness = Arc::new(Liveness::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();

        let mut watcher = SegmentWatcher::start(dir.path(), liveness.clone(), move |_| {
            seen_cb.fetch_add(1, Ordering::SeqCst);
        })
        .expect("watch should start");

        // partial files are ignored
        std::fs::write(dir.path().join("chunk-stream0-00001.m4s.tmp"), b"x").unwrap();
        std::fs::write(dir.path().join("manifest.mpd"), b"x").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(liveness.last_segment_at(), None);

        // rename into place counts
        std::fs::rename(
            dir.path().join("chunk-stream0-00001.m4s.tmp"),
            dir.path().join("chunk-stream0-00001.m4s"),
        )
        .unwrap();
        assert!(wait_until(|| liveness.last_segment_at().is_some()).await);

        std::fs::write(dir.path().join("segment_2.ts"), b"x").unwrap();
        assert!(wait_until(|| seen.load(Ordering::SeqCst) >= 2).await);

        watcher.stop().await;
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_releases_watch() {
        let dir = TempDir::new().unwrap();
        let liveness = Arc::new(Liveness::new());
        let mut watcher = SegmentWatcher::start(dir.path(), liveness.clone(), |_| {}).unwrap();

        watcher.stop().await;
        watcher.stop().await;

        std::fs::write(dir.path().join("late.m4s"), b"x").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(liveness.last_segment_at(), None);
    }

    #[tokio::test]
    async fn test_missing_directory_fails_setup() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("does-not-exist");
        let result = SegmentWatcher::start(&missing, Arc::new(Liveness::new()), |_| {});
        assert!(matches!(result, Err(WatchError::Watch { .. })));
    }
}
