use crate::engine::SwitchEngine;
use crate::error::SwitchError;
use crate::models::ManifestChangeReport;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

/// Collects changed paths and releases them as one batch once no new change
/// arrived for the whole window.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    pending: BTreeSet<PathBuf>,
    last_event: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: BTreeSet::new(),
            last_event: None,
        }
    }

    /// Adds a path and restarts the timer.
    pub fn record(&mut self, path: PathBuf, now: Instant) {
        self.pending.insert(path);
        self.last_event = Some(now);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.last_event.map(|last| last + self.window)
    }

    pub fn poll(&mut self, now: Instant) -> Option<Vec<PathBuf>> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        self.last_event = None;
        Some(std::mem::take(&mut self.pending).into_iter().collect())
    }
}

/// Watches manifest files for external edits.
///
/// Parent directories are watched rather than the files themselves so editors
/// that save through a temp file and rename are still seen.
pub struct ManifestWatcher {
    watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<notify::Event>>,
    watched_dirs: BTreeSet<PathBuf>,
    manifests: BTreeMap<PathBuf, PathBuf>,
    debouncer: Debouncer,
}

impl ManifestWatcher {
    pub fn new(paths: &[PathBuf], debounce: Duration) -> Result<Self, SwitchError> {
        let (tx, rx) = mpsc::channel();
        let watcher = notify::recommended_watcher(move |result| {
            let _ = tx.send(result);
        })?;

        let mut stream = Self {
            watcher,
            rx,
            watched_dirs: BTreeSet::new(),
            manifests: BTreeMap::new(),
            debouncer: Debouncer::new(debounce),
        };
        stream.watch(paths)?;
        Ok(stream)
    }

    pub fn watch(&mut self, paths: &[PathBuf]) -> Result<(), SwitchError> {
        for path in paths {
            let Some(parent) = path.parent() else {
                continue;
            };
            if !parent.exists() {
                continue;
            }
            self.manifests.insert(normalize(path), path.clone());
            if self.watched_dirs.insert(parent.to_path_buf()) {
                self.watcher.watch(parent, RecursiveMode::NonRecursive)?;
            }
        }
        tracing::debug!(manifests = self.manifests.len(), "watching manifests");
        Ok(())
    }

    /// Waits up to `idle` (or until the pending batch is due) and returns a
    /// batch of changed manifests once the debounce window has elapsed.
    /// Fails with `WatchClosed` once the watcher can no longer deliver events.
    pub fn next_batch(&mut self, idle: Duration) -> Result<Option<Vec<PathBuf>>, SwitchError> {
        let timeout = self
            .debouncer
            .deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(idle);

        match self.rx.recv_timeout(timeout) {
            Ok(Ok(event)) => {
                for path in &event.paths {
                    if let Some(original) = self.manifests.get(&normalize(path)) {
                        self.debouncer.record(original.clone(), Instant::now());
                    }
                }
            }
            Ok(Err(error)) => tracing::warn!(%error, "watch error"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                tracing::warn!("watch channel closed");
                return Err(SwitchError::WatchClosed);
            }
        }

        Ok(self.debouncer.poll(Instant::now()))
    }

    /// Runs one watch step against the engine.
    pub fn pump(
        &mut self,
        engine: &mut SwitchEngine,
        idle: Duration,
    ) -> Result<Option<ManifestChangeReport>, SwitchError> {
        let Some(batch) = self.next_batch(idle)? else {
            return Ok(None);
        };
        tracing::info!(count = batch.len(), "processing manifest changes");
        Ok(Some(engine.apply_manifest_changes(&batch)))
    }
}

fn normalize(path: &Path) -> PathBuf {
    let Some(name) = path.file_name() else {
        return path.to_path_buf();
    };
    match path.parent().map(std::fs::canonicalize) {
        Some(Ok(parent)) => parent.join(name),
        _ => path.to_path_buf(),
    }
}
