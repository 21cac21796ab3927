use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, DebouncedEventKind, Debouncer};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::error::{BrowserError, Result};

/// Default debounce interval in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 150;

/// Default capacity of the change queue drained by the controller.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Default flood threshold (directories per debounce window).
pub const DEFAULT_FLOOD_THRESHOLD: usize = 100;

/// Tuning for the watch subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    pub debounce: Duration,
    pub queue_capacity: usize,
    pub flood_threshold: usize,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            flood_threshold: DEFAULT_FLOOD_THRESHOLD,
        }
    }
}

/// A debounced batch of changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Watched directories whose listing changed.
    Changed(Vec<PathBuf>),
    /// Too many changes in one window; refresh everything watched.
    Flood,
}

/// Watches a set of directories (non-recursively) and pushes debounced
/// change batches onto a bounded queue.
pub struct FsWatcher {
    /// Set when a batch was dropped because the queue was full.
    overflowed: Arc<AtomicBool>,
    watched: Arc<Mutex<HashSet<PathBuf>>>,
    debouncer: Debouncer<RecommendedWatcher>,
}

impl FsWatcher {
    /// Create a watcher with no directories subscribed yet.
    pub fn new(settings: WatchSettings, event_tx: mpsc::Sender<WatchEvent>) -> Result<Self> {
        let overflowed = Arc::new(AtomicBool::new(false));
        let watched: Arc<Mutex<HashSet<PathBuf>>> = Arc::new(Mutex::new(HashSet::new()));

        let overflowed_cb = overflowed.clone();
        let watched_cb = watched.clone();
        let flood_threshold = settings.flood_threshold;

        let debouncer = new_debouncer(
            settings.debounce,
            move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| {
                let events = match result {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(error = %e, "watch backend error");
                        return;
                    }
                };

                let paths: Vec<PathBuf> = events
                    .into_iter()
                    .filter(|e| e.kind == DebouncedEventKind::Any)
                    .map(|e| e.path)
                    .collect();

                let dirs = match watched_cb.lock() {
                    Ok(watched) => affected_dirs(&paths, &watched),
                    Err(_) => return,
                };
                if dirs.is_empty() {
                    return;
                }

                let event = if dirs.len() > flood_threshold {
                    WatchEvent::Flood
                } else {
                    WatchEvent::Changed(dirs)
                };

                match event_tx.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        overflowed_cb.store(true, Ordering::Relaxed);
                    }
                    Err(TrySendError::Closed(_)) => {}
                }
            },
        )?;

        Ok(Self {
            overflowed,
            watched,
            debouncer,
        })
    }

    /// Subscribe to changes of `dir`'s immediate entries.
    pub fn watch(&mut self, dir: &Path) -> Result<()> {
        if self.is_watching(dir) {
            return Ok(());
        }
        self.debouncer
            .watcher()
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| BrowserError::WatchUnavailable(format!("{}: {}", dir.display(), e)))?;
        if let Ok(mut watched) = self.watched.lock() {
            watched.insert(dir.to_path_buf());
        }
        debug!(path = %dir.display(), "watching");
        Ok(())
    }

    /// Drop the subscription for `dir`. Unknown paths are ignored.
    pub fn unwatch(&mut self, dir: &Path) {
        let removed = match self.watched.lock() {
            Ok(mut watched) => watched.remove(dir),
            Err(_) => false,
        };
        if removed {
            // The directory may already be gone, in which case the backend
            // dropped the watch itself.
            let _ = self.debouncer.watcher().unwatch(dir);
            debug!(path = %dir.display(), "unwatched");
        }
    }

    /// Make the subscription set equal to `dirs`.
    ///
    /// Directories that cannot be watched (deleted in the meantime) are
    /// skipped and reported in the returned list.
    pub fn sync(&mut self, dirs: &HashSet<PathBuf>) -> Vec<PathBuf> {
        for stale in self.watched().into_iter().filter(|d| !dirs.contains(d)) {
            self.unwatch(&stale);
        }
        let mut failed = Vec::new();
        for dir in dirs {
            if let Err(e) = self.watch(dir) {
                debug!(error = %e, "skipping unwatchable directory");
                failed.push(dir.clone());
            }
        }
        failed
    }

    pub fn is_watching(&self, dir: &Path) -> bool {
        self.watched
            .lock()
            .map(|watched| watched.contains(dir))
            .unwrap_or(false)
    }

    /// Currently watched directories, sorted.
    pub fn watched(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self
            .watched
            .lock()
            .map(|watched| watched.iter().cloned().collect())
            .unwrap_or_default();
        dirs.sort();
        dirs
    }

    /// Whether a batch was dropped since the last call. Resets the flag.
    pub fn take_overflow(&self) -> bool {
        self.overflowed.swap(false, Ordering::Relaxed)
    }
}

/// Map changed entry paths to the watched directories whose listing they
/// belong to. Each directory appears once; order is deterministic.
pub fn affected_dirs(paths: &[PathBuf], watched: &HashSet<PathBuf>) -> Vec<PathBuf> {
    let dirs: BTreeSet<PathBuf> = paths
        .iter()
        .filter_map(|p| p.parent())
        .filter(|parent| watched.contains(*parent))
        .map(Path::to_path_buf)
        .collect();
    dirs.into_iter().collect()
}
