//! File watcher and change recording
//!
//! The watcher turns raw OS notifications into durable [`ChangeEvent`]s.
//!
//! # Architecture
//!
//! Processing happens in two phases:
//! 1. **File System Events** → notify delivers raw events, which are normalized,
//!    filtered, attributed to a watch path and folded into the [`Coalescer`]
//! 2. **Flush** → a background task periodically drains quiet bursts, fingerprints the
//!    final file state and appends the surviving changes to the [`EventStore`]
//!
//! Only after an append commits is the event forwarded to the dispatcher and to
//! subscribers. Appends happen under the watch path read lock and removal takes the
//! write lock, so once `remove_path` returns no further event is recorded for it.

pub mod coalesce;
pub mod events;
pub mod filtering;
pub mod fingerprint;
pub mod types;

use chrono::Utc;
use notify::{RecursiveMode, Watcher};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::WatcherConfig;
use crate::database::{self, SharedDatabase};
use crate::error::{CoreError, Result};
use crate::events::{ChangeEvent, ChangeKind, EventStore, Fingerprint, NewChangeEvent};

pub use coalesce::{Coalescer, PendingChange};
pub use filtering::IgnoreRules;
pub use types::{RawChange, WatchPath, WatchPathId};

/// Events buffered per subscriber before it starts lagging
const SUBSCRIBER_CAPACITY: usize = 1024;

const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

struct WatchTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct WatchInner {
    config: WatcherConfig,
    db: SharedDatabase,
    events: Arc<EventStore>,
    ignore: IgnoreRules,
    paths: RwLock<HashMap<WatchPathId, WatchPath>>,
    os_watcher: Mutex<Option<notify::RecommendedWatcher>>,
    coalescer: Mutex<Coalescer>,
    /// Last recorded fingerprint per file, filled lazily from the event store
    fingerprints: Mutex<HashMap<PathBuf, Fingerprint>>,
    /// Serializes flushes so events are published in sequence order
    flush_lock: Mutex<()>,
    dispatch_tx: mpsc::UnboundedSender<ChangeEvent>,
    subscribers: broadcast::Sender<ChangeEvent>,
}

/// Manages watch paths and records their changes
pub struct WatchManager {
    inner: Arc<WatchInner>,
    task: Mutex<Option<WatchTask>>,
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("{} mutex poisoned, recovering", what);
        poisoned.into_inner()
    })
}

fn recursive_mode(recursive: bool) -> RecursiveMode {
    if recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    }
}

impl WatchManager {
    /// Create the manager and restore the active watch paths from storage.
    ///
    /// Nothing is observed until [`WatchManager::start`] is called.
    pub fn new(
        config: WatcherConfig,
        db: SharedDatabase,
        events: Arc<EventStore>,
        dispatch_tx: mpsc::UnboundedSender<ChangeEvent>,
    ) -> Result<Self> {
        let ignore = IgnoreRules::new(&config.ignore_patterns)?;
        let restored = database::lock(&db).load_active_watch_paths()?;
        info!("Restored {} active watch paths", restored.len());

        let paths = restored.into_iter().map(|p| (p.id, p)).collect();
        let (subscribers, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        let coalescer = Coalescer::new(config.coalesce_window(), config.max_coalesce_delay());

        Ok(Self {
            inner: Arc::new(WatchInner {
                config,
                db,
                events,
                ignore,
                paths: RwLock::new(paths),
                os_watcher: Mutex::new(None),
                coalescer: Mutex::new(coalescer),
                fingerprints: Mutex::new(HashMap::new()),
                flush_lock: Mutex::new(()),
                dispatch_tx,
                subscribers,
            }),
            task: Mutex::new(None),
        })
    }

    /// Start observing every active path and spawn the flush loop
    pub fn start(&self) -> Result<()> {
        let mut task = lock_or_recover(&self.task, "Watch task");
        if task.is_some() {
            debug!("Watcher already running");
            return Ok(());
        }

        let paths = self.list_paths();
        info!("Starting file watcher for {} paths", paths.len());

        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();
        let mut watcher = notify::recommended_watcher(move |res| {
            if let Err(e) = tx.send(res) {
                error!("Failed to send file event: {}", e);
            }
        })?;
        for watch_path in &paths {
            if let Err(e) = watcher.watch(&watch_path.path, recursive_mode(watch_path.recursive)) {
                warn!(
                    "Failed to watch {} ({}): {}",
                    watch_path.path.display(),
                    watch_path.id,
                    e
                );
            }
        }
        *self.inner.lock_os_watcher() = Some(watcher);

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let period = (self.inner.config.coalesce_window() / 4).max(MIN_FLUSH_INTERVAL);

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!("🔍 File system event loop started");
            loop {
                tokio::select! {
                    Some(event_result) = rx.recv() => match event_result {
                        Ok(event) => {
                            debug!("📁 File system event detected: {:?}", event);
                            inner.observe_notify_event(event, Instant::now());
                        }
                        Err(e) => warn!("File watcher error: {}", e),
                    },
                    _ = tick.tick() => flush_in_background(inner.clone(), false).await,
                    _ = shutdown_rx.changed() => break,
                }
            }

            flush_in_background(inner, true).await;
            info!("File system event loop stopped");
        });
        *task = Some(WatchTask { shutdown, handle });
        drop(task);

        // Pick up whatever changed while we were not running
        for watch_path in &paths {
            if let Err(e) = self.rescan(watch_path.id) {
                warn!("Initial scan of {} failed: {}", watch_path.path.display(), e);
            }
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        lock_or_recover(&self.task, "Watch task").is_some()
    }

    /// Stop observing, flush every pending burst and wait for the loop to exit
    pub async fn shutdown(&self) -> Result<()> {
        let task = lock_or_recover(&self.task, "Watch task").take();
        self.inner.lock_os_watcher().take();

        match task {
            Some(task) => {
                let _ = task.shutdown.send(true);
                if let Err(e) = task.handle.await {
                    error!("Watcher loop panicked: {}", e);
                }
            }
            None => {
                self.flush_all()?;
            }
        }
        info!("File watcher shut down");
        Ok(())
    }

    /// Begin watching `path`. The path is canonicalized and must exist.
    pub fn add_path(&self, path: impl AsRef<Path>, recursive: bool) -> Result<WatchPath> {
        let requested = path.as_ref();
        let canonical = match std::fs::canonicalize(requested) {
            Ok(canonical) => canonical,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CoreError::PathNotFound(requested.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut paths = self.inner.write_paths();
        if let Some(existing) = paths.values().find(|p| p.path == canonical) {
            return Err(CoreError::AlreadyWatched {
                existing: existing.id,
            });
        }

        let watch_path = WatchPath {
            id: WatchPathId::new(),
            path: canonical,
            recursive,
            created_at: Utc::now(),
            active: true,
        };

        if let Some(watcher) = self.inner.lock_os_watcher().as_mut() {
            watcher.watch(&watch_path.path, recursive_mode(recursive))?;
        }
        if let Err(e) = database::lock(&self.inner.db).insert_watch_path(&watch_path) {
            self.inner.release_os_watch(&watch_path, &paths);
            return Err(e);
        }
        paths.insert(watch_path.id, watch_path.clone());

        info!(
            "Watching {} ({}, recursive = {})",
            watch_path.path.display(),
            watch_path.id,
            recursive
        );
        Ok(watch_path)
    }

    /// Stop watching. No event for this path is recorded after this returns.
    pub fn remove_path(&self, id: WatchPathId) -> Result<WatchPath> {
        let mut paths = self.inner.write_paths();
        let Some(existing) = paths.get(&id).cloned() else {
            return Err(CoreError::not_found("watch path", id));
        };

        database::lock(&self.inner.db).deactivate_watch_path(id, &Utc::now())?;
        paths.remove(&id);
        self.inner.release_os_watch(&existing, &paths);
        let (reassigned, dropped) = self
            .inner
            .lock_coalescer()
            .reassign_watch(id, |file| WatchInner::attribute(&paths, file));
        drop(paths);

        info!(
            "Stopped watching {} ({}): {} pending changes moved to an enclosing path, {} dropped",
            existing.path.display(),
            id,
            reassigned,
            dropped
        );
        Ok(WatchPath {
            active: false,
            ..existing
        })
    }

    /// Active watch paths, oldest first
    pub fn list_paths(&self) -> Vec<WatchPath> {
        let mut paths: Vec<WatchPath> = self.inner.read_paths().values().cloned().collect();
        paths.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.path.cmp(&b.path)));
        paths
    }

    pub fn get_path(&self, id: WatchPathId) -> Result<WatchPath> {
        self.inner
            .read_paths()
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("watch path", id))
    }

    /// Queue every file under a watch path for re-examination.
    ///
    /// Files whose fingerprint matches the last recorded one produce no event.
    pub fn rescan(&self, id: WatchPathId) -> Result<usize> {
        let watch_path = self.get_path(id)?;
        let max_depth = if watch_path.recursive { usize::MAX } else { 1 };

        let files: Vec<PathBuf> = WalkDir::new(&watch_path.path)
            .max_depth(max_depth)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping unreadable entry during scan: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| !self.inner.ignore.is_ignored(path))
            .collect();

        let now = Instant::now();
        let queued = files.len();
        let mut coalescer = self.inner.lock_coalescer();
        for path in files {
            coalescer.observe(
                id,
                RawChange {
                    path,
                    kind: ChangeKind::Modified,
                    renamed_from: None,
                    observed_at: now,
                },
            );
        }

        debug!("Queued {} files from {}", queued, watch_path.path.display());
        Ok(queued)
    }

    /// Receive every recorded event from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.subscribers.subscribe()
    }

    /// Feed one OS notification through normalization, filtering and coalescing.
    ///
    /// Returns how many raw changes were accepted.
    pub fn observe_notify_event(&self, event: notify::Event, observed_at: Instant) -> usize {
        self.inner.observe_notify_event(event, observed_at)
    }

    /// Record every burst that has been quiet for a full window as of `now`
    pub fn flush_ready(&self, now: Instant) -> Result<Vec<ChangeEvent>> {
        self.inner.flush_ready(now)
    }

    /// Record every pending burst immediately
    pub fn flush_all(&self) -> Result<Vec<ChangeEvent>> {
        self.inner.flush_all()
    }

    pub fn pending_changes(&self) -> usize {
        self.inner.lock_coalescer().len()
    }
}

async fn flush_in_background(inner: Arc<WatchInner>, all: bool) {
    let result = tokio::task::spawn_blocking(move || {
        if all {
            inner.flush_all()
        } else {
            inner.flush_ready(Instant::now())
        }
    })
    .await;

    match result {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!("Failed to record file changes: {}", e),
        Err(e) => error!("Flush task panicked: {}", e),
    }
}

impl WatchInner {
    fn read_paths(&self) -> RwLockReadGuard<'_, HashMap<WatchPathId, WatchPath>> {
        self.paths.read().unwrap_or_else(|poisoned| {
            warn!("Watch path lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write_paths(&self) -> RwLockWriteGuard<'_, HashMap<WatchPathId, WatchPath>> {
        self.paths.write().unwrap_or_else(|poisoned| {
            warn!("Watch path lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn lock_coalescer(&self) -> MutexGuard<'_, Coalescer> {
        lock_or_recover(&self.coalescer, "Coalescer")
    }

    fn lock_os_watcher(&self) -> MutexGuard<'_, Option<notify::RecommendedWatcher>> {
        lock_or_recover(&self.os_watcher, "OS watcher")
    }

    /// Stop the OS watch of a removed path without blinding the paths that remain.
    ///
    /// inotify watches are per directory, so an enclosing recursive root shares them and
    /// keeps them; unwatching a recursive root also drops the watches of roots nested in it.
    fn release_os_watch(&self, removed: &WatchPath, remaining: &HashMap<WatchPathId, WatchPath>) {
        let mut os_watcher = self.lock_os_watcher();
        let Some(watcher) = os_watcher.as_mut() else {
            return;
        };
        if remaining
            .values()
            .any(|p| p.recursive && removed.path.starts_with(&p.path))
        {
            debug!(
                "{} stays observed through an enclosing watch path",
                removed.path.display()
            );
            return;
        }

        if let Err(e) = watcher.unwatch(&removed.path) {
            warn!("Failed to unwatch {}: {}", removed.path.display(), e);
        }
        for nested in remaining
            .values()
            .filter(|p| p.path.starts_with(&removed.path))
        {
            if let Err(e) = watcher.watch(&nested.path, recursive_mode(nested.recursive)) {
                warn!("Failed to re-watch {}: {}", nested.path.display(), e);
            }
        }
    }

    /// The most specific active watch path covering `path`
    fn attribute(paths: &HashMap<WatchPathId, WatchPath>, path: &Path) -> Option<WatchPathId> {
        paths
            .values()
            .filter(|watch_path| watch_path.covers(path))
            .max_by_key(|watch_path| watch_path.path.components().count())
            .map(|watch_path| watch_path.id)
    }

    fn observe_notify_event(&self, event: notify::Event, observed_at: Instant) -> usize {
        let changes = events::normalize_event(event, observed_at);

        let attributed: Vec<(WatchPathId, RawChange)> = {
            let paths = self.read_paths();
            changes
                .into_iter()
                .filter(|change| !self.ignore.is_ignored(&change.path))
                .filter_map(|change| {
                    Self::attribute(&paths, &change.path).map(|id| (id, change))
                })
                .collect()
        };

        let accepted = attributed.len();
        let mut coalescer = self.lock_coalescer();
        for (id, change) in attributed {
            coalescer.observe(id, change);
        }
        accepted
    }

    fn flush_ready(&self, now: Instant) -> Result<Vec<ChangeEvent>> {
        let _flush = lock_or_recover(&self.flush_lock, "Flush");
        let ready = self.lock_coalescer().drain_ready(now);
        self.record_all(ready)
    }

    fn flush_all(&self) -> Result<Vec<ChangeEvent>> {
        let _flush = lock_or_recover(&self.flush_lock, "Flush");
        let pending = self.lock_coalescer().drain_all();
        self.record_all(pending)
    }

    fn record_all(&self, changes: Vec<PendingChange>) -> Result<Vec<ChangeEvent>> {
        let mut recorded = Vec::new();
        let mut remaining = changes.into_iter();

        while let Some(change) = remaining.next() {
            match self.record(&change) {
                Ok(Some(event)) => recorded.push(event),
                Ok(None) => {}
                Err(e) => {
                    // Keep the unrecorded bursts for the next flush
                    let mut coalescer = self.lock_coalescer();
                    coalescer.requeue(change);
                    for rest in remaining {
                        coalescer.requeue(rest);
                    }
                    return Err(e);
                }
            }
        }

        if !recorded.is_empty() {
            debug!("Recorded {} change events", recorded.len());
        }
        Ok(recorded)
    }

    fn last_fingerprint(&self, path: &Path) -> Result<Option<Fingerprint>> {
        if let Some(fp) = lock_or_recover(&self.fingerprints, "Fingerprint cache").get(path) {
            return Ok(Some(fp.clone()));
        }
        let from_store = self.events.last_for_path(path)?.map(|event| event.fingerprint);
        if let Some(fp) = &from_store {
            lock_or_recover(&self.fingerprints, "Fingerprint cache")
                .insert(path.to_path_buf(), fp.clone());
        }
        Ok(from_store)
    }

    /// Resolve one burst and durably append it. `Ok(None)` means nothing changed.
    fn record(&self, change: &PendingChange) -> Result<Option<ChangeEvent>> {
        let fingerprint =
            match fingerprint::fingerprint_path(&change.path, self.config.max_hash_bytes) {
                Ok(Some(fp)) => fp,
                Ok(None) => return Ok(None),
                Err(e) => {
                    warn!("Cannot fingerprint {}: {}", change.path.display(), e);
                    return Ok(None);
                }
            };

        let paths = self.read_paths();
        let watch_path_id = if paths.contains_key(&change.watch_path_id) {
            change.watch_path_id
        } else {
            // Removed after this burst was drained; an enclosing path may still cover it
            match Self::attribute(&paths, &change.path) {
                Some(id) => id,
                None => {
                    debug!(
                        "Dropping change to {}: watch path {} was removed",
                        change.path.display(),
                        change.watch_path_id
                    );
                    return Ok(None);
                }
            }
        };

        let last_known = self.last_fingerprint(&change.path)?;
        let Some(kind) = coalesce::resolve_kind(change.kind, &fingerprint, last_known.as_ref())
        else {
            debug!("⏭️  No effective change to {}", change.path.display());
            return Ok(None);
        };

        let event = self.events.append(NewChangeEvent {
            watch_path_id,
            path: change.path.clone(),
            kind,
            renamed_from: match kind {
                ChangeKind::Renamed => change.renamed_from.clone(),
                _ => None,
            },
            fingerprint: fingerprint.clone(),
        })?;
        drop(paths);

        lock_or_recover(&self.fingerprints, "Fingerprint cache")
            .insert(change.path.clone(), fingerprint);
        self.publish(&event);
        Ok(Some(event))
    }

    fn publish(&self, event: &ChangeEvent) {
        if self.dispatch_tx.send(event.clone()).is_err() {
            debug!("Dispatcher channel closed, event #{} stays in the log", event.seq);
        }
        // No subscribers is fine
        let _ = self.subscribers.send(event.clone());
    }
}
