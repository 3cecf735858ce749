//! Burst coalescing
//!
//! Raw notifications for the same file are folded together until the file has been quiet
//! for the coalescing window, or until the burst reaches the maximum delay so a file that
//! is written continuously is still recorded periodically. The surviving change is then resolved against the file's
//! final on-disk state and its last recorded fingerprint.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::events::{ChangeKind, Fingerprint};
use crate::watcher::types::{RawChange, WatchPathId};

/// A burst of changes to one file that has not been flushed yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub watch_path_id: WatchPathId,
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub renamed_from: Option<PathBuf>,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

#[derive(Debug)]
pub struct Coalescer {
    window: Duration,
    max_delay: Duration,
    pending: HashMap<PathBuf, PendingChange>,
}

impl Coalescer {
    pub fn new(window: Duration, max_delay: Duration) -> Self {
        Self {
            window,
            max_delay: max_delay.max(window),
            pending: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Fold a raw change into the pending burst for its file
    pub fn observe(&mut self, watch_path_id: WatchPathId, change: RawChange) {
        match self.pending.get_mut(&change.path) {
            Some(pending) => {
                pending.watch_path_id = watch_path_id;
                pending.last_seen = pending.last_seen.max(change.observed_at);
                pending.kind = merge_kinds(pending.kind, change.kind);
                if pending.renamed_from.is_none() {
                    pending.renamed_from = change.renamed_from;
                }
            }
            None => {
                self.pending.insert(
                    change.path.clone(),
                    PendingChange {
                        watch_path_id,
                        path: change.path,
                        kind: change.kind,
                        renamed_from: change.renamed_from,
                        first_seen: change.observed_at,
                        last_seen: change.observed_at,
                    },
                );
            }
        }
    }

    /// Remove and return every burst that has been quiet for at least the window or
    /// has been pending for the maximum delay
    pub fn drain_ready(&mut self, now: Instant) -> Vec<PendingChange> {
        let (window, max_delay) = (self.window, self.max_delay);
        let ready: Vec<PathBuf> = self
            .pending
            .values()
            .filter(|p| {
                now.saturating_duration_since(p.last_seen) >= window
                    || now.saturating_duration_since(p.first_seen) >= max_delay
            })
            .map(|p| p.path.clone())
            .collect();

        let mut drained: Vec<PendingChange> = ready
            .iter()
            .filter_map(|path| self.pending.remove(path))
            .collect();
        sort_by_arrival(&mut drained);
        drained
    }

    /// Remove and return every pending burst regardless of age
    pub fn drain_all(&mut self) -> Vec<PendingChange> {
        let mut drained: Vec<PendingChange> = self.pending.drain().map(|(_, p)| p).collect();
        sort_by_arrival(&mut drained);
        drained
    }

    /// Put back a drained burst that could not be recorded. Newer observations win.
    pub fn requeue(&mut self, change: PendingChange) {
        match self.pending.get_mut(&change.path) {
            Some(newer) => newer.first_seen = newer.first_seen.min(change.first_seen),
            None => {
                self.pending.insert(change.path.clone(), change);
            }
        }
    }

    /// Hand the pending bursts of a removed watch path to whichever path `attribute`
    /// picks. Bursts no remaining path covers are dropped.
    ///
    /// Returns `(reassigned, dropped)`.
    pub fn reassign_watch(
        &mut self,
        watch_path_id: WatchPathId,
        mut attribute: impl FnMut(&Path) -> Option<WatchPathId>,
    ) -> (usize, usize) {
        let mut reassigned = 0;
        let mut dropped = 0;
        self.pending.retain(|path, pending| {
            if pending.watch_path_id != watch_path_id {
                return true;
            }
            match attribute(path) {
                Some(id) => {
                    pending.watch_path_id = id;
                    reassigned += 1;
                    true
                }
                None => {
                    dropped += 1;
                    false
                }
            }
        });
        (reassigned, dropped)
    }
}

fn sort_by_arrival(changes: &mut [PendingChange]) {
    changes.sort_by(|a, b| {
        a.first_seen
            .cmp(&b.first_seen)
            .then_with(|| a.path.cmp(&b.path))
    });
}

/// A modification on top of a creation or rename is still that creation or rename
fn merge_kinds(previous: ChangeKind, next: ChangeKind) -> ChangeKind {
    match (previous, next) {
        (ChangeKind::Created | ChangeKind::Renamed, ChangeKind::Modified) => previous,
        _ => next,
    }
}

/// Decide what a flushed burst amounts to, given the file's final fingerprint and the
/// fingerprint last recorded for it. `None` means there is nothing to record.
pub fn resolve_kind(
    pending_kind: ChangeKind,
    current: &Fingerprint,
    last_known: Option<&Fingerprint>,
) -> Option<ChangeKind> {
    let known = last_known.filter(|fp| !fp.is_absent());

    if current.is_absent() {
        return known.map(|_| ChangeKind::Removed);
    }
    if known == Some(current) {
        return None;
    }
    match (pending_kind, known) {
        (ChangeKind::Renamed, _) => Some(ChangeKind::Renamed),
        (_, Some(_)) => Some(ChangeKind::Modified),
        (_, None) => Some(ChangeKind::Created),
    }
}
