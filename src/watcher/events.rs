//! File system event normalization
//!
//! Converts `notify::Event` values into [`RawChange`] entries ready for coalescing.

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind};
use std::time::Instant;
use tracing::debug;

use crate::events::ChangeKind;
use crate::watcher::types::RawChange;

/// Normalize one OS notification. Access events and directory creations produce nothing.
pub fn normalize_event(event: Event, observed_at: Instant) -> Vec<RawChange> {
    let raw = |path, kind, renamed_from| RawChange {
        path,
        kind,
        renamed_from,
        observed_at,
    };

    match event.kind {
        EventKind::Create(_) => event
            .paths
            .into_iter()
            .filter(|path| !path.is_dir())
            .map(|path| raw(path, ChangeKind::Created, None))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            match (paths.next(), paths.next()) {
                (Some(from), Some(to)) => vec![
                    raw(from.clone(), ChangeKind::Removed, None),
                    raw(to, ChangeKind::Renamed, Some(from)),
                ],
                (Some(path), None) => vec![raw(path, ChangeKind::Modified, None)],
                _ => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .into_iter()
            .map(|path| raw(path, ChangeKind::Removed, None))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .into_iter()
            .filter(|path| !path.is_dir())
            .map(|path| raw(path, ChangeKind::Created, None))
            .collect(),
        EventKind::Modify(_) => event
            .paths
            .into_iter()
            .filter(|path| !path.is_dir())
            .map(|path| raw(path, ChangeKind::Modified, None))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .into_iter()
            .map(|path| raw(path, ChangeKind::Removed, None))
            .collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => {
            debug!("Ignoring event kind: {:?}", event.kind);
            Vec::new()
        }
    }
}
