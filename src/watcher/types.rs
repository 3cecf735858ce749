//! Type definitions for watch paths and raw changes
//!
//! This module defines the structures the watcher uses between the OS notification
//! callback and the event store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;
use uuid::Uuid;

use crate::error::CoreError;
use crate::events::ChangeKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatchPathId(Uuid);

impl WatchPathId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WatchPathId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WatchPathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for WatchPathId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoreError::InvalidInput(format!("invalid watch path id {s}: {e}")))
    }
}

/// A directory or file under observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchPath {
    pub id: WatchPathId,
    /// Canonicalized absolute path
    pub path: PathBuf,
    pub recursive: bool,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

impl WatchPath {
    /// Whether a change to `file` belongs to this watch path
    pub fn covers(&self, file: &Path) -> bool {
        if file == self.path {
            return true;
        }
        if self.recursive {
            file.starts_with(&self.path)
        } else {
            file.parent() == Some(self.path.as_path())
        }
    }
}

/// A normalized OS notification before coalescing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub renamed_from: Option<PathBuf>,
    pub observed_at: Instant,
}
