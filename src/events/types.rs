//! Type definitions for recorded change events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::CoreError;
use crate::watcher::WatchPathId;

/// Kinds of file system changes we record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    Renamed,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Removed => "removed",
            ChangeKind::Renamed => "renamed",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ChangeKind::Created),
            "modified" => Ok(ChangeKind::Modified),
            "removed" => Ok(ChangeKind::Removed),
            "renamed" => Ok(ChangeKind::Renamed),
            other => Err(CoreError::InvalidInput(format!(
                "unknown change kind: {other}"
            ))),
        }
    }
}

/// Opaque content fingerprint used to suppress no-op writes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub const ABSENT: &'static str = "absent";

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn absent() -> Self {
        Self(Self::ABSENT.to_string())
    }

    pub fn is_absent(&self) -> bool {
        self.0 == Self::ABSENT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An immutable, durably recorded file change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub watch_path_id: WatchPathId,
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub renamed_from: Option<PathBuf>,
    pub fingerprint: Fingerprint,
}

/// A change the watcher wants recorded; the store assigns `seq` and `recorded_at`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChangeEvent {
    pub watch_path_id: WatchPathId,
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub renamed_from: Option<PathBuf>,
    pub fingerprint: Fingerprint,
}

/// Structured filter over event metadata. Every set field must match.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub watch_path_id: Option<WatchPathId>,
    pub path_prefix: Option<String>,
    pub kinds: Vec<ChangeKind>,
    pub recorded_after: Option<DateTime<Utc>>,
    pub recorded_before: Option<DateTime<Utc>>,
}
