// Helper functions for row conversion

use chrono::{DateTime, Utc};
use rusqlite::Row;
use rusqlite::types::Type;
use std::path::PathBuf;
use std::str::FromStr;

use crate::events::{ChangeEvent, ChangeKind, Fingerprint};
use crate::jobs::{Job, JobId, JobKind, JobState};
use crate::watcher::{WatchPath, WatchPathId};

/// Standard SELECT column list for event queries, in row_to_event order
pub(crate) const EVENT_COLUMNS: &str =
    "seq, recorded_at, watch_path_id, path, kind, renamed_from, fingerprint";

pub(crate) const JOB_COLUMNS: &str = "id, kind, target_key, state, payload, history, \
     origin_seq, result, failure, attempts, created_at, updated_at";

pub(crate) const WATCH_PATH_COLUMNS: &str = "id, path, recursive, created_at, active";

/// Timestamps are stored as nanoseconds since the epoch so values read back compare
/// equal to the ones written. Instants outside 1677..2262 saturate.
pub(crate) fn to_nanos(at: &DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(if at.timestamp() < 0 {
        i64::MIN
    } else {
        i64::MAX
    })
}

pub(crate) fn from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

fn conversion_error(idx: usize, message: impl Into<String>) -> rusqlite::Error {
    let message: String = message.into();
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_column<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| conversion_error(idx, e.to_string()))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

pub(crate) fn row_to_event(row: &Row) -> rusqlite::Result<ChangeEvent> {
    let seq: i64 = row.get(0)?;
    let renamed_from: Option<String> = row.get(5)?;
    let path: String = row.get(3)?;
    let fingerprint: String = row.get(6)?;

    Ok(ChangeEvent {
        seq: seq as u64,
        recorded_at: from_nanos(row.get(1)?),
        watch_path_id: parse_column::<WatchPathId>(row, 2)?,
        path: PathBuf::from(path),
        kind: parse_column::<ChangeKind>(row, 4)?,
        renamed_from: renamed_from.map(PathBuf::from),
        fingerprint: Fingerprint::new(fingerprint),
    })
}

pub(crate) fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let id: i64 = row.get(0)?;
    let origin_seq: Option<i64> = row.get(6)?;
    let failure: Option<String> = row.get(8)?;
    let failure = match failure {
        Some(raw) => {
            Some(serde_json::from_str(&raw).map_err(|e| conversion_error(8, e.to_string()))?)
        }
        None => None,
    };
    let attempts: i64 = row.get(9)?;

    Ok(Job {
        id: JobId(id as u64),
        kind: parse_column::<JobKind>(row, 1)?,
        target_key: row.get(2)?,
        state: parse_column::<JobState>(row, 3)?,
        payload: json_column(row, 4)?,
        history: json_column(row, 5)?,
        origin_event_seq: origin_seq.map(|seq| seq as u64),
        result: row.get(7)?,
        failure,
        attempts: attempts as u32,
        created_at: from_nanos(row.get(10)?),
        updated_at: from_nanos(row.get(11)?),
    })
}

pub(crate) fn row_to_watch_path(row: &Row) -> rusqlite::Result<WatchPath> {
    let path: String = row.get(1)?;
    Ok(WatchPath {
        id: parse_column::<WatchPathId>(row, 0)?,
        path: PathBuf::from(path),
        recursive: row.get(2)?,
        created_at: from_nanos(row.get(3)?),
        active: row.get(4)?,
    })
}
