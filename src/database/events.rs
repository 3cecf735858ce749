// Event log operations (append-only)

use super::*;
use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{OptionalExtension, params, params_from_iter};
use std::path::Path;

use super::helpers::{EVENT_COLUMNS, row_to_event, to_nanos};
use crate::events::{ChangeEvent, EventFilter, NewChangeEvent};

impl PipelineDatabase {
    pub fn insert_event(
        &self,
        seq: u64,
        recorded_at: &DateTime<Utc>,
        event: &NewChangeEvent,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO events (seq, recorded_at, watch_path_id, path, kind, renamed_from, fingerprint)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                seq as i64,
                to_nanos(recorded_at),
                event.watch_path_id.to_string(),
                event.path.to_string_lossy(),
                event.kind.as_str(),
                event
                    .renamed_from
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned()),
                event.fingerprint.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn get_event(&self, seq: u64) -> Result<Option<ChangeEvent>> {
        let event = self
            .conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE seq = ?1"),
                params![seq as i64],
                row_to_event,
            )
            .optional()?;
        Ok(event)
    }

    /// Events with `from <= seq <= to`, in sequence order
    pub fn scan_events(&self, from: u64, to: u64, limit: usize) -> Result<Vec<ChangeEvent>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE seq >= ?1 AND seq <= ?2
             ORDER BY seq ASC LIMIT ?3"
        ))?;
        let events = stmt
            .query_map(
                params![clamp(from), clamp(to), limit as i64],
                row_to_event,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    pub fn max_event_seq(&self) -> Result<u64> {
        let max: i64 = self
            .conn
            .query_row("SELECT COALESCE(MAX(seq), 0) FROM events", [], |row| {
                row.get(0)
            })?;
        Ok(max as u64)
    }

    pub fn last_event_for_path(&self, path: &Path) -> Result<Option<ChangeEvent>> {
        let event = self
            .conn
            .query_row(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM events WHERE path = ?1
                     ORDER BY seq DESC LIMIT 1"
                ),
                params![path.to_string_lossy()],
                row_to_event,
            )
            .optional()?;
        Ok(event)
    }

    pub fn search_events(
        &self,
        filter: &EventFilter,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>> {
        let mut clauses = vec!["seq > ?".to_string()];
        let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(clamp(after_seq))];

        if let Some(id) = &filter.watch_path_id {
            clauses.push("watch_path_id = ?".to_string());
            values.push(Box::new(id.to_string()));
        }
        if let Some(prefix) = &filter.path_prefix {
            clauses.push("substr(path, 1, ?) = ?".to_string());
            values.push(Box::new(prefix.chars().count() as i64));
            values.push(Box::new(prefix.clone()));
        }
        if !filter.kinds.is_empty() {
            let placeholders = vec!["?"; filter.kinds.len()].join(", ");
            clauses.push(format!("kind IN ({placeholders})"));
            for kind in &filter.kinds {
                values.push(Box::new(kind.as_str()));
            }
        }
        if let Some(after) = &filter.recorded_after {
            clauses.push("recorded_at >= ?".to_string());
            values.push(Box::new(to_nanos(after)));
        }
        if let Some(before) = &filter.recorded_before {
            clauses.push("recorded_at < ?".to_string());
            values.push(Box::new(to_nanos(before)));
        }
        values.push(Box::new(limit as i64));

        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE {} ORDER BY seq ASC LIMIT ?",
            clauses.join(" AND ")
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let events = stmt
            .query_map(params_from_iter(values.iter()), row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }
}

fn clamp(seq: u64) -> i64 {
    seq.min(i64::MAX as u64) as i64
}
