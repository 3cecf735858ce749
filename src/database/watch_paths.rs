// Watch path persistence

use super::*;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::helpers::{WATCH_PATH_COLUMNS, row_to_watch_path, to_nanos};
use crate::watcher::{WatchPath, WatchPathId};

impl PipelineDatabase {
    pub fn insert_watch_path(&self, watch_path: &WatchPath) -> Result<()> {
        self.conn.execute(
            "INSERT INTO watch_paths (id, path, recursive, created_at, active)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                watch_path.id.to_string(),
                watch_path.path.to_string_lossy(),
                watch_path.recursive,
                to_nanos(&watch_path.created_at),
                watch_path.active,
            ],
        )?;
        Ok(())
    }

    /// Mark a watch path removed; the row is kept so past events still resolve
    pub fn deactivate_watch_path(&self, id: WatchPathId, removed_at: &DateTime<Utc>) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE watch_paths SET active = 0, removed_at = ?2 WHERE id = ?1 AND active = 1",
            params![id.to_string(), to_nanos(removed_at)],
        )?;
        Ok(updated > 0)
    }

    pub fn get_watch_path(&self, id: WatchPathId) -> Result<Option<WatchPath>> {
        let watch_path = self
            .conn
            .query_row(
                &format!("SELECT {WATCH_PATH_COLUMNS} FROM watch_paths WHERE id = ?1"),
                params![id.to_string()],
                row_to_watch_path,
            )
            .optional()?;
        Ok(watch_path)
    }

    pub fn load_active_watch_paths(&self) -> Result<Vec<WatchPath>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {WATCH_PATH_COLUMNS} FROM watch_paths WHERE active = 1 ORDER BY created_at ASC"
        ))?;
        let paths = stmt
            .query_map([], row_to_watch_path)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(paths)
    }
}
