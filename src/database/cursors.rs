// Dispatcher lane cursors

use super::*;
use rusqlite::{OptionalExtension, params};

impl PipelineDatabase {
    /// Last event sequence a lane has derived jobs for (0 when it never ran)
    pub fn get_dispatch_cursor(&self, lane: &str) -> Result<u64> {
        let seq: Option<i64> = self
            .conn
            .query_row(
                "SELECT last_seq FROM dispatch_cursors WHERE lane = ?1",
                params![lane],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq.unwrap_or(0) as u64)
    }

    pub fn set_dispatch_cursor(&self, lane: &str, seq: u64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO dispatch_cursors (lane, last_seq) VALUES (?1, ?2)
             ON CONFLICT(lane) DO UPDATE SET last_seq = excluded.last_seq",
            params![lane, seq as i64],
        )?;
        Ok(())
    }
}
