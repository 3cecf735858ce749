// Job table operations

use super::*;
use rusqlite::params;
use tracing::debug;

use super::helpers::{JOB_COLUMNS, row_to_job, to_nanos};
use crate::jobs::{Job, JobId};

impl PipelineDatabase {
    /// Insert a new job row; `job.id` is ignored and the assigned id returned
    pub fn insert_job(&self, job: &Job) -> Result<JobId> {
        self.conn.execute(
            "INSERT INTO jobs
             (kind, target_key, state, payload, history, origin_seq, result, failure,
              attempts, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                job.kind.as_str(),
                job.target_key,
                job.state.as_str(),
                serde_json::to_string(&job.payload)?,
                serde_json::to_string(&job.history)?,
                job.origin_event_seq.map(|seq| seq as i64),
                job.result,
                job.failure
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                job.attempts,
                to_nanos(&job.created_at),
                to_nanos(&job.updated_at),
            ],
        )?;

        let id = JobId(self.conn.last_insert_rowid() as u64);
        debug!("Stored job {} ({} {})", id, job.kind, job.target_key);
        Ok(id)
    }

    /// Persist the mutable part of a job (state, history, outcome)
    pub fn update_job(&self, job: &Job) -> Result<()> {
        self.conn.execute(
            "UPDATE jobs
             SET state = ?2, history = ?3, result = ?4, failure = ?5, attempts = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                job.id.0 as i64,
                job.state.as_str(),
                serde_json::to_string(&job.history)?,
                job.result,
                job.failure
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                job.attempts,
                to_nanos(&job.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn delete_job(&self, id: JobId) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id.0 as i64])?;
        Ok(deleted > 0)
    }

    /// Every stored job in id order
    pub fn load_jobs(&self) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id ASC"))?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }
}
