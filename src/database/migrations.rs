// Schema migration system for database versioning

use super::*;
use rusqlite::params;
use tracing::{debug, info};

use crate::error::CoreError;

/// Current schema version - increment when adding migrations
pub const LATEST_SCHEMA_VERSION: i32 = 2;

impl PipelineDatabase {
    /// Run all pending schema migrations
    pub(super) fn run_migrations(&mut self) -> Result<()> {
        self.create_schema_version_table()?;

        let current_version = self.get_schema_version()?;
        if current_version >= LATEST_SCHEMA_VERSION {
            debug!(
                "Database schema is up-to-date at version {}",
                current_version
            );
            return Ok(());
        }

        info!(
            "Running schema migrations: version {} -> {}",
            current_version, LATEST_SCHEMA_VERSION
        );

        for version in (current_version + 1)..=LATEST_SCHEMA_VERSION {
            self.apply_migration(version)?;
            self.record_migration(version)?;
            info!("Migration to version {} completed", version);
        }

        Ok(())
    }

    fn create_schema_version_table(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL,
                description TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    pub fn get_schema_version(&self) -> Result<i32> {
        let version: i32 = self.conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    fn apply_migration(&mut self, version: i32) -> Result<()> {
        match version {
            1 => self.migration_001_initial_schema(),
            2 => self.migration_002_in_flight_index(),
            _ => Err(CoreError::InvalidInput(format!(
                "Unknown migration version: {}",
                version
            ))),
        }
    }

    fn record_migration(&self, version: i32) -> Result<()> {
        let description = match version {
            1 => "Initial schema",
            2 => "Unique in-flight job per (kind, target_key)",
            _ => "Unknown migration",
        };

        self.conn.execute(
            "INSERT OR REPLACE INTO schema_version (version, applied_at, description)
             VALUES (?1, ?2, ?3)",
            params![version, chrono::Utc::now().timestamp(), description],
        )?;
        Ok(())
    }

    /// Migration 001: tables are created by initialize_schema, this only records the version
    fn migration_001_initial_schema(&self) -> Result<()> {
        Ok(())
    }

    /// Migration 002: durable backstop for the at-most-one-in-flight rule
    fn migration_002_in_flight_index(&self) -> Result<()> {
        self.create_jobs_table()?;
        self.conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_in_flight
             ON jobs(kind, target_key) WHERE state IN ('pending', 'running')",
            [],
        )?;
        Ok(())
    }
}
