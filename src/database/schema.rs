// Database schema initialization and table creation

use super::*;
use tracing::debug;

impl PipelineDatabase {
    /// Create every table the pipeline needs
    pub(super) fn initialize_schema(&mut self) -> Result<()> {
        debug!("Creating database schema");

        self.create_watch_paths_table()?;
        self.create_events_table()?;
        self.create_jobs_table()?;
        self.create_dispatch_cursors_table()?;

        debug!("Database schema created successfully");
        Ok(())
    }

    fn create_watch_paths_table(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS watch_paths (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                recursive INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                removed_at INTEGER
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_watch_paths_active ON watch_paths(active, path)",
            [],
        )?;

        debug!("Created watch_paths table and indexes");
        Ok(())
    }

    /// Append-only log; `seq` is the primary ordering key
    fn create_events_table(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY,
                recorded_at INTEGER NOT NULL,
                watch_path_id TEXT NOT NULL,
                path TEXT NOT NULL,
                kind TEXT NOT NULL CHECK(kind IN ('created', 'modified', 'removed', 'renamed')),
                renamed_from TEXT,
                fingerprint TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_path ON events(path, seq)",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_watch_path ON events(watch_path_id, seq)",
            [],
        )?;

        debug!("Created events table and indexes");
        Ok(())
    }

    pub(super) fn create_jobs_table(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL CHECK(kind IN ('index', 'ingest')),
                target_key TEXT NOT NULL,
                state TEXT NOT NULL CHECK(state IN ('pending', 'running', 'succeeded', 'failed')),
                payload TEXT NOT NULL,
                history TEXT NOT NULL,
                origin_seq INTEGER,
                result TEXT,
                failure TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_target ON jobs(kind, target_key)",
            [],
        )?;

        debug!("Created jobs table and indexes");
        Ok(())
    }

    fn create_dispatch_cursors_table(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS dispatch_cursors (
                lane TEXT PRIMARY KEY,
                last_seq INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }
}
