//! finspect database module - SQLite source of truth
//!
//! One table per entity (events, jobs, watch paths, dispatcher cursors). Every write
//! commits before the call returns; the in-memory structures elsewhere in the crate are
//! rebuilt from these tables on startup.

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use crate::error::Result;

mod cursors;
mod events;
mod helpers;
mod jobs;
mod migrations;
mod schema;
mod watch_paths;

pub use migrations::LATEST_SCHEMA_VERSION;

/// Database handle shared by the event store, job registry, watcher and dispatcher
pub type SharedDatabase = Arc<Mutex<PipelineDatabase>>;

pub struct PipelineDatabase {
    pub(crate) conn: Connection,
    pub(crate) file_path: PathBuf,
}

impl PipelineDatabase {
    /// Open (or create) the database file and bring the schema up to date
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let file_path = db_path.as_ref().to_path_buf();
        info!("Opening finspect database at: {}", file_path.display());

        if let Some(parent) = file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&file_path)?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;

        // Appends must be on disk before we acknowledge them
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        // 2 = FULL
        conn.pragma_update(None, "synchronous", 2)?;

        let mut db = Self { conn, file_path };
        db.run_migrations()?;
        db.initialize_schema()?;

        info!("Database initialized successfully");
        Ok(db)
    }

    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }
}

/// Lock the shared database, recovering from a poisoned mutex
pub(crate) fn lock(db: &SharedDatabase) -> MutexGuard<'_, PipelineDatabase> {
    match db.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Database mutex poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
