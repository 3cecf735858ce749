//! Durable, append-only event log
//!
//! Every change the watcher accepts is written here before anyone else hears about it.
//! Sequence numbers are assigned under the database lock, so appends are serialized and
//! the numbers are strictly increasing without gaps.

mod scan;
pub mod types;

use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info};

use crate::database::{self, SharedDatabase};
use crate::error::{CoreError, Result};

pub use scan::EventScan;
pub use types::{ChangeEvent, ChangeKind, EventFilter, Fingerprint, NewChangeEvent};

/// Rows fetched per page by [`EventScan`]
pub const SCAN_PAGE_SIZE: usize = 256;

pub struct EventStore {
    db: SharedDatabase,
    last_seq: AtomicU64,
}

impl EventStore {
    /// Open the store and recover the highest committed sequence number
    pub fn open(db: SharedDatabase) -> Result<Self> {
        let highest = database::lock(&db).max_event_seq()?;
        info!("Event store opened, highest committed seq = {}", highest);
        Ok(Self {
            db,
            last_seq: AtomicU64::new(highest),
        })
    }

    /// Highest sequence number durably committed
    pub fn highest_seq(&self) -> u64 {
        self.last_seq.load(Ordering::SeqCst)
    }

    /// Durably append an event and return it with its assigned sequence number
    pub fn append(&self, event: NewChangeEvent) -> Result<ChangeEvent> {
        let db = database::lock(&self.db);

        let seq = self.last_seq.load(Ordering::SeqCst) + 1;
        let recorded_at = Utc::now();
        if let Err(e) = db.insert_event(seq, &recorded_at, &event) {
            error!(
                "Failed to append event for {}: {}",
                event.path.display(),
                e
            );
            return Err(e);
        }
        self.last_seq.store(seq, Ordering::SeqCst);
        drop(db);

        debug!("Appended event #{} {} {}", seq, event.kind, event.path.display());
        Ok(ChangeEvent {
            seq,
            recorded_at,
            watch_path_id: event.watch_path_id,
            path: event.path,
            kind: event.kind,
            renamed_from: event.renamed_from,
            fingerprint: event.fingerprint,
        })
    }

    pub fn read(&self, seq: u64) -> Result<ChangeEvent> {
        database::lock(&self.db)
            .get_event(seq)?
            .ok_or_else(|| CoreError::not_found("event", seq))
    }

    /// Lazily iterate events with `from_seq <= seq <= to_seq`, at most `limit` of them.
    ///
    /// Restart a scan by passing the last seen sequence number + 1 as the new `from_seq`.
    pub fn scan(&self, from_seq: u64, to_seq: u64, limit: usize) -> EventScan {
        EventScan::new(self.db.clone(), from_seq, to_seq, limit, SCAN_PAGE_SIZE)
    }

    /// Most recent event recorded for a file, if any
    pub fn last_for_path(&self, path: &Path) -> Result<Option<ChangeEvent>> {
        database::lock(&self.db).last_event_for_path(path)
    }

    /// Filter events by metadata, ordered by sequence, strictly after `after_seq`
    pub fn search(
        &self,
        filter: &EventFilter,
        after_seq: u64,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>> {
        database::lock(&self.db).search_events(filter, after_seq, limit)
    }
}
