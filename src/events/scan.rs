use std::collections::VecDeque;

use crate::database::{self, SharedDatabase};
use crate::error::Result;
use crate::events::ChangeEvent;

/// Lazy, finite iterator over a sequence range of the event log.
///
/// Pages are fetched from the database only when the buffer runs dry, so the lock is
/// never held between `next` calls.
pub struct EventScan {
    db: SharedDatabase,
    next_from: u64,
    to: u64,
    remaining: usize,
    page_size: usize,
    buffer: VecDeque<ChangeEvent>,
    last_seen: Option<u64>,
    exhausted: bool,
}

impl EventScan {
    pub(crate) fn new(
        db: SharedDatabase,
        from: u64,
        to: u64,
        limit: usize,
        page_size: usize,
    ) -> Self {
        Self {
            db,
            next_from: from,
            to,
            remaining: limit,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            last_seen: None,
            exhausted: from > to || limit == 0,
        }
    }

    /// Sequence number of the last event yielded
    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }

    fn fill(&mut self) -> Result<()> {
        let want = self.page_size.min(self.remaining);
        let page = database::lock(&self.db).scan_events(self.next_from, self.to, want)?;

        if page.len() < want {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            if last.seq >= self.to {
                self.exhausted = true;
            } else {
                self.next_from = last.seq + 1;
            }
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for EventScan {
    type Item = Result<ChangeEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        if self.buffer.is_empty() {
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }

        let event = self.buffer.pop_front()?;
        self.remaining -= 1;
        self.last_seen = Some(event.seq);
        Some(Ok(event))
    }
}
