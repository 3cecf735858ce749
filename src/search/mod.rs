//! Secondary index over job metadata
//!
//! The index is an in-memory projection of the job registry, rebuilt from storage on
//! startup. Only [`crate::jobs::JobRegistry`] mutates it, and it does so while holding
//! its own lock, so readers never see a job state the index has not caught up with.

pub mod query;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::jobs::{Job, JobId, JobKind, JobState};

pub use query::{JobCursor, JobQuery, QueryPage};

#[derive(Default)]
struct IndexState {
    jobs: BTreeMap<JobId, Job>,
    by_status: HashMap<(JobKind, JobState), BTreeSet<JobId>>,
    by_target: BTreeMap<String, BTreeSet<JobId>>,
}

impl IndexState {
    fn insert(&mut self, job: Job) {
        self.by_status
            .entry((job.kind, job.state))
            .or_default()
            .insert(job.id);
        self.by_target
            .entry(job.target_key.clone())
            .or_default()
            .insert(job.id);
        self.jobs.insert(job.id, job);
    }

    fn remove(&mut self, id: JobId) -> Option<Job> {
        let job = self.jobs.remove(&id)?;

        if let Some(ids) = self.by_status.get_mut(&(job.kind, job.state)) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_status.remove(&(job.kind, job.state));
            }
        }
        if let Some(ids) = self.by_target.get_mut(&job.target_key) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_target.remove(&job.target_key);
            }
        }
        Some(job)
    }

    /// Ids worth checking for `query`, narrowed by the most selective secondary index
    fn candidates(&self, query: &JobQuery, after: Option<JobId>) -> Vec<JobId> {
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };

        if let Some(prefix) = &query.target_prefix {
            let mut ids = BTreeSet::new();
            for (key, set) in self.by_target.range::<str, _>((
                Bound::Included(prefix.as_str()),
                Bound::Unbounded,
            )) {
                if !key.starts_with(prefix.as_str()) {
                    break;
                }
                ids.extend(set.range((lower, Bound::Unbounded)));
            }
            return ids.into_iter().collect();
        }

        if query.kind.is_some() || query.state.is_some() {
            let mut ids = BTreeSet::new();
            for ((kind, state), set) in &self.by_status {
                if query.kind.is_some_and(|k| k != *kind) {
                    continue;
                }
                if query.state.is_some_and(|s| s != *state) {
                    continue;
                }
                ids.extend(set.range((lower, Bound::Unbounded)));
            }
            return ids.into_iter().collect();
        }

        self.jobs
            .range((lower, Bound::Unbounded))
            .map(|(id, _)| *id)
            .collect()
    }
}

#[derive(Default)]
pub struct SearchIndex {
    state: RwLock<IndexState>,
}

impl SearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(|poisoned| {
            warn!("Search index lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(|poisoned| {
            warn!("Search index lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Replace the whole index with `jobs`
    pub(crate) fn rebuild(&self, jobs: impl IntoIterator<Item = Job>) {
        let mut fresh = IndexState::default();
        for job in jobs {
            fresh.insert(job);
        }
        debug!("Search index rebuilt with {} jobs", fresh.jobs.len());
        *self.write() = fresh;
    }

    pub(crate) fn upsert(&self, job: &Job) {
        let mut state = self.write();
        state.remove(job.id);
        state.insert(job.clone());
    }

    pub(crate) fn remove(&self, id: JobId) {
        self.write().remove(id);
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.read().jobs.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One page of jobs matching `query`, in id order, strictly after `after`
    pub fn query(&self, query: &JobQuery, after: Option<JobCursor>, limit: usize) -> QueryPage {
        let state = self.read();
        let mut jobs = Vec::new();
        let mut has_more = false;

        for id in state.candidates(query, after.map(|cursor| cursor.0)) {
            let Some(job) = state.jobs.get(&id) else {
                continue;
            };
            if !query.matches(job) {
                continue;
            }
            if jobs.len() == limit {
                has_more = true;
                break;
            }
            jobs.push(job.clone());
        }

        let next_cursor = if has_more {
            jobs.last().map(|job| JobCursor(job.id))
        } else {
            None
        };
        QueryPage { jobs, next_cursor }
    }

    /// Lazily walk every matching job, fetching `page_size` at a time
    pub fn iter(&self, query: JobQuery, page_size: usize) -> JobQueryIter<'_> {
        JobQueryIter {
            index: self,
            query,
            page_size: page_size.max(1),
            cursor: None,
            buffer: Vec::new().into_iter(),
            done: false,
        }
    }
}

pub struct JobQueryIter<'a> {
    index: &'a SearchIndex,
    query: JobQuery,
    page_size: usize,
    cursor: Option<JobCursor>,
    buffer: std::vec::IntoIter<Job>,
    done: bool,
}

impl JobQueryIter<'_> {
    /// Cursor to resume this iteration later from the last fetched page
    pub fn cursor(&self) -> Option<JobCursor> {
        self.cursor
    }
}

impl Iterator for JobQueryIter<'_> {
    type Item = Job;

    fn next(&mut self) -> Option<Job> {
        if let Some(job) = self.buffer.next() {
            return Some(job);
        }
        if self.done {
            return None;
        }

        let page = self.index.query(&self.query, self.cursor, self.page_size);
        match page.next_cursor {
            Some(cursor) => self.cursor = Some(cursor),
            None => self.done = true,
        }
        self.buffer = page.jobs.into_iter();
        self.buffer.next()
    }
}
