//! Job registry
//!
//! The registry is the admission-control point for work: at most one job per
//! (kind, target key) may be non-terminal at any instant. The conflict check, the durable
//! write and the search index update all happen under one lock, so a caller that observes
//! a state change through `get` also observes it through the search index.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::database::{self, SharedDatabase};
use crate::error::{CoreError, Result};
use crate::search::SearchIndex;

use super::types::{
    Job, JobFailure, JobId, JobKind, JobPayload, JobResult, JobState, NewJob, RetryPolicy,
    StateChange,
};

#[derive(Default)]
struct RegistryState {
    jobs: HashMap<JobId, Job>,
    /// The single non-terminal job per (kind, target key)
    in_flight: HashMap<(JobKind, String), JobId>,
}

pub struct JobRegistry {
    db: SharedDatabase,
    search: Arc<SearchIndex>,
    state: Mutex<RegistryState>,
}

impl JobRegistry {
    /// Load every stored job and rebuild the search index from them
    pub fn open(db: SharedDatabase, search: Arc<SearchIndex>) -> Result<Self> {
        let jobs = database::lock(&db).load_jobs()?;

        let mut state = RegistryState::default();
        for job in &jobs {
            if job.is_active() {
                let key = (job.kind, job.target_key.clone());
                if let Some(previous) = state.in_flight.insert(key, job.id) {
                    warn!(
                        "Jobs {} and {} are both in flight for {} {}",
                        previous, job.id, job.kind, job.target_key
                    );
                }
            }
            state.jobs.insert(job.id, job.clone());
        }
        search.rebuild(jobs);

        info!(
            "Job registry loaded {} jobs ({} in flight)",
            state.jobs.len(),
            state.in_flight.len()
        );
        Ok(Self {
            db,
            search,
            state: Mutex::new(state),
        })
    }

    pub fn search(&self) -> &Arc<SearchIndex> {
        &self.search
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Job registry mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Create a job with the default payload for its kind
    pub fn create(
        &self,
        kind: JobKind,
        target_key: impl Into<String>,
        origin_event_seq: Option<u64>,
    ) -> Result<Job> {
        let target_key = target_key.into();
        let payload = JobPayload::for_target(kind, &target_key);
        self.create_job(NewJob {
            target_key,
            payload,
            origin_event_seq,
        })
    }

    /// Create a job, failing with `Conflict` when one is already in flight for the target
    pub fn create_job(&self, new: NewJob) -> Result<Job> {
        if new.target_key.trim().is_empty() {
            return Err(CoreError::InvalidInput(
                "job target key must not be empty".to_string(),
            ));
        }

        let kind = new.kind();
        let mut state = self.lock_state();

        let key = (kind, new.target_key.clone());
        if let Some(existing) = state.in_flight.get(&key) {
            debug!(
                "Rejecting {} job for {}: job {} in flight",
                kind, new.target_key, existing
            );
            return Err(CoreError::Conflict {
                existing: *existing,
            });
        }

        let now = Utc::now();
        let mut job = Job {
            id: JobId(0),
            kind,
            target_key: new.target_key,
            state: JobState::Pending,
            payload: new.payload,
            history: vec![StateChange {
                from: None,
                to: JobState::Pending,
                at: now,
            }],
            origin_event_seq: new.origin_event_seq,
            result: None,
            failure: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        };
        job.id = database::lock(&self.db).insert_job(&job)?;

        state.in_flight.insert(key, job.id);
        state.jobs.insert(job.id, job.clone());
        self.search.upsert(&job);

        info!("Created {} job {} for {}", job.kind, job.id, job.target_key);
        Ok(job)
    }

    /// Move a job along the state machine, recording an optional outcome
    pub fn transition(
        &self,
        id: JobId,
        next: JobState,
        result: Option<JobResult>,
    ) -> Result<Job> {
        let mut state = self.lock_state();
        let current = state
            .jobs
            .get(&id)
            .ok_or_else(|| CoreError::not_found("job", id))?;

        if !current.state.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                job: id,
                from: current.state,
                to: next,
            });
        }
        if matches!(result, Some(JobResult::Failure(_))) && next != JobState::Failed {
            return Err(CoreError::InvalidInput(format!(
                "a failure can only be recorded on a transition to failed, not {next}"
            )));
        }

        let mut updated = current.clone();
        let previous = updated.state;
        let now = Utc::now();
        updated.history.push(StateChange {
            from: Some(previous),
            to: next,
            at: now,
        });
        updated.state = next;
        updated.updated_at = now;
        match result {
            Some(JobResult::Output(output)) => updated.result = Some(output),
            Some(JobResult::Failure(failure)) => updated.failure = Some(failure),
            None => {}
        }

        database::lock(&self.db).update_job(&updated)?;

        if next.is_terminal() {
            state
                .in_flight
                .remove(&(updated.kind, updated.target_key.clone()));
        }
        state.jobs.insert(id, updated.clone());
        self.search.upsert(&updated);

        debug!("Job {} {} -> {}", id, previous, next);
        Ok(updated)
    }

    pub fn start(&self, id: JobId) -> Result<Job> {
        self.transition(id, JobState::Running, None)
    }

    pub fn succeed(&self, id: JobId, output: impl Into<String>) -> Result<Job> {
        self.transition(
            id,
            JobState::Succeeded,
            Some(JobResult::Output(output.into())),
        )
    }

    pub fn fail(&self, id: JobId, failure: JobFailure) -> Result<Job> {
        self.transition(id, JobState::Failed, Some(JobResult::Failure(failure)))
    }

    /// Explicit retry: the only way from `Failed` back to `Pending`
    pub fn retry(&self, id: JobId, policy: &RetryPolicy) -> Result<Job> {
        let mut state = self.lock_state();
        let current = state
            .jobs
            .get(&id)
            .ok_or_else(|| CoreError::not_found("job", id))?;

        if current.state != JobState::Failed {
            return Err(CoreError::InvalidTransition {
                job: id,
                from: current.state,
                to: JobState::Pending,
            });
        }
        if !policy.allows(current.attempts) {
            return Err(CoreError::RetryLimitExceeded {
                job: id,
                max_retries: policy.max_retries,
            });
        }

        // The failure released the slot; someone may have claimed it since
        let key = (current.kind, current.target_key.clone());
        if let Some(existing) = state.in_flight.get(&key) {
            return Err(CoreError::Conflict {
                existing: *existing,
            });
        }

        let mut updated = current.clone();
        let now = Utc::now();
        updated.history.push(StateChange {
            from: Some(JobState::Failed),
            to: JobState::Pending,
            at: now,
        });
        updated.state = JobState::Pending;
        updated.attempts += 1;
        updated.result = None;
        updated.failure = None;
        updated.updated_at = now;

        database::lock(&self.db).update_job(&updated)?;

        state.in_flight.insert(key, id);
        state.jobs.insert(id, updated.clone());
        self.search.upsert(&updated);

        info!("Retrying job {} (attempt {})", id, updated.attempts);
        Ok(updated)
    }

    pub fn get(&self, id: JobId) -> Result<Job> {
        self.lock_state()
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("job", id))
    }

    /// Delete a terminal job; active jobs are rejected with `StillActive`
    pub fn delete(&self, id: JobId) -> Result<Job> {
        let mut state = self.lock_state();
        let job = state
            .jobs
            .get(&id)
            .ok_or_else(|| CoreError::not_found("job", id))?;
        if job.is_active() {
            return Err(CoreError::StillActive(id));
        }

        database::lock(&self.db).delete_job(id)?;
        let removed = state.jobs.remove(&id);
        self.search.remove(id);

        info!("Deleted job {}", id);
        removed.ok_or_else(|| CoreError::not_found("job", id))
    }

    /// The in-flight job for a target, if any
    pub fn in_flight(&self, kind: JobKind, target_key: &str) -> Option<JobId> {
        self.lock_state()
            .in_flight
            .get(&(kind, target_key.to_string()))
            .copied()
    }

    /// Jobs of one kind in one state, in id order
    pub fn jobs_in_state(&self, kind: JobKind, job_state: JobState) -> Vec<Job> {
        let state = self.lock_state();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.kind == kind && job.state == job_state)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    pub fn list_active(&self) -> Vec<Job> {
        let state = self.lock_state();
        let mut jobs: Vec<Job> = state
            .in_flight
            .values()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }

    /// Number of jobs per (kind, state)
    pub fn counts(&self) -> BTreeMap<(JobKind, JobState), usize> {
        let mut counts = BTreeMap::new();
        for job in self.lock_state().jobs.values() {
            *counts.entry((job.kind, job.state)).or_insert(0) += 1;
        }
        counts
    }
}
