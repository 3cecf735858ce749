//! Dispatcher: turns recorded events into jobs and runs them
//!
//! # Architecture
//!
//! - A router forwards every event published by the watcher to one lane per job kind.
//! - Each lane derives its jobs in sequence order. Its progress is a durable cursor, so
//!   on start it first replays the event log from the cursor and then follows the live
//!   queue, skipping anything already derived. The queue only accelerates; the log is
//!   the record.
//! - A scheduler task runs jobs. A semaphore shared by all lanes bounds how many job
//!   bodies execute at once, and each body is bounded by the job timeout.
//!
//! A create that conflicts with an in-flight job is not an error. If that job is still
//! pending it will read the newest file state when it runs; if it is already running,
//! the target is marked dirty and one follow-up job is created when it finishes.

pub mod mapping;
pub mod worker;

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::database::{self, SharedDatabase};
use crate::error::{CoreError, Result};
use crate::events::{ChangeEvent, EventStore};
use crate::jobs::{Job, JobFailure, JobId, JobKind, JobRegistry, JobState, NewJob, RetryPolicy};

pub use mapping::{EventJobMapping, new_job_for};
pub use worker::{JobWorker, Workers};

/// Pause before a lane retries an event after a storage failure
const STORAGE_RETRY_DELAY: Duration = Duration::from_secs(1);

struct DispatchInner {
    db: SharedDatabase,
    events: Arc<EventStore>,
    registry: Arc<JobRegistry>,
    workers: Workers,
    mapping: EventJobMapping,
    retry: RetryPolicy,
    job_timeout: Duration,
    slots: Arc<Semaphore>,
    /// Newest event seen per target while a job for it was already running
    dirty: Mutex<HashMap<(JobKind, String), u64>>,
    schedule_tx: mpsc::UnboundedSender<JobId>,
    shutdown: watch::Sender<bool>,
}

pub struct Dispatcher {
    inner: Arc<DispatchInner>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<ChangeEvent>>>,
    schedule_rx: Mutex<Option<mpsc::UnboundedReceiver<JobId>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("{} mutex poisoned, recovering", what);
        poisoned.into_inner()
    })
}

impl Dispatcher {
    pub fn new(
        config: &DispatcherConfig,
        db: SharedDatabase,
        events: Arc<EventStore>,
        registry: Arc<JobRegistry>,
        workers: Workers,
        inbound: mpsc::UnboundedReceiver<ChangeEvent>,
    ) -> Self {
        let (schedule_tx, schedule_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let worker_slots = config.worker_slots.max(1);

        debug!(
            "Dispatcher configured with {} worker slots, {:?} job timeout, {:?}",
            worker_slots, config.job_timeout(), workers
        );
        Self {
            inner: Arc::new(DispatchInner {
                db,
                events,
                registry,
                workers,
                mapping: config.mapping.clone(),
                retry: config.retry,
                job_timeout: config.job_timeout(),
                slots: Arc::new(Semaphore::new(worker_slots)),
                dirty: Mutex::new(HashMap::new()),
                schedule_tx,
                shutdown,
            }),
            inbound: Mutex::new(Some(inbound)),
            schedule_rx: Mutex::new(Some(schedule_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Recover jobs left over by a previous process, then spawn the router, one lane per
    /// job kind and the scheduler
    pub fn start(&self) -> Result<()> {
        let inbound = lock_or_recover(&self.inbound, "Dispatcher inbound").take();
        let schedule_rx = lock_or_recover(&self.schedule_rx, "Dispatcher schedule").take();
        let (Some(mut inbound), Some(schedule_rx)) = (inbound, schedule_rx) else {
            debug!("Dispatcher already started");
            return Ok(());
        };

        self.recover()?;

        let mut tasks = lock_or_recover(&self.tasks, "Dispatcher tasks");
        let mut lanes = Vec::new();
        for kind in JobKind::ALL {
            let (lane_tx, lane_rx) = mpsc::unbounded_channel();
            lanes.push(lane_tx);
            tasks.push(tokio::spawn(run_lane(self.inner.clone(), kind, lane_rx)));
        }

        let mut shutdown = self.inner.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = inbound.recv() => match received {
                        Some(event) => {
                            for lane in &lanes {
                                let _ = lane.send(event.clone());
                            }
                        }
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Dispatcher router stopped");
        }));

        tasks.push(tokio::spawn(run_scheduler(self.inner.clone(), schedule_rx)));

        info!("🚀 Dispatcher started with {} lanes", JobKind::ALL.len());
        Ok(())
    }

    /// Fail jobs interrupted by a previous shutdown and queue the pending ones
    fn recover(&self) -> Result<()> {
        for kind in JobKind::ALL {
            for job in self.inner.registry.jobs_in_state(kind, JobState::Running) {
                warn!("Job {} was running when the process stopped", job.id);
                self.inner.registry.fail(job.id, JobFailure::Interrupted)?;
            }
            for job in self.inner.registry.jobs_in_state(kind, JobState::Pending) {
                self.schedule(job.id);
            }
        }
        Ok(())
    }

    /// Queue a pending job for execution
    pub fn schedule(&self, id: JobId) {
        self.inner.schedule(id);
    }

    /// Create a job, swallowing conflicts with an in-flight job for the same target
    pub fn submit(&self, new: NewJob) -> Result<Option<Job>> {
        self.inner.submit(new)
    }

    /// Last event sequence number a lane has derived jobs for
    pub fn cursor(&self, kind: JobKind) -> Result<u64> {
        database::lock(&self.inner.db).get_dispatch_cursor(kind.as_str())
    }

    /// Stop consuming events, let running jobs finish and leave queued ones pending
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.slots.close();

        let tasks: Vec<JoinHandle<()>> = lock_or_recover(&self.tasks, "Dispatcher tasks")
            .drain(..)
            .collect();
        for joined in join_all(tasks).await {
            if let Err(e) = joined {
                error!("Dispatcher task panicked: {}", e);
            }
        }
        info!("Dispatcher shut down");
    }
}

impl DispatchInner {
    fn schedule(&self, id: JobId) {
        if self.schedule_tx.send(id).is_err() {
            warn!("Scheduler stopped, job {} stays pending", id);
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn lock_dirty(&self) -> MutexGuard<'_, HashMap<(JobKind, String), u64>> {
        lock_or_recover(&self.dirty, "Dispatcher dirty set")
    }

    fn submit(&self, new: NewJob) -> Result<Option<Job>> {
        let kind = new.kind();
        let target_key = new.target_key.clone();
        let origin = new.origin_event_seq;

        loop {
            let existing = match self.registry.create_job(new.clone()) {
                Ok(job) => {
                    self.schedule(job.id);
                    return Ok(Some(job));
                }
                Err(CoreError::Conflict { existing }) => existing,
                Err(e) => return Err(e),
            };

            let state = self.registry.get(existing).ok().map(|job| job.state);
            match state {
                // Not started yet, it will read the newest state when it runs
                Some(JobState::Pending) => {
                    debug!(
                        "{} job {} already pending for {}",
                        kind, existing, target_key
                    );
                    return Ok(None);
                }
                Some(JobState::Running) => {
                    debug!(
                        "{} job {} already running for {}",
                        kind, existing, target_key
                    );
                    if let Some(seq) = origin {
                        self.lock_dirty()
                            .entry((kind, target_key.clone()))
                            .and_modify(|newest| *newest = (*newest).max(seq))
                            .or_insert(seq);
                        // It may have finished before the mark landed
                        if self.registry.in_flight(kind, &target_key) != Some(existing) {
                            self.follow_up(kind, &target_key);
                        }
                    }
                    return Ok(None);
                }
                // Finished between the conflict and the lookup
                _ => {
                    debug!(
                        "{} job {} for {} finished before the conflict was handled, retrying",
                        kind, existing, target_key
                    );
                }
            }
        }
    }

    /// Create the follow-up job for a target marked dirty while its job was running
    fn follow_up(&self, kind: JobKind, target_key: &str) {
        let Some(seq) = self.lock_dirty().remove(&(kind, target_key.to_string())) else {
            return;
        };
        let event = match self.events.read(seq) {
            Ok(event) => event,
            Err(e) => {
                error!("Cannot re-enqueue {} for event #{}: {}", target_key, seq, e);
                return;
            }
        };

        match self.submit(new_job_for(kind, &event)) {
            Ok(Some(job)) => info!("Re-enqueued {} job {} for {}", kind, job.id, target_key),
            Ok(None) => {}
            Err(e) => error!("Failed to re-enqueue {} job for {}: {}", kind, target_key, e),
        }
    }

    /// Derive and submit the jobs one event means for `lane`, then advance its cursor
    fn derive(&self, lane: JobKind, event: &ChangeEvent) -> Result<()> {
        for new in self.mapping.derive(lane, event) {
            match self.submit(new) {
                Ok(Some(job)) => debug!("Event #{} derived {} job {}", event.seq, lane, job.id),
                Ok(None) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Event #{} derived no {} job: {}", event.seq, lane, e),
            }
        }
        database::lock(&self.db).set_dispatch_cursor(lane.as_str(), event.seq)
    }

    /// Derive one event, retrying through storage failures until shutdown.
    ///
    /// Returns false when shutdown interrupted the retries.
    async fn derive_until_done(
        &self,
        lane: JobKind,
        event: &ChangeEvent,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            match self.derive(lane, event) {
                Ok(()) => return true,
                Err(e) => {
                    error!("{} lane failed on event #{}: {}", lane, event.seq, e);
                    tokio::select! {
                        _ = tokio::time::sleep(STORAGE_RETRY_DELAY) => {}
                        _ = shutdown.changed() => return false,
                    }
                }
            }
        }
    }

    /// Replay the log for `lane` from `cursor + 1` through `to`. Returns the new cursor.
    async fn catch_up(
        &self,
        lane: JobKind,
        mut cursor: u64,
        to: u64,
        shutdown: &mut watch::Receiver<bool>,
    ) -> u64 {
        let mut replayed = 0usize;
        for result in self.events.scan(cursor + 1, to, usize::MAX) {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    error!("{} lane catch-up stopped at #{}: {}", lane, cursor, e);
                    break;
                }
            };
            if !self.derive_until_done(lane, &event, shutdown).await {
                break;
            }
            cursor = event.seq;
            replayed += 1;
        }
        if replayed > 0 {
            info!("{} lane replayed {} events up to #{}", lane, replayed, cursor);
        }
        cursor
    }

    /// Run one job to a terminal state. `None` when it could not be started.
    async fn execute(&self, id: JobId) -> Option<Job> {
        let Ok(_permit) = self.slots.clone().acquire_owned().await else {
            debug!("Worker slots closed, job {} stays pending", id);
            return None;
        };

        let job = match self.registry.start(id) {
            Ok(job) => job,
            Err(e) => {
                debug!("Job {} not started: {}", id, e);
                return None;
            }
        };

        let outcome = match self.workers.get(job.kind) {
            None => Err(JobFailure::Worker {
                message: format!("no worker registered for {} jobs", job.kind),
            }),
            Some(worker) => match tokio::time::timeout(self.job_timeout, worker.run(&job)).await {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(JobFailure::Worker {
                    message: format!("{e:#}"),
                }),
                Err(_) => Err(JobFailure::TimeoutExceeded {
                    timeout_ms: self.job_timeout.as_millis() as u64,
                }),
            },
        };

        let finished = match outcome {
            Ok(output) => self.registry.succeed(id, output),
            Err(failure) => {
                warn!("{} job {} failed: {}", job.kind, id, failure);
                self.registry.fail(id, failure)
            }
        };
        match finished {
            Ok(job) => Some(job),
            Err(e) => {
                error!("Failed to record outcome of job {}: {}", id, e);
                None
            }
        }
    }
}

async fn run_job(inner: Arc<DispatchInner>, id: JobId) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        let Some(job) = inner.execute(id).await else {
            return;
        };

        let retry = job.state == JobState::Failed
            && inner.retry.allows(job.attempts)
            && !inner.is_shutting_down();
        if retry {
            tokio::select! {
                _ = tokio::time::sleep(inner.retry.backoff()) => {}
                _ = shutdown.changed() => return,
            }
            match inner.registry.retry(id, &inner.retry) {
                Ok(_) => continue,
                Err(e) => debug!("Automatic retry of job {} skipped: {}", id, e),
            }
        }

        inner.follow_up(job.kind, &job.target_key);
        return;
    }
}

async fn run_scheduler(inner: Arc<DispatchInner>, mut schedule_rx: mpsc::UnboundedReceiver<JobId>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            Some(id) = schedule_rx.recv() => {
                running.spawn(run_job(inner.clone(), id));
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = joined {
                    error!("Job task panicked: {}", e);
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    if !running.is_empty() {
        info!("Waiting for {} job tasks to finish", running.len());
    }
    while let Some(joined) = running.join_next().await {
        if let Err(e) = joined {
            error!("Job task panicked: {}", e);
        }
    }
    debug!("Dispatcher scheduler stopped");
}

async fn run_lane(
    inner: Arc<DispatchInner>,
    lane: JobKind,
    mut events: mpsc::UnboundedReceiver<ChangeEvent>,
) {
    let mut shutdown = inner.shutdown.subscribe();
    let loaded = database::lock(&inner.db).get_dispatch_cursor(lane.as_str());
    let mut cursor = match loaded {
        Ok(cursor) => cursor,
        Err(e) => {
            error!("{} lane cannot load its cursor: {}", lane, e);
            return;
        }
    };
    cursor = inner.catch_up(lane, cursor, u64::MAX, &mut shutdown).await;
    debug!("{} lane following live events after #{}", lane, cursor);

    loop {
        let event = tokio::select! {
            received = events.recv() => match received {
                Some(event) => event,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        if event.seq <= cursor {
            continue;
        }
        if event.seq > cursor + 1 {
            cursor = inner
                .catch_up(lane, cursor, event.seq - 1, &mut shutdown)
                .await;
        }
        if !inner.derive_until_done(lane, &event, &mut shutdown).await {
            break;
        }
        cursor = event.seq;
    }
    debug!("{} lane stopped at #{}", lane, cursor);
}
