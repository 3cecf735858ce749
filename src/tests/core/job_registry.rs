use crate::database::SharedDatabase;
use crate::error::CoreError;
use crate::jobs::{
    JobFailure, JobId, JobKind, JobPayload, JobRegistry, JobResult, JobState, NewJob, RetryPolicy,
};
use crate::search::{JobQuery, SearchIndex};
use crate::tests::helpers::{open_test_db, unique_temp_dir};
use futures::future::join_all;
use std::sync::Arc;
use tempfile::TempDir;

fn open_registry(db: &SharedDatabase) -> JobRegistry {
    JobRegistry::open(db.clone(), Arc::new(SearchIndex::new())).unwrap()
}

fn setup(name: &str) -> (TempDir, SharedDatabase, JobRegistry) {
    let temp_dir = unique_temp_dir(name);
    let db = open_test_db(temp_dir.path());
    let registry = open_registry(&db);
    (temp_dir, db, registry)
}

fn retries(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff_ms: 0,
    }
}

#[test]
fn test_create_starts_pending() {
    let (_dir, _db, registry) = setup("registry_create");

    let job = registry.create(JobKind::Index, "/data/a.txt", Some(4)).unwrap();

    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.kind, JobKind::Index);
    assert_eq!(job.origin_event_seq, Some(4));
    assert_eq!(job.history.len(), 1);
    assert_eq!(job.history[0].from, None);
    assert_eq!(
        job.payload,
        JobPayload::Index {
            source_path: "/data/a.txt".into()
        }
    );
    assert_eq!(registry.get(job.id).unwrap(), job);
    assert_eq!(registry.search().get(job.id).unwrap(), job);
}

#[test]
fn test_conflict_returns_existing_job() {
    let (_dir, _db, registry) = setup("registry_conflict");

    let first = registry.create(JobKind::Index, "/data/a.txt", None).unwrap();
    let err = registry
        .create(JobKind::Index, "/data/a.txt", Some(9))
        .unwrap_err();
    assert!(matches!(err, CoreError::Conflict { existing } if existing == first.id));

    // Same target, other kind: a separate slot
    registry.create(JobKind::Ingest, "/data/a.txt", None).unwrap();

    // Conflict also while running
    registry.start(first.id).unwrap();
    assert!(matches!(
        registry.create(JobKind::Index, "/data/a.txt", None),
        Err(CoreError::Conflict { existing }) if existing == first.id
    ));

    // A terminal job frees the slot
    registry.succeed(first.id, "ok").unwrap();
    let second = registry.create(JobKind::Index, "/data/a.txt", None).unwrap();
    assert!(second.id > first.id);
}

#[test]
fn test_empty_target_rejected() {
    let (_dir, _db, registry) = setup("registry_empty_key");
    assert!(matches!(
        registry.create(JobKind::Index, "  ", None),
        Err(CoreError::InvalidInput(_))
    ));
}

#[test]
fn test_lifecycle_and_invalid_transitions() {
    let (_dir, _db, registry) = setup("registry_lifecycle");
    let job = registry.create(JobKind::Index, "/data/a.txt", None).unwrap();

    let err = registry
        .transition(job.id, JobState::Succeeded, None)
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::InvalidTransition {
            from: JobState::Pending,
            to: JobState::Succeeded,
            ..
        }
    ));

    let running = registry.start(job.id).unwrap();
    assert_eq!(running.state, JobState::Running);
    assert!(matches!(
        registry.transition(job.id, JobState::Pending, None),
        Err(CoreError::InvalidTransition { .. })
    ));

    let done = registry.succeed(job.id, "indexed 3 bytes").unwrap();
    assert_eq!(done.state, JobState::Succeeded);
    assert_eq!(done.result.as_deref(), Some("indexed 3 bytes"));
    let states: Vec<JobState> = done.history.iter().map(|c| c.to).collect();
    assert_eq!(
        states,
        vec![JobState::Pending, JobState::Running, JobState::Succeeded]
    );

    // Terminal means terminal
    assert!(matches!(
        registry.start(job.id),
        Err(CoreError::InvalidTransition { .. })
    ));
    assert!(matches!(
        registry.start(JobId(999)),
        Err(CoreError::NotFound { .. })
    ));
}

#[test]
fn test_failure_only_on_failed_transition() {
    let (_dir, _db, registry) = setup("registry_failure");
    let job = registry.create(JobKind::Ingest, "s3://bucket/key", None).unwrap();
    registry.start(job.id).unwrap();

    let err = registry
        .transition(
            job.id,
            JobState::Succeeded,
            Some(JobResult::Failure(JobFailure::Interrupted)),
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidInput(_)));

    let failed = registry
        .fail(job.id, JobFailure::TimeoutExceeded { timeout_ms: 100 })
        .unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(
        failed.failure,
        Some(JobFailure::TimeoutExceeded { timeout_ms: 100 })
    );
    assert_eq!(registry.in_flight(JobKind::Ingest, "s3://bucket/key"), None);
}

#[test]
fn test_retry_is_bounded() {
    let (_dir, _db, registry) = setup("registry_retry");
    let job = registry.create(JobKind::Index, "/data/a.txt", None).unwrap();

    assert!(matches!(
        registry.retry(job.id, &retries(1)),
        Err(CoreError::InvalidTransition {
            from: JobState::Pending,
            ..
        })
    ));

    registry.start(job.id).unwrap();
    registry
        .fail(
            job.id,
            JobFailure::Worker {
                message: "boom".into(),
            },
        )
        .unwrap();

    let retried = registry.retry(job.id, &retries(1)).unwrap();
    assert_eq!(retried.state, JobState::Pending);
    assert_eq!(retried.attempts, 1);
    assert_eq!(retried.failure, None);
    assert_eq!(registry.in_flight(JobKind::Index, "/data/a.txt"), Some(job.id));

    registry.start(job.id).unwrap();
    registry.fail(job.id, JobFailure::Interrupted).unwrap();
    assert!(matches!(
        registry.retry(job.id, &retries(1)),
        Err(CoreError::RetryLimitExceeded { max_retries: 1, .. })
    ));
}

#[test]
fn test_retry_conflicts_with_newer_job() {
    let (_dir, _db, registry) = setup("registry_retry_conflict");
    let old = registry.create(JobKind::Index, "/data/a.txt", None).unwrap();
    registry.start(old.id).unwrap();
    registry.fail(old.id, JobFailure::Interrupted).unwrap();

    let newer = registry.create(JobKind::Index, "/data/a.txt", None).unwrap();
    assert!(matches!(
        registry.retry(old.id, &retries(3)),
        Err(CoreError::Conflict { existing }) if existing == newer.id
    ));
}

#[test]
fn test_delete_only_terminal_jobs() {
    let (_dir, _db, registry) = setup("registry_delete");
    let job = registry.create(JobKind::Index, "/data/a.txt", None).unwrap();

    assert!(matches!(
        registry.delete(job.id),
        Err(CoreError::StillActive(id)) if id == job.id
    ));
    registry.start(job.id).unwrap();
    assert!(matches!(
        registry.delete(job.id),
        Err(CoreError::StillActive(_))
    ));

    registry.succeed(job.id, "ok").unwrap();
    let deleted = registry.delete(job.id).unwrap();
    assert_eq!(deleted.id, job.id);

    assert!(matches!(registry.get(job.id), Err(CoreError::NotFound { .. })));
    assert!(registry.search().get(job.id).is_none());
    assert!(matches!(
        registry.delete(job.id),
        Err(CoreError::NotFound { .. })
    ));
}

#[test]
fn test_transition_visible_through_get_and_search() {
    let (_dir, _db, registry) = setup("registry_visibility");
    let job = registry.create(JobKind::Index, "/data/a.txt", None).unwrap();

    let running = registry.start(job.id).unwrap();

    assert_eq!(registry.get(job.id).unwrap().state, JobState::Running);
    let page = registry
        .search()
        .query(&JobQuery::new().state(JobState::Running), None, 10);
    assert_eq!(page.jobs, vec![running]);
    assert!(
        registry
            .search()
            .query(&JobQuery::new().state(JobState::Pending), None, 10)
            .jobs
            .is_empty()
    );
}

#[test]
fn test_restart_restores_jobs_and_slots() {
    let (_dir, db, registry) = setup("registry_restart");
    let pending = registry.create(JobKind::Index, "/data/a.txt", None).unwrap();
    let done = registry.create(JobKind::Index, "/data/b.txt", None).unwrap();
    registry.start(done.id).unwrap();
    registry.succeed(done.id, "ok").unwrap();
    let failed = registry.create(JobKind::Ingest, "/data/c.txt", None).unwrap();
    registry.start(failed.id).unwrap();
    registry.fail(failed.id, JobFailure::Interrupted).unwrap();
    drop(registry);

    let reopened = open_registry(&db);

    assert_eq!(reopened.search().len(), 3);
    assert_eq!(reopened.get(done.id).unwrap().state, JobState::Succeeded);
    assert_eq!(
        reopened.get(failed.id).unwrap().failure,
        Some(JobFailure::Interrupted)
    );
    assert_eq!(reopened.list_active().len(), 1);
    assert!(matches!(
        reopened.create(JobKind::Index, "/data/a.txt", None),
        Err(CoreError::Conflict { existing }) if existing == pending.id
    ));

    let counts = reopened.counts();
    assert_eq!(counts.get(&(JobKind::Index, JobState::Pending)), Some(&1));
    assert_eq!(counts.get(&(JobKind::Ingest, JobState::Failed)), Some(&1));
}

#[test]
fn test_create_with_explicit_payload() {
    let (_dir, _db, registry) = setup("registry_payload");
    let job = registry
        .create_job(NewJob {
            target_key: "/data/gone.txt".to_string(),
            payload: JobPayload::Ingest {
                source: "/data/gone.txt".to_string(),
                tombstone: true,
            },
            origin_event_seq: Some(3),
        })
        .unwrap();

    assert_eq!(job.kind, JobKind::Ingest);
    assert_eq!(
        registry.jobs_in_state(JobKind::Ingest, JobState::Pending),
        vec![job]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_admit_exactly_one() {
    let temp_dir = unique_temp_dir("registry_stress");
    let db = open_test_db(temp_dir.path());
    let registry = Arc::new(open_registry(&db));

    let attempts = (0..32).map(|_| {
        let registry = registry.clone();
        tokio::spawn(async move { registry.create(JobKind::Index, "/data/hot.txt", None) })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let created: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(created.len(), 1);
    let winner = created[0].id;

    for result in &results {
        match result {
            Ok(job) => assert_eq!(job.id, winner),
            Err(CoreError::Conflict { existing }) => assert_eq!(*existing, winner),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(
        registry
            .search()
            .query(&JobQuery::new().target_prefix("/data/hot"), None, 100)
            .jobs
            .len(),
        1
    );
}
