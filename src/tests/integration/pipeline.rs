//! End-to-end pipeline scenarios
//!
//! The dispatcher runs for real. The watcher is fed notify events by hand and flushed
//! explicitly, except in the serial test that lets the OS report changes.

use crate::config::InitialWatchPath;
use crate::dispatcher::Workers;
use crate::error::CoreError;
use crate::events::{ChangeKind, EventFilter};
use crate::jobs::{JobId, JobKind, JobPayload, JobState};
use crate::pipeline::Pipeline;
use crate::search::JobQuery;
use crate::tests::helpers::workers::CountingWorker;
use crate::tests::helpers::{test_config, unique_temp_dir, wait_for_job_state, wait_for_jobs};
use crate::workers::default_workers;
use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind};
use notify::{Event, EventKind};
use serial_test::serial;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn open(root: &Path, workers: Workers) -> Pipeline {
    Pipeline::open(test_config(root), workers).unwrap()
}

fn data_dir(root: &Path) -> PathBuf {
    let data = root.join("data");
    fs::create_dir_all(&data).unwrap();
    data.canonicalize().unwrap()
}

fn notify_created(pipeline: &Pipeline, path: &Path) {
    pipeline.watcher().observe_notify_event(
        Event::new(EventKind::Create(CreateKind::File)).add_path(path.to_path_buf()),
        Instant::now(),
    );
}

fn notify_modified(pipeline: &Pipeline, path: &Path) {
    pipeline.watcher().observe_notify_event(
        Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(path.to_path_buf()),
        Instant::now(),
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_file_becomes_one_succeeded_index_job() {
    let temp_dir = unique_temp_dir("pipeline_new_file");
    let data = data_dir(temp_dir.path());
    let pipeline = open(temp_dir.path(), default_workers());
    pipeline.dispatcher().start().unwrap();
    pipeline.add_watch_path(&data, false).unwrap();

    let file = data.join("a.txt");
    fs::write(&file, "hello").unwrap();
    notify_created(&pipeline, &file);
    let recorded = pipeline.watcher().flush_all().unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].kind, ChangeKind::Created);

    let jobs = wait_for_jobs(
        pipeline.search(),
        &JobQuery::new().kind(JobKind::Index),
        1,
        WAIT,
    )
    .await;
    let job = wait_for_job_state(pipeline.registry(), jobs[0].id, JobState::Succeeded, WAIT).await;

    assert_eq!(job.target_key, file.to_string_lossy());
    assert_eq!(job.origin_event_seq, Some(recorded[0].seq));
    let expected = format!(
        "5 bytes blake3:{}",
        hex::encode(blake3::hash(b"hello").as_bytes())
    );
    assert_eq!(job.result.as_deref(), Some(expected.as_str()));

    pipeline.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rapid_writes_become_one_event_and_one_job() {
    let temp_dir = unique_temp_dir("pipeline_rapid_writes");
    let data = data_dir(temp_dir.path());
    let worker = CountingWorker::default();
    let pipeline = open(
        temp_dir.path(),
        Workers::new().with(JobKind::Index, worker.clone()),
    );
    pipeline.dispatcher().start().unwrap();
    pipeline.add_watch_path(&data, true).unwrap();

    let file = data.join("a.txt");
    fs::write(&file, "one").unwrap();
    notify_created(&pipeline, &file);
    fs::write(&file, "two").unwrap();
    notify_modified(&pipeline, &file);
    let recorded = pipeline.watcher().flush_all().unwrap();
    assert_eq!(recorded.len(), 1);

    let jobs = wait_for_jobs(
        pipeline.search(),
        &JobQuery::new().state(JobState::Succeeded),
        1,
        WAIT,
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(pipeline.search().len(), 1);
    assert_eq!(jobs[0].origin_event_seq, Some(recorded[0].seq));
    assert_eq!(worker.runs(), 1);
    assert_eq!(pipeline.events().highest_seq(), 1);

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_manual_create_conflict_returns_existing_job() {
    let temp_dir = unique_temp_dir("pipeline_conflict");
    let pipeline = open(temp_dir.path(), Workers::new());

    // Not started: jobs stay pending
    let first = pipeline.create_job(JobKind::Index, "/data/a.txt").unwrap();
    let err = pipeline.create_job(JobKind::Index, "/data/a.txt").unwrap_err();
    assert!(matches!(err, CoreError::Conflict { existing } if existing == first.id));
    assert_eq!(err.status_code(), 409);

    let other_kind = pipeline.create_job(JobKind::Ingest, "/data/a.txt").unwrap();
    assert_ne!(other_kind.id, first.id);
}

#[tokio::test]
async fn test_kind_routes_and_job_search() {
    let temp_dir = unique_temp_dir("pipeline_kind_routes");
    let pipeline = open(temp_dir.path(), Workers::new());

    let index = pipeline.create_job(JobKind::Index, "/data/a.txt").unwrap();
    let ingest = pipeline.create_job(JobKind::Ingest, "queue://b").unwrap();

    assert_eq!(
        pipeline.get_job_of_kind(JobKind::Index, index.id).unwrap(),
        index
    );
    assert!(matches!(
        pipeline.get_job_of_kind(JobKind::Ingest, index.id),
        Err(CoreError::NotFound {
            entity: "ingest job",
            ..
        })
    ));
    assert!(matches!(
        pipeline.get_job(JobId(404)),
        Err(CoreError::NotFound { .. })
    ));

    // The route's kind wins over the query's
    let page = pipeline.search_jobs(
        JobKind::Ingest,
        JobQuery::new().kind(JobKind::Index),
        None,
        10,
    );
    assert_eq!(page.jobs, vec![ingest.clone()]);

    // Deleting through the wrong route or while pending is refused
    assert!(matches!(
        pipeline.delete_job(JobKind::Index, ingest.id),
        Err(CoreError::NotFound { .. })
    ));
    assert!(matches!(
        pipeline.delete_job(JobKind::Ingest, ingest.id),
        Err(CoreError::StillActive(_))
    ));

    pipeline.registry().start(ingest.id).unwrap();
    pipeline.registry().succeed(ingest.id, "ok").unwrap();
    pipeline.delete_job(JobKind::Ingest, ingest.id).unwrap();
    assert!(
        pipeline
            .search_jobs(JobKind::Ingest, JobQuery::new(), None, 10)
            .jobs
            .is_empty()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_intake_file_runs_ingest_job() {
    let temp_dir = unique_temp_dir("pipeline_intake");
    let data = data_dir(temp_dir.path());
    let pipeline = open(temp_dir.path(), default_workers());
    pipeline.dispatcher().start().unwrap();

    let file = data.join("upload.bin");
    fs::write(&file, [1u8, 2, 3]).unwrap();

    let job = pipeline.intake_file(&file).unwrap();
    assert_eq!(
        job.payload,
        JobPayload::Ingest {
            source: file.to_string_lossy().into_owned(),
            tombstone: false
        }
    );
    let done = wait_for_job_state(pipeline.registry(), job.id, JobState::Succeeded, WAIT).await;
    assert!(done.result.unwrap().starts_with("3 bytes blake3:"));

    assert!(matches!(
        pipeline.intake_file(data.join("missing.bin")),
        Err(CoreError::PathNotFound(_))
    ));
    assert!(matches!(
        pipeline.intake_file(&data),
        Err(CoreError::InvalidInput(_))
    ));

    pipeline.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_preserves_events_and_jobs() {
    let temp_dir = unique_temp_dir("pipeline_restart");
    let data = data_dir(temp_dir.path());
    let watch_id;
    let jobs_before;
    let first_event;
    {
        let pipeline = open(temp_dir.path(), default_workers());
        pipeline.dispatcher().start().unwrap();
        watch_id = pipeline.add_watch_path(&data, true).unwrap().id;

        for name in ["a", "b", "c"] {
            let file = data.join(format!("{name}.txt"));
            fs::write(&file, name).unwrap();
            notify_created(&pipeline, &file);
        }
        pipeline.watcher().flush_all().unwrap();
        wait_for_jobs(
            pipeline.search(),
            &JobQuery::new().kind(JobKind::Index).state(JobState::Succeeded),
            3,
            WAIT,
        )
        .await;

        // Removals derive tombstone ingest jobs only
        for name in ["a", "b"] {
            let file = data.join(format!("{name}.txt"));
            fs::remove_file(&file).unwrap();
            pipeline.watcher().observe_notify_event(
                Event::new(EventKind::Remove(RemoveKind::File))
                    .add_path(file.clone()),
                Instant::now(),
            );
        }
        pipeline.watcher().flush_all().unwrap();
        assert_eq!(pipeline.events().highest_seq(), 5);

        wait_for_jobs(
            pipeline.search(),
            &JobQuery::new().kind(JobKind::Ingest).state(JobState::Succeeded),
            2,
            WAIT,
        )
        .await;
        jobs_before = pipeline.search().query(&JobQuery::new(), None, usize::MAX).jobs;
        first_event = pipeline.read_event(1).unwrap();
        pipeline.shutdown().await.unwrap();
    }

    let reopened = open(temp_dir.path(), default_workers());
    reopened.dispatcher().start().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(reopened.events().highest_seq(), 5);
    assert_eq!(reopened.search().len(), 5);
    assert_eq!(reopened.get_watch_path(watch_id).unwrap().path, data);
    assert_eq!(reopened.dispatcher().cursor(JobKind::Index).unwrap(), 5);
    assert_eq!(reopened.dispatcher().cursor(JobKind::Ingest).unwrap(), 5);

    let removals = reopened
        .search_events(
            &EventFilter {
                kinds: vec![ChangeKind::Removed],
                ..Default::default()
            },
            0,
            10,
        )
        .unwrap();
    assert_eq!(removals.len(), 2);

    // Reloaded records compare equal, timestamps included
    assert_eq!(reopened.read_event(1).unwrap(), first_event);
    assert_eq!(jobs_before.len(), 5);
    for job in &jobs_before {
        assert_eq!(reopened.get_job(job.id).unwrap(), *job);
    }
    let first_job = &jobs_before[0];
    let exact = reopened.search().query(
        &JobQuery::new().created_between(
            first_job.created_at,
            first_job.created_at + chrono::Duration::nanoseconds(1),
        ),
        None,
        10,
    );
    assert_eq!(exact.jobs, vec![first_job.clone()]);

    // The next event continues the sequence
    let file = data.join("d.txt");
    fs::write(&file, "d").unwrap();
    notify_created(&reopened, &file);
    let recorded = reopened.watcher().flush_all().unwrap();
    assert_eq!(recorded[0].seq, 6);

    reopened.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_real_watcher_end_to_end() {
    let temp_dir = unique_temp_dir("pipeline_real_watcher");
    let data = data_dir(temp_dir.path());
    let mut config = test_config(temp_dir.path());
    config.watcher.paths.push(InitialWatchPath {
        path: data.clone(),
        recursive: true,
    });
    let pipeline = Pipeline::open(config, default_workers()).unwrap();
    assert_eq!(pipeline.list_watch_paths().len(), 1);
    pipeline.start().unwrap();

    let file = data.join("live.txt");
    fs::write(&file, "live").unwrap();

    let jobs = wait_for_jobs(
        pipeline.search(),
        &JobQuery::new()
            .kind(JobKind::Index)
            .state(JobState::Succeeded)
            .target_prefix(file.to_string_lossy()),
        1,
        WAIT,
    )
    .await;
    assert!(jobs[0].result.as_deref().unwrap().starts_with("4 bytes"));

    pipeline.shutdown().await.unwrap();
}
