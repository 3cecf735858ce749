use crate::error::CoreError;
use crate::events::{ChangeKind, EventFilter, EventStore};
use crate::tests::helpers::{new_event, open_test_db, set_events_offline, unique_temp_dir};
use crate::watcher::WatchPathId;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

#[test]
fn test_append_assigns_consecutive_sequence_numbers() {
    let temp_dir = unique_temp_dir("events_append");
    let store = EventStore::open(open_test_db(temp_dir.path())).unwrap();
    let watch = WatchPathId::new();

    let seqs: Vec<u64> = (0..5)
        .map(|i| {
            store
                .append(new_event(
                    watch,
                    format!("/data/{i}.txt"),
                    ChangeKind::Created,
                    "fp",
                ))
                .unwrap()
                .seq
        })
        .collect();

    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    assert_eq!(store.highest_seq(), 5);

    let third = store.read(3).unwrap();
    assert_eq!(third.path, PathBuf::from("/data/2.txt"));
    assert_eq!(third.kind, ChangeKind::Created);
    assert_eq!(third.watch_path_id, watch);
}

#[test]
fn test_read_missing_event() {
    let temp_dir = unique_temp_dir("events_missing");
    let store = EventStore::open(open_test_db(temp_dir.path())).unwrap();

    let err = store.read(1).unwrap_err();
    assert!(matches!(err, CoreError::NotFound { entity: "event", .. }));
}

#[test]
fn test_concurrent_appends_never_interleave() {
    let temp_dir = unique_temp_dir("events_concurrent");
    let store = Arc::new(EventStore::open(open_test_db(temp_dir.path())).unwrap());
    let watch = WatchPathId::new();

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let store = store.clone();
            thread::spawn(move || {
                (0..25)
                    .map(|i| {
                        store
                            .append(new_event(
                                watch,
                                format!("/data/{t}/{i}.txt"),
                                ChangeKind::Modified,
                                "fp",
                            ))
                            .unwrap()
                            .seq
                    })
                    .collect::<Vec<u64>>()
            })
        })
        .collect();

    let mut all = BTreeSet::new();
    for handle in handles {
        let seqs = handle.join().unwrap();
        // Each writer sees its own appends in increasing order
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        all.extend(seqs);
    }

    assert_eq!(all.len(), 200);
    assert_eq!(all.iter().copied().collect::<Vec<_>>(), (1..=200).collect::<Vec<_>>());

    let scanned: Vec<u64> = store
        .scan(1, u64::MAX, usize::MAX)
        .map(|e| e.unwrap().seq)
        .collect();
    assert_eq!(scanned, (1..=200).collect::<Vec<_>>());
}

#[test]
fn test_scan_is_bounded_and_restartable() {
    let temp_dir = unique_temp_dir("events_scan");
    let store = EventStore::open(open_test_db(temp_dir.path())).unwrap();
    let watch = WatchPathId::new();
    for i in 0..600 {
        store
            .append(new_event(
                watch,
                format!("/data/{i}"),
                ChangeKind::Created,
                "fp",
            ))
            .unwrap();
    }

    // Range bounds are inclusive
    let ranged: Vec<u64> = store.scan(10, 20, usize::MAX).map(|e| e.unwrap().seq).collect();
    assert_eq!(ranged, (10..=20).collect::<Vec<_>>());

    // Limit spans several pages
    let mut scan = store.scan(1, u64::MAX, 300);
    let first: Vec<u64> = scan.by_ref().map(|e| e.unwrap().seq).collect();
    assert_eq!(first.len(), 300);
    let last_seen = scan.last_seen().unwrap();
    assert_eq!(last_seen, 300);

    let rest: Vec<u64> = store
        .scan(last_seen + 1, u64::MAX, usize::MAX)
        .map(|e| e.unwrap().seq)
        .collect();
    assert_eq!(rest, (301..=600).collect::<Vec<_>>());

    assert_eq!(store.scan(700, 800, 10).count(), 0);
    assert_eq!(store.scan(20, 10, 10).count(), 0);
}

#[test]
fn test_restart_recovers_highest_sequence() {
    let temp_dir = unique_temp_dir("events_restart");
    {
        let store = EventStore::open(open_test_db(temp_dir.path())).unwrap();
        for i in 0..5 {
            store
                .append(new_event(
                    WatchPathId::new(),
                    format!("/data/{i}"),
                    ChangeKind::Created,
                    "fp",
                ))
                .unwrap();
        }
    }

    let store = EventStore::open(open_test_db(temp_dir.path())).unwrap();
    assert_eq!(store.highest_seq(), 5);

    let next = store
        .append(new_event(
            WatchPathId::new(),
            "/data/next",
            ChangeKind::Created,
            "fp",
        ))
        .unwrap();
    assert_eq!(next.seq, 6);
}

#[test]
fn test_last_for_path_and_search() {
    let temp_dir = unique_temp_dir("events_search");
    let store = EventStore::open(open_test_db(temp_dir.path())).unwrap();
    let docs = WatchPathId::new();
    let logs = WatchPathId::new();

    store
        .append(new_event(docs, "/docs/a.md", ChangeKind::Created, "v1"))
        .unwrap();
    store
        .append(new_event(logs, "/logs/app.log", ChangeKind::Created, "l1"))
        .unwrap();
    store
        .append(new_event(docs, "/docs/a.md", ChangeKind::Modified, "v2"))
        .unwrap();
    store
        .append(new_event(docs, "/docs/b.md", ChangeKind::Removed, "absent"))
        .unwrap();

    let last = store
        .last_for_path(&PathBuf::from("/docs/a.md"))
        .unwrap()
        .unwrap();
    assert_eq!(last.seq, 3);
    assert_eq!(last.fingerprint.as_str(), "v2");
    assert!(
        store
            .last_for_path(&PathBuf::from("/docs/none.md"))
            .unwrap()
            .is_none()
    );

    let by_watch = store
        .search(
            &EventFilter {
                watch_path_id: Some(docs),
                ..Default::default()
            },
            0,
            100,
        )
        .unwrap();
    assert_eq!(by_watch.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 3, 4]);

    let modified_docs = store
        .search(
            &EventFilter {
                path_prefix: Some("/docs/".to_string()),
                kinds: vec![ChangeKind::Modified, ChangeKind::Removed],
                ..Default::default()
            },
            0,
            100,
        )
        .unwrap();
    assert_eq!(
        modified_docs.iter().map(|e| e.seq).collect::<Vec<_>>(),
        vec![3, 4]
    );

    // Paging by the last seen sequence number
    let after_three = store.search(&EventFilter::default(), 3, 100).unwrap();
    assert_eq!(after_three.len(), 1);
    assert_eq!(after_three[0].seq, 4);
}

#[test]
fn test_failed_append_leaves_no_gap() {
    let temp_dir = unique_temp_dir("events_storage_failure");
    let db = open_test_db(temp_dir.path());
    let store = EventStore::open(db.clone()).unwrap();
    let watch = WatchPathId::new();

    store
        .append(new_event(watch, "/data/a.txt", ChangeKind::Created, "a1"))
        .unwrap();

    set_events_offline(&db, true);
    let err = store
        .append(new_event(watch, "/data/b.txt", ChangeKind::Created, "b1"))
        .unwrap_err();
    assert!(matches!(err, CoreError::StorageFailure(_)));
    assert!(err.is_fatal());
    assert_eq!(err.status_code(), 503);
    assert_eq!(store.highest_seq(), 1);

    // The next successful append takes the number the failed one would have had
    set_events_offline(&db, false);
    let next = store
        .append(new_event(watch, "/data/b.txt", ChangeKind::Created, "b1"))
        .unwrap();
    assert_eq!(next.seq, 2);
    assert_eq!(store.read(2).unwrap(), next);
}
