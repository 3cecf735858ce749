use crate::config::FinspectConfig;
use crate::dispatcher::EventJobMapping;
use crate::events::ChangeKind;
use crate::jobs::JobKind;
use crate::tests::helpers::unique_temp_dir;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[test]
fn test_defaults() {
    let config = FinspectConfig::default();

    assert_eq!(config.watcher.coalesce_window(), Duration::from_millis(250));
    assert_eq!(config.watcher.max_coalesce_delay(), Duration::from_secs(2));
    assert!(config.watcher.paths.is_empty());
    assert!(
        config
            .watcher
            .ignore_patterns
            .iter()
            .any(|p| p.contains(".git"))
    );
    assert_eq!(config.dispatcher.worker_slots, 4);
    assert_eq!(config.dispatcher.job_timeout(), Duration::from_secs(30));
    assert_eq!(config.dispatcher.retry.max_retries, 0);
    assert_eq!(config.dispatcher.mapping, EventJobMapping::default());
    assert_eq!(config.logging.filter, "finspect=info");
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let temp_dir = unique_temp_dir("config_missing");
    let config = FinspectConfig::load(&temp_dir.path().join("nope.toml")).unwrap();
    assert_eq!(config.dispatcher.worker_slots, 4);
}

#[test]
fn test_partial_file_keeps_other_defaults() {
    let temp_dir = unique_temp_dir("config_partial");
    let path = temp_dir.path().join("config.toml");
    fs::write(
        &path,
        r#"
[watcher]
coalesce_window_ms = 100

[[watcher.paths]]
path = "/srv/data"

[dispatcher.retry]
max_retries = 2

[dispatcher.mapping]
removed = ["ingest", "index"]
"#,
    )
    .unwrap();

    let config = FinspectConfig::load(&path).unwrap();

    assert_eq!(config.watcher.coalesce_window_ms, 100);
    assert_eq!(config.watcher.paths.len(), 1);
    assert_eq!(config.watcher.paths[0].path, PathBuf::from("/srv/data"));
    assert!(config.watcher.paths[0].recursive);
    assert_eq!(config.watcher.max_hash_bytes, 64 * 1024 * 1024);
    assert_eq!(config.dispatcher.retry.max_retries, 2);
    assert_eq!(config.dispatcher.retry.backoff_ms, 1000);
    assert_eq!(
        config.dispatcher.mapping.jobs_for(ChangeKind::Removed),
        &[JobKind::Ingest, JobKind::Index]
    );
    assert_eq!(
        config.dispatcher.mapping.jobs_for(ChangeKind::Modified),
        &[JobKind::Index]
    );
}

#[test]
fn test_invalid_file_is_an_error() {
    let temp_dir = unique_temp_dir("config_invalid");
    let path = temp_dir.path().join("config.toml");
    fs::write(&path, "[dispatcher]\nworker_slots = \"many\"\n").unwrap();

    let err = FinspectConfig::load(&path).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
}

#[test]
fn test_save_then_load() {
    let temp_dir = unique_temp_dir("config_save");
    let path = temp_dir.path().join("nested").join("config.toml");

    let mut config = FinspectConfig::default();
    config.storage.db_path = PathBuf::from("/var/lib/finspect/finspect.db");
    config.dispatcher.worker_slots = 8;
    config.save(&path).unwrap();

    let loaded = FinspectConfig::load(&path).unwrap();
    assert_eq!(loaded.storage.db_path, config.storage.db_path);
    assert_eq!(loaded.dispatcher.worker_slots, 8);
    assert_eq!(loaded.watcher.ignore_patterns, config.watcher.ignore_patterns);
}
