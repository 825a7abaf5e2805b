// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage index integration tests: register/finalize/list/cleanup against a
//! real filesystem, plus the atomic persist/reload round trip.
//!
//! Run with: `cargo test`

use std::fs;

use chrono::{FixedOffset, Utc};
use tempfile::TempDir;

use coordinator::config::StorageConfig;
use coordinator::storage::index::{FileListFilter, FileStatus, StorageIndex};

fn now() -> chrono::DateTime<FixedOffset> {
    Utc::now().with_timezone(&FixedOffset::east_opt(0).unwrap())
}

fn storage_config(dir: &std::path::Path) -> StorageConfig {
    StorageConfig {
        base_path: dir.to_path_buf(),
        max_file_size_mb: 2048,
        max_recording_duration_minutes: 60,
        cleanup_older_than_days: 30,
    }
}

fn tmp_dir() -> TempDir {
    tempfile::tempdir().expect("create tempdir")
}

#[test]
fn register_then_finalize_marks_completed() {
    let dir = tmp_dir();
    let index = StorageIndex::new(dir.path().join("file_index.json"), storage_config(dir.path()));

    let start = now();
    let path = dir.path().join("camera1/clip.mp4");
    let file_id = index.register("camera1", "clip.mp4", &path, start).unwrap();

    let files = index.list(&FileListFilter {
        camera_name: Some("camera1".to_string()),
        ..Default::default()
    });
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].status, FileStatus::Recording);

    index.finalize("camera1", 4096, now()).unwrap();
    let files = index.list(&FileListFilter {
        camera_name: Some("camera1".to_string()),
        ..Default::default()
    });
    assert_eq!(files[0].status, FileStatus::Completed);
    assert_eq!(files[0].file_size_bytes, Some(4096));
    assert_eq!(files[0].file_id, file_id);
}

#[test]
fn finalize_without_register_is_a_no_op() {
    let dir = tmp_dir();
    let index = StorageIndex::new(dir.path().join("file_index.json"), storage_config(dir.path()));
    index.finalize("camera1", 100, now()).unwrap();
    assert!(index.list(&FileListFilter::default()).is_empty());
}

#[test]
fn index_persists_and_reloads_across_open() {
    let dir = tmp_dir();
    let config = storage_config(dir.path());
    {
        let index = StorageIndex::open(config.clone()).unwrap();
        let path = dir.path().join("camera1/clip.mp4");
        index.register("camera1", "clip.mp4", &path, now()).unwrap();
        index.finalize("camera1", 1000, now()).unwrap();
    }

    let reopened = StorageIndex::open(config).unwrap();
    let files = reopened.list(&FileListFilter::default());
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].camera_name, "camera1");
    assert_eq!(files[0].status, FileStatus::Completed);
}

#[test]
fn cleanup_removes_only_old_completed_files_and_frees_bytes() {
    let dir = tmp_dir();
    let index = StorageIndex::new(dir.path().join("file_index.json"), storage_config(dir.path()));

    let old_path = dir.path().join("camera1/old.mp4");
    fs::create_dir_all(old_path.parent().unwrap()).unwrap();
    fs::write(&old_path, b"old-data").unwrap();
    let old_start = now() - chrono::Duration::days(60);
    index.register("camera1", "old.mp4", &old_path, old_start).unwrap();
    index.finalize("camera1", 8, old_start).unwrap();

    let recent_path = dir.path().join("camera1/recent.mp4");
    fs::write(&recent_path, b"recent-data").unwrap();
    index.register("camera1", "recent.mp4", &recent_path, now()).unwrap();
    index.finalize("camera1", 11, now()).unwrap();

    let report = index.cleanup(30, now()).unwrap();
    assert_eq!(report.files_removed, 1);
    assert_eq!(report.bytes_freed, 8);
    assert!(!old_path.exists());
    assert!(recent_path.exists());

    let remaining = index.list(&FileListFilter::default());
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].path, recent_path);
}

#[test]
fn statistics_roll_up_bytes_per_camera() {
    let dir = tmp_dir();
    let index = StorageIndex::new(dir.path().join("file_index.json"), storage_config(dir.path()));

    for (camera, bytes) in [("camera1", 100), ("camera1", 200), ("camera2", 50)] {
        let path = dir.path().join(format!("{camera}/{bytes}.mp4"));
        index.register(camera, "x.mp4", &path, now()).unwrap();
        index.finalize(camera, bytes, now()).unwrap();
    }

    let stats = index.statistics();
    assert_eq!(stats.file_count, 3);
    assert_eq!(stats.total_bytes, 350);
    assert_eq!(stats.per_camera.get("camera1").unwrap().total_bytes, 300);
    assert_eq!(stats.per_camera.get("camera2").unwrap().total_bytes, 50);
}

#[test]
fn list_merges_disk_only_files_as_unknown() {
    let dir = tmp_dir();
    let camera_dir = dir.path().join("camera1");
    fs::create_dir_all(&camera_dir).unwrap();
    fs::write(camera_dir.join("orphan.mp4"), b"orphaned").unwrap();

    let index = StorageIndex::new(dir.path().join("file_index.json"), storage_config(dir.path()));
    let files = index.list(&FileListFilter::default());
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].status, FileStatus::Unknown);
    assert_eq!(files[0].camera_name, "camera1");
}

#[test]
fn reindex_unknown_folds_disk_only_files_into_completed() {
    let dir = tmp_dir();
    let camera_dir = dir.path().join("camera1");
    fs::create_dir_all(&camera_dir).unwrap();
    fs::write(camera_dir.join("orphan.mp4"), b"orphaned").unwrap();

    let index = StorageIndex::new(dir.path().join("file_index.json"), storage_config(dir.path()));

    let dry_run_count = index.reindex_unknown(None, true).unwrap();
    assert_eq!(dry_run_count, 1);
    assert_eq!(
        index.list(&FileListFilter::default())[0].status,
        FileStatus::Unknown,
        "dry run must not mutate the index"
    );

    let count = index.reindex_unknown(None, false).unwrap();
    assert_eq!(count, 1);
    let files = index.list(&FileListFilter::default());
    assert_eq!(files[0].status, FileStatus::Completed);
}

#[test]
fn verify_integrity_flags_missing_files() {
    let dir = tmp_dir();
    let index = StorageIndex::new(dir.path().join("file_index.json"), storage_config(dir.path()));

    let path = dir.path().join("camera1/gone.mp4");
    index.register("camera1", "gone.mp4", &path, now()).unwrap();
    index.finalize("camera1", 10, now()).unwrap();

    let report = index.verify_integrity().unwrap();
    assert_eq!(report.missing_files_removed, 1);
}
