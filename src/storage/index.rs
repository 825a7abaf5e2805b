// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage Index — a durable JSON catalogue of recorded files, one entry per
//! recording, write-through after every mutation with atomic (temp+rename)
//! persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::StorageConfig;
use crate::error::Result;

const INDEX_FILENAME: &str = "file_index.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Recording,
    Completed,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: String,
    pub camera_name: String,
    pub path: PathBuf,
    pub start_time: DateTime<FixedOffset>,
    pub end_time: Option<DateTime<FixedOffset>>,
    pub duration_seconds: Option<f64>,
    pub file_size_bytes: Option<u64>,
    pub status: FileStatus,
}

#[derive(Debug, Clone, Default)]
pub struct FileListFilter {
    pub camera_name: Option<String>,
    pub start_date: Option<DateTime<FixedOffset>>,
    pub end_date: Option<DateTime<FixedOffset>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraRollup {
    pub file_count: usize,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Statistics {
    pub file_count: usize,
    pub total_bytes: u64,
    pub per_camera: HashMap<String, CameraRollup>,
    /// Total size of every file actually present under the base path
    /// (index entries plus unindexed/unknown files), from a disk scan.
    pub disk_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct CleanupReport {
    pub files_removed: usize,
    pub bytes_freed: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct IntegrityReport {
    pub missing_files_removed: usize,
    pub orphan_files_found: Vec<PathBuf>,
}

#[derive(Serialize, Deserialize, Default)]
struct OnDisk {
    files: HashMap<String, FileRecord>,
    last_updated: Option<DateTime<FixedOffset>>,
}

struct Inner {
    files: HashMap<String, FileRecord>,
    active_by_camera: HashMap<String, String>,
}

/// Guards the in-memory mirror; every mutation write-throughs to
/// `<base_path>/file_index.json` atomically (write to a temp file, then
/// rename).
pub struct StorageIndex {
    index_path: PathBuf,
    storage: StorageConfig,
    inner: Mutex<Inner>,
}

impl StorageIndex {
    pub fn new(index_path: PathBuf, storage: StorageConfig) -> Self {
        Self {
            index_path,
            storage,
            inner: Mutex::new(Inner {
                files: HashMap::new(),
                active_by_camera: HashMap::new(),
            }),
        }
    }

    /// Convenience constructor deriving the index path from `storage`'s base
    /// path and loading any existing index on disk.
    pub fn open(storage: StorageConfig) -> Result<Self> {
        let index_path = storage.base_path.join(INDEX_FILENAME);
        let index = Self::new(index_path, storage);
        index.load()?;
        Ok(index)
    }

    fn load(&self) -> Result<()> {
        if !self.index_path.exists() {
            return Ok(());
        }
        let content = std::fs::read_to_string(&self.index_path)?;
        let on_disk: OnDisk = serde_json::from_str(&content)?;
        let mut inner = self.inner.lock();
        for (file_id, record) in &on_disk.files {
            if record.status == FileStatus::Recording {
                inner
                    .active_by_camera
                    .insert(record.camera_name.clone(), file_id.clone());
            }
        }
        inner.files = on_disk.files;
        Ok(())
    }

    fn persist(&self, inner: &Inner) -> Result<()> {
        let on_disk = OnDisk {
            files: inner.files.clone(),
            last_updated: Some(chrono::Utc::now().with_timezone(&FixedOffset::east_opt(0).unwrap())),
        };
        let json = serde_json::to_string_pretty(&on_disk)?;
        if let Some(parent) = self.index_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.index_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.index_path)?;
        Ok(())
    }

    pub fn register(
        &self,
        camera_name: &str,
        filename: &str,
        full_path: &Path,
        start: DateTime<FixedOffset>,
    ) -> Result<String> {
        let file_id = full_path.to_string_lossy().to_string();
        let mut inner = self.inner.lock();
        inner.files.insert(
            file_id.clone(),
            FileRecord {
                file_id: file_id.clone(),
                camera_name: camera_name.to_string(),
                path: full_path.to_path_buf(),
                start_time: start,
                end_time: None,
                duration_seconds: None,
                file_size_bytes: None,
                status: FileStatus::Recording,
            },
        );
        inner
            .active_by_camera
            .insert(camera_name.to_string(), file_id.clone());
        self.persist(&inner)?;
        let _ = filename;
        Ok(file_id)
    }

    /// Finalizes the currently-recording entry for `camera_name`. No-op if
    /// there is none (e.g. the recorder never got as far as `register`).
    pub fn finalize(
        &self,
        camera_name: &str,
        bytes_written: u64,
        end: DateTime<FixedOffset>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(file_id) = inner.active_by_camera.remove(camera_name) else {
            return Ok(());
        };
        if let Some(record) = inner.files.get_mut(&file_id) {
            let duration = (end - record.start_time).num_milliseconds() as f64 / 1000.0;
            record.end_time = Some(end);
            record.duration_seconds = Some(duration.max(0.0));
            record.file_size_bytes = Some(bytes_written);
            record.status = FileStatus::Completed;
        }
        self.persist(&inner)
    }

    /// Merges indexed entries with files discovered on disk under the
    /// camera's directory (or the whole base path when no camera filter is
    /// given), deduplicating by absolute path.
    pub fn list(&self, filter: &FileListFilter) -> Vec<FileRecord> {
        let inner = self.inner.lock();
        let mut seen_paths: std::collections::HashSet<PathBuf> = std::collections::HashSet::new();
        let mut results: Vec<FileRecord> = Vec::new();

        for record in inner.files.values() {
            if let Some(ref camera) = filter.camera_name {
                if &record.camera_name != camera {
                    continue;
                }
            }
            if let Some(start_date) = filter.start_date {
                if record.start_time < start_date {
                    continue;
                }
            }
            if let Some(end_date) = filter.end_date {
                if record.start_time > end_date {
                    continue;
                }
            }
            seen_paths.insert(record.path.clone());
            results.push(record.clone());
        }

        for disk_record in self.scan_disk_only(&filter.camera_name, &seen_paths) {
            if let Some(start_date) = filter.start_date {
                if disk_record.start_time < start_date {
                    continue;
                }
            }
            if let Some(end_date) = filter.end_date {
                if disk_record.start_time > end_date {
                    continue;
                }
            }
            results.push(disk_record);
        }

        results.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        let limit = filter.limit.unwrap_or(100).clamp(1, 1000);
        results.truncate(limit);
        results
    }

    fn scan_disk_only(
        &self,
        camera_filter: &Option<String>,
        seen: &std::collections::HashSet<PathBuf>,
    ) -> Vec<FileRecord> {
        let mut out = Vec::new();
        let Ok(camera_dirs) = std::fs::read_dir(&self.storage.base_path) else {
            return out;
        };
        for entry in camera_dirs.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let camera_name = entry.file_name().to_string_lossy().to_string();
            if let Some(filter) = camera_filter {
                if &camera_name != filter {
                    continue;
                }
            }
            let Ok(files) = std::fs::read_dir(entry.path()) else {
                continue;
            };
            for file_entry in files.flatten() {
                let path = file_entry.path();
                if seen.contains(&path) {
                    continue;
                }
                let Ok(metadata) = file_entry.metadata() else {
                    continue;
                };
                if !metadata.is_file() {
                    continue;
                }
                let mtime = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| {
                        chrono::DateTime::from_timestamp(d.as_secs() as i64, 0)
                            .unwrap_or_default()
                            .with_timezone(&FixedOffset::east_opt(0).unwrap())
                    })
                    .unwrap_or_else(|| chrono::Utc::now().with_timezone(&FixedOffset::east_opt(0).unwrap()));
                out.push(FileRecord {
                    file_id: path.to_string_lossy().to_string(),
                    camera_name: camera_name.clone(),
                    path,
                    start_time: mtime,
                    end_time: None,
                    duration_seconds: None,
                    file_size_bytes: Some(metadata.len()),
                    status: FileStatus::Unknown,
                });
            }
        }
        out
    }

    /// The configured cleanup horizon, for callers (e.g. the `/storage/cleanup`
    /// handler) that don't otherwise have a hold on the storage config.
    pub fn cleanup_older_than_days(&self) -> u64 {
        self.storage.cleanup_older_than_days
    }

    /// Folds disk-only entries (status `Unknown`, i.e. files present on disk
    /// but never registered through `register`/`finalize`) into the index as
    /// `Completed`, so they become eligible for `/recordings` and streaming.
    /// Returns the number of files updated (or that would be, under
    /// `dry_run`) without writing anything in that case.
    pub fn reindex_unknown(&self, camera_name: Option<&str>, dry_run: bool) -> Result<usize> {
        let filter = FileListFilter {
            camera_name: camera_name.map(str::to_string),
            limit: Some(usize::MAX),
            ..Default::default()
        };
        let unknown: Vec<FileRecord> = self
            .list(&filter)
            .into_iter()
            .filter(|r| r.status == FileStatus::Unknown)
            .collect();
        if unknown.is_empty() || dry_run {
            return Ok(unknown.len());
        }
        let mut inner = self.inner.lock();
        for mut record in unknown.clone() {
            record.end_time.get_or_insert(record.start_time);
            record.status = FileStatus::Completed;
            inner.files.insert(record.file_id.clone(), record);
        }
        self.persist(&inner)?;
        Ok(unknown.len())
    }

    pub fn statistics(&self) -> Statistics {
        let inner = self.inner.lock();
        let mut per_camera: HashMap<String, CameraRollup> = HashMap::new();
        let mut total_bytes = 0u64;
        let mut seen_paths: std::collections::HashSet<PathBuf> = std::collections::HashSet::new();
        for record in inner.files.values() {
            let bytes = record.file_size_bytes.unwrap_or(0);
            total_bytes += bytes;
            seen_paths.insert(record.path.clone());
            let rollup = per_camera.entry(record.camera_name.clone()).or_insert(CameraRollup {
                file_count: 0,
                total_bytes: 0,
            });
            rollup.file_count += 1;
            rollup.total_bytes += bytes;
        }

        // Disk usage of the base path covers indexed files plus anything
        // sitting on disk that was never registered.
        let mut disk_bytes = total_bytes;
        for disk_record in self.scan_disk_only(&None, &seen_paths) {
            disk_bytes += disk_record.file_size_bytes.unwrap_or(0);
        }

        Statistics {
            file_count: inner.files.len(),
            total_bytes,
            per_camera,
            disk_bytes,
        }
    }

    /// Removes completed entries older than `max_age_days` and deletes the
    /// underlying file; reports bytes freed / files removed / errors.
    pub fn cleanup(&self, max_age_days: u64, now: DateTime<FixedOffset>) -> Result<CleanupReport> {
        let cutoff = now - chrono::Duration::days(max_age_days as i64);
        let mut inner = self.inner.lock();
        let mut report = CleanupReport::default();
        let to_remove: Vec<String> = inner
            .files
            .values()
            .filter(|r| r.status == FileStatus::Completed && r.start_time < cutoff)
            .map(|r| r.file_id.clone())
            .collect();

        for file_id in to_remove {
            if let Some(record) = inner.files.get(&file_id).cloned() {
                match std::fs::remove_file(&record.path) {
                    Ok(()) => {
                        report.bytes_freed += record.file_size_bytes.unwrap_or(0);
                        report.files_removed += 1;
                        inner.files.remove(&file_id);
                    }
                    Err(err) => {
                        report.errors.push(format!("{}: {err}", record.path.display()));
                    }
                }
            }
        }
        self.persist(&inner)?;
        Ok(report)
    }

    /// Removes index entries whose backing file is missing; reports orphan
    /// files on disk that have no index entry.
    pub fn verify_integrity(&self) -> Result<IntegrityReport> {
        let mut inner = self.inner.lock();
        let mut report = IntegrityReport::default();

        let missing: Vec<String> = inner
            .files
            .values()
            .filter(|r| !r.path.exists())
            .map(|r| r.file_id.clone())
            .collect();
        for file_id in missing {
            inner.files.remove(&file_id);
            report.missing_files_removed += 1;
        }
        inner
            .active_by_camera
            .retain(|_, file_id| inner.files.contains_key(file_id));

        let seen: std::collections::HashSet<PathBuf> =
            inner.files.values().map(|r| r.path.clone()).collect();
        report.orphan_files_found = self
            .scan_disk_only(&None, &seen)
            .into_iter()
            .map(|r| r.path)
            .collect();

        self.persist(&inner)?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base: &Path) -> StorageConfig {
        StorageConfig {
            base_path: base.to_path_buf(),
            max_file_size_mb: 2048,
            max_recording_duration_minutes: 60,
            cleanup_older_than_days: 30,
        }
    }

    fn now() -> DateTime<FixedOffset> {
        chrono::Utc::now().with_timezone(&FixedOffset::east_opt(0).unwrap())
    }

    #[test]
    fn register_then_finalize_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("camera1")).unwrap();
        let path = dir.path().join("camera1").join("clip.raw");
        std::fs::write(&path, b"hello").unwrap();

        let index = StorageIndex::open(config(dir.path())).unwrap();
        index.register("camera1", "clip.raw", &path, now()).unwrap();
        index.finalize("camera1", 5, now()).unwrap();

        let reloaded = StorageIndex::open(config(dir.path())).unwrap();
        let files = reloaded.list(&FileListFilter::default());
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].status, FileStatus::Completed);
        assert_eq!(files[0].file_size_bytes, Some(5));
    }

    #[test]
    fn list_merges_disk_only_files_as_unknown() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("camera1")).unwrap();
        std::fs::write(dir.path().join("camera1").join("orphan.raw"), b"xyz").unwrap();

        let index = StorageIndex::open(config(dir.path())).unwrap();
        let files = index.list(&FileListFilter::default());
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].status, FileStatus::Unknown);
    }

    #[test]
    fn list_respects_limit_clamp() {
        let dir = tempfile::tempdir().unwrap();
        let index = StorageIndex::open(config(dir.path())).unwrap();
        for i in 0..5 {
            let path = dir.path().join(format!("f{i}.raw"));
            index.register("camera1", "f.raw", &path, now()).unwrap();
        }
        let filter = FileListFilter {
            limit: Some(2),
            ..Default::default()
        };
        assert_eq!(index.list(&filter).len(), 2);
    }

    #[test]
    fn cleanup_removes_old_completed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.raw");
        std::fs::write(&path, b"data").unwrap();
        let index = StorageIndex::open(config(dir.path())).unwrap();
        let old_time = now() - chrono::Duration::days(100);
        index.register("camera1", "old.raw", &path, old_time).unwrap();
        index.finalize("camera1", 4, old_time).unwrap();

        let report = index.cleanup(30, now()).unwrap();
        assert_eq!(report.files_removed, 1);
        assert!(!path.exists());
    }

    #[test]
    fn verify_integrity_drops_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.raw");
        let index = StorageIndex::open(config(dir.path())).unwrap();
        index.register("camera1", "gone.raw", &path, now()).unwrap();
        let report = index.verify_integrity().unwrap();
        assert_eq!(report.missing_files_removed, 1);
        assert!(index.list(&FileListFilter::default()).is_empty());
    }
}
