//! Per-file translation progress that survives restarts.
//!
//! Records are written whole to a temporary file next to the target, synced,
//! then renamed over it, so a reader sees either the old or the new record.

use crate::error::CheckpointError;
use crate::model::TranslationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};

/// Progress of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub file_id: String,
    /// Hash of the segmentation the unit ids refer to.
    pub fingerprint: String,
    pub total_units: usize,
    /// Ids that translated successfully; these are never sent again.
    pub completed: BTreeSet<String>,
    /// Latest result per id, failed ones included.
    pub results_by_id: BTreeMap<String, TranslationResult>,
    pub last_updated: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Empty record stamped with the current time.
    pub fn new(file_id: &str, fingerprint: &str, total_units: usize) -> Self {
        Self {
            file_id: file_id.to_string(),
            fingerprint: fingerprint.to_string(),
            total_units,
            completed: BTreeSet::new(),
            results_by_id: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }

    /// True once every unit succeeded.
    pub fn is_complete(&self) -> bool {
        self.completed.len() >= self.total_units
    }

    /// Fold a result in. A completed id keeps its successful result.
    fn apply(&mut self, result: &TranslationResult) {
        if self.completed.contains(&result.id) {
            return;
        }
        if result.is_success() {
            self.completed.insert(result.id.clone());
        }
        self.results_by_id.insert(result.id.clone(), result.clone());
    }
}

/// Durable storage of [`CheckpointRecord`]s keyed by file id.
///
/// Writes for one file id are serialized; different files are independent.
pub trait CheckpointStore: Send + Sync {
    fn load(&self, file_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError>;

    /// Return the stored record when it matches `fingerprint`, otherwise start
    /// (and persist) a fresh one.
    fn begin(
        &self,
        file_id: &str,
        fingerprint: &str,
        total_units: usize,
    ) -> Result<CheckpointRecord, CheckpointError>;

    /// Durably record a batch of results before returning.
    fn record_chunk(
        &self,
        file_id: &str,
        results: &[TranslationResult],
    ) -> Result<(), CheckpointError>;

    fn record_completed(
        &self,
        file_id: &str,
        result: TranslationResult,
    ) -> Result<(), CheckpointError> {
        self.record_chunk(file_id, std::slice::from_ref(&result))
    }

    fn is_complete(&self, file_id: &str) -> Result<bool, CheckpointError> {
        Ok(self.load(file_id)?.is_some_and(|r| r.is_complete()))
    }

    fn remove(&self, file_id: &str) -> Result<(), CheckpointError>;
}

type Slot = Arc<Mutex<Option<CheckpointRecord>>>;

/// One `<file_id>.checkpoint` JSON document per file in a directory.
pub struct JsonCheckpointStore {
    dir: PathBuf,
    slots: Mutex<HashMap<String, Slot>>,
}

impl JsonCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, file_id: &str) -> PathBuf {
        let safe: String = file_id
            .chars()
            .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
            .collect();
        self.dir.join(format!("{safe}.checkpoint"))
    }

    /// The lock guarding one file's record.
    fn slot(&self, file_id: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(file_id.to_string()).or_default().clone()
    }

    fn read(&self, file_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let path = self.path_for(file_id);
        trace!("read checkpoint path={}", path.display());
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CheckpointError::Io {
                    file_id: file_id.to_string(),
                    source,
                })
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| CheckpointError::Corrupt {
                file_id: file_id.to_string(),
                source,
            })
    }

    fn write(&self, record: &CheckpointRecord) -> Result<(), CheckpointError> {
        let path = self.path_for(&record.file_id);
        let io_err = |source| CheckpointError::Io {
            file_id: record.file_id.clone(),
            source,
        };
        let text = serde_json::to_vec_pretty(record).map_err(|e| io_err(e.into()))?;
        write_atomic(&path, &text).map_err(io_err)?;
        debug!(
            "saved checkpoint {} ({}/{} units)",
            path.display(),
            record.completed.len(),
            record.total_units
        );
        Ok(())
    }
}

impl CheckpointStore for JsonCheckpointStore {
    fn load(&self, file_id: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let slot = self.slot(file_id);
        let mut cached = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if cached.is_none() {
            *cached = self.read(file_id)?;
        }
        Ok(cached.clone())
    }

    fn begin(
        &self,
        file_id: &str,
        fingerprint: &str,
        total_units: usize,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let slot = self.slot(file_id);
        let mut cached = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let existing = match cached.take() {
            Some(record) => Some(record),
            None => match self.read(file_id) {
                Ok(record) => record,
                Err(CheckpointError::Corrupt { source, .. }) => {
                    warn!("discarding unreadable checkpoint for {file_id}: {source}");
                    None
                }
                Err(e) => return Err(e),
            },
        };
        if let Some(record) = existing {
            if record.fingerprint == fingerprint && record.total_units == total_units {
                *cached = Some(record.clone());
                return Ok(record);
            }
            warn!("checkpoint for {file_id} belongs to different input, starting over");
        }
        let record = CheckpointRecord::new(file_id, fingerprint, total_units);
        self.write(&record)?;
        *cached = Some(record.clone());
        Ok(record)
    }

    fn record_chunk(
        &self,
        file_id: &str,
        results: &[TranslationResult],
    ) -> Result<(), CheckpointError> {
        let slot = self.slot(file_id);
        let mut cached = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let mut record = match cached.clone() {
            Some(record) => record,
            None => self.read(file_id)?.ok_or_else(|| CheckpointError::Io {
                file_id: file_id.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no checkpoint started"),
            })?,
        };
        for result in results {
            record.apply(result);
        }
        record.last_updated = Utc::now();
        self.write(&record)?;
        *cached = Some(record);
        Ok(())
    }

    fn remove(&self, file_id: &str) -> Result<(), CheckpointError> {
        let slot = self.slot(file_id);
        let mut cached = slot.lock().unwrap_or_else(PoisonError::into_inner);
        match fs::remove_file(self.path_for(file_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(CheckpointError::Io {
                    file_id: file_id.to_string(),
                    source,
                })
            }
        }
        *cached = None;
        debug!("removed checkpoint for {file_id}");
        Ok(())
    }
}

/// Replace `path` with `bytes` so that readers never observe a partial file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    // The rename is only durable once the directory entry is flushed.
    #[cfg(unix)]
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn progress_survives_a_new_store_instance() {
        let dir = tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path());
        assert!(store.load("movie.srt").unwrap().is_none());
        store.begin("movie.srt", "fp", 3).unwrap();
        store
            .record_chunk(
                "movie.srt",
                &[
                    TranslationResult::success("tu-00001", "um"),
                    TranslationResult::success("tu-00002", "dois"),
                ],
            )
            .unwrap();

        let reopened = JsonCheckpointStore::new(dir.path());
        let record = reopened.begin("movie.srt", "fp", 3).unwrap();
        assert_eq!(record.completed.len(), 2);
        assert_eq!(record.results_by_id["tu-00002"].translated_text, "dois");
        assert!(!reopened.is_complete("movie.srt").unwrap());
        reopened
            .record_completed("movie.srt", TranslationResult::success("tu-00003", "três"))
            .unwrap();
        assert!(reopened.is_complete("movie.srt").unwrap());
    }

    #[test]
    fn failed_results_are_kept_but_not_completed() {
        let dir = tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path());
        store.begin("a", "fp", 1).unwrap();
        store
            .record_completed("a", TranslationResult::failed("tu-00001", "empty translation"))
            .unwrap();
        let record = store.load("a").unwrap().unwrap();
        assert!(record.completed.is_empty());
        assert!(!record.results_by_id["tu-00001"].is_success());

        store
            .record_completed("a", TranslationResult::success("tu-00001", "ok"))
            .unwrap();
        store
            .record_completed("a", TranslationResult::failed("tu-00001", "late failure"))
            .unwrap();
        let record = store.load("a").unwrap().unwrap();
        assert!(record.is_complete());
        assert_eq!(record.results_by_id["tu-00001"].translated_text, "ok");
    }

    #[test]
    fn different_input_starts_over() {
        let dir = tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path());
        store.begin("a", "old", 1).unwrap();
        store
            .record_completed("a", TranslationResult::success("tu-00001", "x"))
            .unwrap();
        let record = JsonCheckpointStore::new(dir.path())
            .begin("a", "new", 1)
            .unwrap();
        assert!(record.completed.is_empty());
        assert_eq!(record.fingerprint, "new");
    }

    #[test]
    fn corrupt_record_is_never_read_as_valid() {
        let dir = tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path());
        fs::write(store.path_for("a"), "{\"file_id\": \"a\", \"tot").unwrap();
        assert!(matches!(
            store.load("a"),
            Err(CheckpointError::Corrupt { .. })
        ));
        let fresh = JsonCheckpointStore::new(dir.path()).begin("a", "fp", 2).unwrap();
        assert!(fresh.completed.is_empty());
    }

    #[test]
    fn unwritable_directory_is_an_io_error() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "x").unwrap();
        let store = JsonCheckpointStore::new(&blocker);
        assert!(matches!(
            store.begin("a", "fp", 1),
            Err(CheckpointError::Io { .. })
        ));
    }

    #[test]
    fn recording_without_begin_fails() {
        let dir = tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path());
        assert!(store
            .record_completed("a", TranslationResult::success("tu-00001", "x"))
            .is_err());
    }

    #[test]
    fn concurrent_writers_to_one_file_lose_nothing() {
        let dir = tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path());
        store.begin("shared", "fp", 40).unwrap();
        std::thread::scope(|s| {
            for t in 0..4 {
                let store = &store;
                s.spawn(move || {
                    for i in 0..10 {
                        let id = format!("tu-{t}-{i}");
                        store
                            .record_completed("shared", TranslationResult::success(id, "x"))
                            .unwrap();
                    }
                });
            }
        });
        let record = JsonCheckpointStore::new(dir.path())
            .load("shared")
            .unwrap()
            .unwrap();
        assert_eq!(record.completed.len(), 40);
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn remove_forgets_the_record() {
        let dir = tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path());
        store.begin("a", "fp", 1).unwrap();
        store.remove("a").unwrap();
        assert!(store.load("a").unwrap().is_none());
        store.remove("a").unwrap();
    }

    #[test]
    fn file_ids_with_separators_stay_in_the_directory() {
        let store = JsonCheckpointStore::new("/tmp/ckpt");
        assert_eq!(
            store.path_for("season1/ep1.srt"),
            PathBuf::from("/tmp/ckpt/season1_ep1.srt.checkpoint")
        );
    }

    #[test]
    fn atomic_write_into_a_new_directory_leaves_only_the_target() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("nested/deeper/out.srt");
        write_atomic(&target, b"first").unwrap();
        write_atomic(&target, b"second").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"second");
        let names: Vec<_> = fs::read_dir(target.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("out.srt")]);
    }
}
