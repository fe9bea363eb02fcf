//! JSON file storage: the schedule set and two bounded journals.
//!
//! Every write goes to `<file>.tmp` and is renamed over the target, so a
//! crash mid-write leaves either the old file or the new one.

use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

pub const SCHEDULES_FILE: &str = "schedules.json";
pub const SKIPPED_RUNS_FILE: &str = "skipped_runs.json";
pub const HARDWARE_ERRORS_FILE: &str = "hardware_errors.json";

pub const SKIP_LOG_LIMIT: usize = 100;
pub const HARDWARE_ERROR_LOG_LIMIT: usize = 200;

/// `last_run` format: minute resolution.
pub const MINUTE_FORMAT: &str = "%Y-%m-%d %H:%M";
/// Journal and `last_skipped` timestamps.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub mins: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipSummary {
    pub time: String,
    pub humidity: f64,
    #[serde(default)]
    pub temp: Option<f64>,
}

/// One persisted schedule. Decoding is lenient so that a single bad record
/// can be rejected later without losing the rest of the file; unknown fields
/// are carried through saves untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRecord {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub start: String,
    #[serde(default)]
    pub days: Vec<String>,
    #[serde(default)]
    pub sequence: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_skipped: Option<SkipSummary>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipRecord {
    pub time: String,
    pub schedule_id: u64,
    pub schedule_name: String,
    pub humidity: f64,
    #[serde(default)]
    pub temp: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareErrorRecord {
    pub time: String,
    pub device_id: String,
    pub error_type: String,
    pub error_msg: String,
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `value` as pretty JSON via temp file + rename.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("failed to encode {}", path.display()))?;
    let tmp = tmp_path(path);
    fs::write(&tmp, &bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("failed to replace {}", path.display()));
    }
    Ok(())
}

enum Loaded<T> {
    Missing,
    Ok(T),
    Corrupt(String),
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Loaded<T> {
    match fs::read(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Loaded::Missing,
        Err(e) => Loaded::Corrupt(e.to_string()),
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(v) => Loaded::Ok(v),
            Err(e) => Loaded::Corrupt(e.to_string()),
        },
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Move a corrupt file aside as `<file>.corrupted.<timestamp>`.
fn quarantine(path: &Path) -> Option<PathBuf> {
    let mut name = path.file_name()?.to_os_string();
    name.push(format!(".corrupted.{}", Local::now().format("%Y%m%d-%H%M%S")));
    let target = path.with_file_name(name);
    match fs::rename(path, &target) {
        Ok(()) => Some(target),
        Err(e) => {
            error!(file = %path.display(), error = %e, "could not move corrupt file aside");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule store
// ---------------------------------------------------------------------------

pub struct ScheduleStore {
    path: PathBuf,
    last_good: Mutex<Vec<ScheduleRecord>>,
    /// Array elements from the last read that did not decode, with their
    /// positions. Written back untouched on every save.
    undecodable: Mutex<Vec<(usize, Value)>>,
}

impl ScheduleStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_good: Mutex::new(Vec::new()),
            undecodable: Mutex::new(Vec::new()),
        }
    }

    /// Read the schedule set. Never fails: a missing file is an empty set and
    /// an unparseable one is quarantined and replaced by the previous good
    /// set. Individual records that do not decode are skipped, not fatal.
    pub fn load(&self) -> Vec<ScheduleRecord> {
        let reason = match read_json::<Value>(&self.path) {
            Loaded::Missing => return Vec::new(),
            Loaded::Ok(Value::Array(elements)) => return self.decode(elements),
            Loaded::Ok(other) => format!("expected a JSON array, found {}", json_kind(&other)),
            Loaded::Corrupt(reason) => reason,
        };

        let moved = quarantine(&self.path);
        let previous = self
            .last_good
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        error!(
            file = %self.path.display(),
            error = %reason,
            moved_to = ?moved,
            restored = previous.len(),
            "schedule file corrupt"
        );
        if !previous.is_empty() {
            if let Err(e) = self.write(&previous) {
                error!(error = %format!("{e:#}"), "could not restore previous schedules");
            }
        }
        previous
    }

    fn decode(&self, elements: Vec<Value>) -> Vec<ScheduleRecord> {
        let mut records = Vec::with_capacity(elements.len());
        let mut undecodable = Vec::new();
        for (index, element) in elements.into_iter().enumerate() {
            match ScheduleRecord::deserialize(&element) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(
                        file = %self.path.display(),
                        index,
                        id = ?element.get("id"),
                        error = %e,
                        "skipping undecodable schedule record"
                    );
                    undecodable.push((index, element));
                }
            }
        }
        *self.undecodable.lock().unwrap_or_else(PoisonError::into_inner) = undecodable;
        *self.last_good.lock().unwrap_or_else(PoisonError::into_inner) = records.clone();
        records
    }

    pub fn save(&self, records: &[ScheduleRecord]) -> Result<()> {
        self.write(records)?;
        *self.last_good.lock().unwrap_or_else(PoisonError::into_inner) = records.to_vec();
        Ok(())
    }

    fn write(&self, records: &[ScheduleRecord]) -> Result<()> {
        let mut elements = records
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .context("failed to encode schedules")?;
        for (index, raw) in self
            .undecodable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            elements.insert((*index).min(elements.len()), raw.clone());
        }
        write_json_atomic(&self.path, &elements)
    }

    /// Stamp `last_run` on schedule `id` and persist the whole set.
    pub fn mark_last_run(
        &self,
        records: &mut [ScheduleRecord],
        id: u64,
        at: NaiveDateTime,
    ) -> Result<()> {
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .with_context(|| format!("schedule {id} not found"))?;
        record.last_run = Some(at.format(MINUTE_FORMAT).to_string());
        self.save(records)
    }

    pub fn mark_skipped(
        &self,
        records: &mut [ScheduleRecord],
        id: u64,
        summary: SkipSummary,
    ) -> Result<()> {
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .with_context(|| format!("schedule {id} not found"))?;
        record.last_skipped = Some(summary);
        self.save(records)
    }
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Append-only JSON array file trimmed to the newest `limit` entries.
pub struct Journal<T> {
    path: PathBuf,
    limit: usize,
    // Serializes read-modify-write cycles.
    lock: Mutex<()>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned + Clone> Journal<T> {
    pub fn new(path: PathBuf, limit: usize) -> Self {
        Self {
            path,
            limit,
            lock: Mutex::new(()),
            _record: PhantomData,
        }
    }

    fn read_all(&self) -> Vec<T> {
        match read_json::<Vec<T>>(&self.path) {
            Loaded::Ok(records) => records,
            Loaded::Missing => Vec::new(),
            Loaded::Corrupt(reason) => {
                let moved = quarantine(&self.path);
                warn!(
                    file = %self.path.display(),
                    error = %reason,
                    moved_to = ?moved,
                    "journal corrupt, starting empty"
                );
                Vec::new()
            }
        }
    }

    pub fn append(&self, record: T) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = self.read_all();
        records.push(record);
        if records.len() > self.limit {
            let excess = records.len() - self.limit;
            records.drain(..excess);
        }
        write_json_atomic(&self.path, &records)
    }

    /// Up to `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<T> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_all().into_iter().rev().take(limit).collect()
    }
}

// ---------------------------------------------------------------------------
// Storage bundle
// ---------------------------------------------------------------------------

pub struct Storage {
    pub schedules: ScheduleStore,
    pub skipped_runs: Journal<SkipRecord>,
    pub hardware_errors: Journal<HardwareErrorRecord>,
}

impl Storage {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create data dir {}", dir.display()))?;
        info!(data_dir = %dir.display(), "storage ready");
        Ok(Self {
            schedules: ScheduleStore::new(dir.join(SCHEDULES_FILE)),
            skipped_runs: Journal::new(dir.join(SKIPPED_RUNS_FILE), SKIP_LOG_LIMIT),
            hardware_errors: Journal::new(dir.join(HARDWARE_ERRORS_FILE), HARDWARE_ERROR_LOG_LIMIT),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    const MORNING_LAWN: &str = r#"[
      {
        "id": 1,
        "name": "Morning Lawn",
        "start": "06:00",
        "days": ["Mon", "Wed", "Fri"],
        "sequence": [{"key": "R1", "mins": 10}, {"key": "R2", "mins": 5}],
        "created": 1735700000,
        "color": "green"
      }
    ]"#;

    fn corrupt_files(dir: &Path, stem: &str) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(&format!("{stem}.corrupted."))
            })
            .count()
    }

    // -- Schedules --------------------------------------------------------

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::new(dir.path().join(SCHEDULES_FILE));
        assert!(store.load().is_empty());
    }

    #[test]
    fn load_and_save_preserve_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SCHEDULES_FILE);
        fs::write(&path, MORNING_LAWN).unwrap();
        let store = ScheduleStore::new(path.clone());

        let mut records = store.load();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Morning Lawn");
        assert_eq!(records[0].sequence[1], StepRecord { key: "R2".into(), mins: 5 });

        let at = NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(6, 0, 5)
            .unwrap();
        store.mark_last_run(&mut records, 1, at).unwrap();

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw[0]["color"], json!("green"));
        assert_eq!(raw[0]["last_run"], json!("2025-01-01 06:00"));
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn corrupt_file_falls_back_to_previous_good() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SCHEDULES_FILE);
        fs::write(&path, MORNING_LAWN).unwrap();
        let store = ScheduleStore::new(path.clone());
        assert_eq!(store.load().len(), 1);

        fs::write(&path, "[{\"id\": 1, \"name\": ").unwrap();
        let records = store.load();
        assert_eq!(records.len(), 1, "previous good set returned");
        assert_eq!(corrupt_files(dir.path(), SCHEDULES_FILE), 1);

        // Restored on disk, so the next load reads it normally.
        let again: Vec<ScheduleRecord> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(again[0].name, "Morning Lawn");
    }

    #[test]
    fn bad_record_skipped_and_kept_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SCHEDULES_FILE);
        let set = json!([
            {"id": 7, "name": "Broken", "start": "05:00", "days": ["Tue"],
             "sequence": [{"key": "R1", "mins": -5}]},
            {"id": 1, "name": "Morning Lawn", "start": "06:00", "days": ["Wed"],
             "sequence": [{"key": "R1", "mins": 10}]}
        ]);
        fs::write(&path, set.to_string()).unwrap();
        let store = ScheduleStore::new(path.clone());

        let mut records = store.load();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Morning Lawn");
        assert!(path.exists());
        assert_eq!(corrupt_files(dir.path(), SCHEDULES_FILE), 0);

        let at = NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(6, 0, 5)
            .unwrap();
        store.mark_last_run(&mut records, 1, at).unwrap();

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw.as_array().unwrap().len(), 2);
        assert_eq!(raw[0], set[0]);
        assert_eq!(raw[1]["last_run"], json!("2025-01-01 06:00"));
        assert_eq!(store.load().len(), 1);
    }

    #[test]
    fn corrupt_file_without_history_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SCHEDULES_FILE);
        fs::write(&path, "{\"not\": \"a list\"}").unwrap();
        let store = ScheduleStore::new(path.clone());

        assert!(store.load().is_empty());
        assert!(!path.exists());
        assert_eq!(corrupt_files(dir.path(), SCHEDULES_FILE), 1);
    }

    #[test]
    fn mark_skipped_unknown_id_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::new(dir.path().join(SCHEDULES_FILE));
        let summary = SkipSummary {
            time: "2025-01-01 06:00:05".into(),
            humidity: 97.0,
            temp: None,
        };
        assert!(store.mark_skipped(&mut [], 7, summary).is_err());
    }

    // -- Journals ---------------------------------------------------------

    fn hw(n: usize) -> HardwareErrorRecord {
        HardwareErrorRecord {
            time: format!("2025-01-01 06:{:02}:00", n % 60),
            device_id: format!("R{n}"),
            error_type: "timeout".into(),
            error_msg: format!("error {n}"),
        }
    }

    #[test]
    fn journal_is_bounded_and_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let journal: Journal<HardwareErrorRecord> = Journal::new(dir.path().join("hw.json"), 5);
        for n in 0..8 {
            journal.append(hw(n)).unwrap();
        }

        let all = journal.recent(100);
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].device_id, "R7");
        assert_eq!(all[4].device_id, "R3");

        let two = journal.recent(2);
        assert_eq!(two.len(), 2);
        assert_eq!(two[1].device_id, "R6");
    }

    #[test]
    fn corrupt_journal_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SKIPPED_RUNS_FILE);
        fs::write(&path, "garbage").unwrap();
        let journal: Journal<SkipRecord> = Journal::new(path, SKIP_LOG_LIMIT);

        journal
            .append(SkipRecord {
                time: "2025-01-01 06:00:05".into(),
                schedule_id: 1,
                schedule_name: "Morning Lawn".into(),
                humidity: 97.0,
                temp: Some(18.5),
            })
            .unwrap();
        assert_eq!(journal.recent(10).len(), 1);
        assert_eq!(corrupt_files(dir.path(), SKIPPED_RUNS_FILE), 1);
    }

    #[test]
    fn storage_open_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("nested/data");
        let storage = Storage::open(&data).unwrap();
        assert!(data.is_dir());
        assert!(storage.hardware_errors.recent(50).is_empty());
    }
}
