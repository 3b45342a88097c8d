use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

#[cfg(test)]
use std::io;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::AppConfig;
#[cfg(test)]
use crate::errors::AppError;
use crate::errors::AppResult;

const JOURNAL_FILE_NAME: &str = "job-events.jsonl";

/// Append-only JSONL journal of job lifecycle events. When the file would
/// exceed its byte budget it is moved to a single `.1` backup.
#[derive(Clone)]
pub struct JobJournal {
    enabled: bool,
    write_lock: Arc<Mutex<()>>,
    path: PathBuf,
    max_file_bytes: u64,
    #[cfg(test)]
    fault_injector: Option<Arc<TestFaultInjector>>,
}

impl JobJournal {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(JOURNAL_FILE_NAME);
        OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            enabled: config.telemetry_enabled,
            write_lock: Arc::new(Mutex::new(())),
            path,
            max_file_bytes: config.telemetry_buffer_max_bytes.max(1),
            #[cfg(test)]
            fault_injector: None,
        })
    }

    pub fn record(&self, name: &str, trip: &str, payload: serde_json::Value) -> AppResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let mut line = serde_json::to_vec(&JournalEvent {
            name,
            trip,
            timestamp: Utc::now(),
            payload,
        })?;
        line.push(b'\n');

        let _guard = self.write_lock.lock();
        self.rotate_if_needed(line.len() as u64)?;
        self.append(&line)
    }

    /// Journal failures never affect the job being recorded.
    pub fn note(&self, name: &str, trip: &str, payload: serde_json::Value) {
        if let Err(err) = self.record(name, trip, payload) {
            warn!(?err, event = name, trip = %trip, "failed to journal job event");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".1");
        PathBuf::from(name)
    }

    fn append(&self, line: &[u8]) -> AppResult<()> {
        #[cfg(test)]
        if self
            .fault_injector
            .as_ref()
            .map(|hooks| hooks.take_disk_full())
            .unwrap_or(false)
        {
            return Err(AppError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "simulated disk full",
            )));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line)?;
        file.flush()?;
        Ok(())
    }

    fn rotate_if_needed(&self, incoming_bytes: u64) -> AppResult<()> {
        let current_size = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if current_size == 0 || current_size + incoming_bytes <= self.max_file_bytes {
            return Ok(());
        }
        fs::rename(&self.path, self.backup_path())?;
        Ok(())
    }
}

#[derive(Serialize)]
struct JournalEvent<'a> {
    name: &'a str,
    trip: &'a str,
    timestamp: DateTime<Utc>,
    payload: serde_json::Value,
}

#[cfg(test)]
#[derive(Default)]
pub struct TestFaultInjector {
    disk_full: AtomicBool,
}

#[cfg(test)]
impl TestFaultInjector {
    pub fn fail_next_disk_full(&self) {
        self.disk_full.store(true, Ordering::SeqCst);
    }

    fn take_disk_full(&self) -> bool {
        self.disk_full.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
impl JobJournal {
    pub fn enable_test_hooks(&mut self) -> Arc<TestFaultInjector> {
        let hooks = Arc::new(TestFaultInjector::default());
        self.fault_injector = Some(hooks.clone());
        hooks
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::config::test_config;

    #[test]
    fn writes_events_to_disk() {
        let dir = tempdir().unwrap();
        let journal = JobJournal::new(dir.path(), &test_config(dir.path())).unwrap();
        journal
            .record("job_queued", "vienna", json!({ "seq": 1 }))
            .unwrap();

        let contents = fs::read_to_string(journal.path()).unwrap();
        let event: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(event["name"], "job_queued");
        assert_eq!(event["trip"], "vienna");
        assert_eq!(event["payload"]["seq"], 1);
    }

    #[test]
    fn keeps_events_across_instances() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        JobJournal::new(dir.path(), &config)
            .unwrap()
            .record("first", "a", json!({}))
            .unwrap();

        let journal = JobJournal::new(dir.path(), &config).unwrap();
        journal.record("second", "a", json!({})).unwrap();

        let contents = fs::read_to_string(journal.path()).unwrap();
        assert!(contents.contains("first"));
        assert!(contents.contains("second"));
    }

    #[test]
    fn rotates_into_single_backup() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.telemetry_buffer_max_bytes = 64;
        let journal = JobJournal::new(dir.path(), &config).unwrap();
        for idx in 0..4 {
            journal
                .record("job_finished", "vienna", json!({ "idx": idx }))
                .unwrap();
        }

        assert!(journal.backup_path().exists());
        let backups = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(JOURNAL_FILE_NAME))
            .count();
        assert_eq!(backups, 2);
        let current = fs::read_to_string(journal.path()).unwrap();
        assert_eq!(current.lines().count(), 1);
        assert!(current.contains("\"idx\":3"));
    }

    #[test]
    fn disabled_journal_writes_nothing() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.telemetry_enabled = false;
        let journal = JobJournal::new(dir.path(), &config).unwrap();
        journal.record("job_started", "vienna", json!({})).unwrap();
        journal.note("job_finished", "vienna", json!({}));
        assert_eq!(fs::metadata(journal.path()).unwrap().len(), 0);
        assert!(!journal.backup_path().exists());
    }

    #[test]
    fn write_failures_surface_from_record_but_not_note() {
        let dir = tempdir().unwrap();
        let mut journal = JobJournal::new(dir.path(), &test_config(dir.path())).unwrap();
        let hooks = journal.enable_test_hooks();

        hooks.fail_next_disk_full();
        assert!(journal.record("job_started", "vienna", json!({})).is_err());

        hooks.fail_next_disk_full();
        journal.note("job_started", "vienna", json!({}));
        journal.note("job_finished", "vienna", json!({}));
        let contents = fs::read_to_string(journal.path()).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }
}
