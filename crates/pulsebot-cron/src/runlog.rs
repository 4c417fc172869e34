//! Per-job append-only run history under `runs/<job-id>.jsonl`.
//!
//! Appends to the same log serialize in submission order; different jobs'
//! logs never block each other. Logs are pruned once they pass a size
//! threshold, keeping the most recent lines.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::store::temp_sibling;
use crate::types::{CronError, RunLogEntry};

/// Entries returned by `read` when no limit is given.
pub const DEFAULT_READ_LIMIT: usize = 200;
/// Hard ceiling on a single readback.
pub const MAX_READ_LIMIT: usize = 5_000;

#[derive(Debug, Clone)]
pub struct RunLogOptions {
    /// File size that triggers pruning.
    pub max_bytes: u64,
    /// Lines retained by a prune.
    pub keep_lines: usize,
}

impl Default for RunLogOptions {
    fn default() -> Self {
        Self {
            max_bytes: 2 * 1024 * 1024,
            keep_lines: 2_000,
        }
    }
}

/// Run-history files for one store directory.
pub struct RunLog {
    dir: PathBuf,
    options: RunLogOptions,
    /// Per-path write locks. Owned here rather than in a process-wide
    /// registry so independent stores never contend.
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl RunLog {
    pub fn new(store_dir: &Path, options: RunLogOptions) -> Self {
        Self {
            dir: store_dir.join("runs"),
            options,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a job's log path. The id is sanitized and the result must
    /// stay strictly inside the runs directory.
    fn log_path(&self, job_id: &str) -> Result<PathBuf, CronError> {
        let sanitized: String = job_id
            .chars()
            .filter(|c| !matches!(c, '/' | '\\' | '\0'))
            .collect();
        let sanitized = sanitized.trim();
        if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
            return Err(CronError::PathEscape);
        }
        let candidate = self.dir.join(format!("{sanitized}.jsonl"));
        let escapes = candidate
            .components()
            .any(|c| matches!(c, Component::ParentDir))
            || !candidate.starts_with(&self.dir);
        if escapes {
            return Err(CronError::PathEscape);
        }
        Ok(candidate)
    }

    async fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append one entry, pruning afterwards if the file grew past the
    /// configured threshold.
    pub async fn append(&self, entry: &RunLogEntry) -> Result<(), CronError> {
        let path = self.log_path(&entry.job_id)?;
        let lock = self.lock_for(&path).await;
        let _guard = lock.lock().await;

        fs::create_dir_all(&self.dir)?;
        let line = serde_json::to_string(entry)?;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{line}")?;
        drop(file);

        let len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        if len > self.options.max_bytes {
            self.prune(&path)?;
        }
        Ok(())
    }

    /// Read a job's history, most recent first. Blank and malformed lines
    /// are skipped; only well-formed finished-run records are returned.
    pub async fn read(
        &self,
        job_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<RunLogEntry>, CronError> {
        let path = self.log_path(job_id)?;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let limit = limit.unwrap_or(DEFAULT_READ_LIMIT).min(MAX_READ_LIMIT);
        let mut out = Vec::new();
        for line in raw.lines().rev() {
            if out.len() >= limit {
                break;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(line) else {
                continue;
            };
            if !is_finished_record(&value) {
                continue;
            }
            if value.get("jobId").and_then(Value::as_str) != Some(job_id) {
                continue;
            }
            if let Ok(entry) = serde_json::from_value::<RunLogEntry>(value) {
                out.push(entry);
            }
        }
        Ok(out)
    }

    fn prune(&self, path: &Path) -> Result<(), CronError> {
        let raw = fs::read_to_string(path)?;
        let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
        let keep = self.options.keep_lines.min(lines.len());
        let tail = &lines[lines.len() - keep..];

        let tmp = temp_sibling(path);
        let mut data = tail.join("\n");
        data.push('\n');
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn is_finished_record(value: &Value) -> bool {
    value.get("action").and_then(Value::as_str) == Some("finished")
        && value
            .get("jobId")
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty())
        && value.get("ts").is_some_and(Value::is_number)
        && match value.get("status") {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => matches!(s.as_str(), "ok" | "error" | "skipped"),
            _ => false,
        }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunStatus;

    fn entry(job_id: &str, ts: i64) -> RunLogEntry {
        RunLogEntry::finished(ts, job_id, RunStatus::Ok)
    }

    #[tokio::test]
    async fn test_append_then_read_most_recent_first() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path(), RunLogOptions::default());

        for ts in [1, 2, 3] {
            log.append(&entry("abc", ts)).await.unwrap();
        }

        let entries = log.read("abc", Some(2)).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ts, 3);
        assert_eq!(entries[1].ts, 2);
    }

    #[tokio::test]
    async fn test_read_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path(), RunLogOptions::default());
        assert!(log.read("nobody", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_path_separators_are_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path(), RunLogOptions::default());

        log.append(&entry("x/y", 1)).await.unwrap();
        assert!(dir.path().join("runs").join("xy.jsonl").exists());
    }

    #[tokio::test]
    async fn test_empty_and_dot_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path(), RunLogOptions::default());

        let err = log.append(&entry("", 1)).await.unwrap_err();
        assert!(matches!(err, CronError::PathEscape));
        let err = log.append(&entry("..", 1)).await.unwrap_err();
        assert!(matches!(err, CronError::PathEscape));
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path(), RunLogOptions::default());

        log.append(&entry("abc", 1)).await.unwrap();
        let path = dir.path().join("runs").join("abc.jsonl");
        let mut raw = fs::read_to_string(&path).unwrap();
        raw.push_str("not json\n\n{\"action\":\"queued\",\"jobId\":\"abc\",\"ts\":2}\n");
        fs::write(&path, raw).unwrap();
        log.append(&entry("abc", 3)).await.unwrap();

        let entries = log.read("abc", None).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ts, 3);
        assert_eq!(entries[1].ts, 1);
    }

    #[tokio::test]
    async fn test_prune_keeps_most_recent_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(
            dir.path(),
            RunLogOptions {
                max_bytes: 1,
                keep_lines: 2,
            },
        );

        for ts in 1..=5 {
            log.append(&entry("abc", ts)).await.unwrap();
        }

        // Every append tripped the prune, so only the last lines remain.
        let entries = log.read("abc", None).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ts, 5);
        assert_eq!(entries[1].ts, 4);
    }

    #[tokio::test]
    async fn test_jobs_do_not_share_logs() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::new(dir.path(), RunLogOptions::default());

        log.append(&entry("one", 1)).await.unwrap();
        log.append(&entry("two", 2)).await.unwrap();

        let one = log.read("one", None).await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].job_id, "one");
    }
}
