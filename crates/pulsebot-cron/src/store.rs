//! Crash-safe persistence of the job list as a single JSON document.
//!
//! Loading always succeeds: a missing file is an empty store, a corrupt one
//! is preserved for forensics and replaced by an empty store, and malformed
//! entries are dropped individually. Availability over strict durability.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{CronError, CronJob, CronStoreDoc, STORE_VERSION};

/// Load the store document from `path`.
pub fn load_store(path: &Path) -> CronStoreDoc {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CronStoreDoc::default(),
        Err(e) => {
            warn!(path = %path.display(), "Failed to read cron store, starting empty: {e}");
            return CronStoreDoc::default();
        }
    };

    let value: Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(path = %path.display(), "Cron store is corrupt, starting empty: {e}");
            preserve_corrupt_copy(path);
            return CronStoreDoc::default();
        }
    };

    let raw_jobs = value
        .get("jobs")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut jobs = Vec::with_capacity(raw_jobs.len());
    for entry in raw_jobs {
        if !has_job_shape(&entry) {
            warn!(path = %path.display(), "Dropping malformed job entry from store");
            continue;
        }
        match serde_json::from_value::<CronJob>(entry) {
            Ok(mut job) => {
                job.schedule.canonicalize();
                jobs.push(job);
            }
            Err(e) => {
                warn!(path = %path.display(), "Dropping undecodable job entry: {e}");
            }
        }
    }

    CronStoreDoc {
        version: STORE_VERSION,
        jobs,
    }
}

/// Write the store document to `path` atomically: unique temp file in the
/// same directory, then rename over the target. The previous file is copied
/// to `<path>.bak` first, but only when it still parses as JSON, so a good
/// backup is never clobbered by a corrupt one.
pub fn save_store(path: &Path, store: &CronStoreDoc) -> Result<(), CronError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Legacy schedule fields never persist.
    let mut doc = store.clone();
    for job in &mut doc.jobs {
        job.schedule.canonicalize();
    }
    doc.version = STORE_VERSION;

    let tmp = temp_sibling(path);
    let data = format!("{}\n", serde_json::to_string_pretty(&doc)?);
    fs::write(&tmp, data)?;

    backup_existing(path);

    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn has_job_shape(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    obj.get("id")
        .and_then(Value::as_str)
        .is_some_and(|s| !s.trim().is_empty())
        && obj.get("name").and_then(Value::as_str).is_some()
        && obj.get("schedule").is_some_and(Value::is_object)
        && obj.get("payload").is_some_and(Value::is_object)
}

pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("store"));
    name.push(format!(".{}.tmp", Uuid::new_v4()));
    path.with_file_name(name)
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut full: OsString = path.as_os_str().to_os_string();
    full.push(suffix);
    PathBuf::from(full)
}

fn preserve_corrupt_copy(path: &Path) {
    let corrupt = suffixed(path, ".corrupt");
    if let Err(e) = fs::copy(path, &corrupt) {
        debug!(path = %path.display(), "Failed to preserve corrupt store copy: {e}");
    }
}

fn backup_existing(path: &Path) {
    match fs::read_to_string(path) {
        Ok(existing) => {
            if serde_json::from_str::<Value>(&existing).is_ok() {
                let bak = suffixed(path, ".bak");
                if let Err(e) = fs::copy(path, &bak) {
                    warn!(path = %path.display(), "Failed to write store backup: {e}");
                }
            } else {
                warn!(path = %path.display(), "Existing store does not parse, keeping previous backup");
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(path = %path.display(), "Failed to read store for backup: {e}");
        }
    }
}
