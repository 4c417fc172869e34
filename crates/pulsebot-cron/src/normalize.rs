//! Permissive normalization of job input at the command boundary.
//!
//! Callers (CLI, tools, RPC) hand in loosely-shaped JSON. One pass here
//! accepts the legacy aliases (`jobId`, `atMs`, a `cron` expression key),
//! strips fields callers must never set, and sanitizes identifiers — so the
//! typed model and the lifecycle manager never see the legacy shapes.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::types::CronError;

/// Longest accepted agent id after sanitization.
pub const MAX_AGENT_ID_LEN: usize = 64;

/// Sanitize an agent id to `[a-z0-9_-]`, at most [`MAX_AGENT_ID_LEN`]
/// chars. `None` when nothing survives.
pub fn sanitize_agent_id(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .trim()
        .chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-'))
        .take(MAX_AGENT_ID_LEN)
        .collect();
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Normalize a full job definition into the canonical object shape.
/// Fails only on structurally hopeless input; field-level validation
/// happens later against the typed draft.
pub fn normalize_job_object(input: &Value) -> Result<Map<String, Value>, CronError> {
    let mut obj = input
        .as_object()
        .cloned()
        .ok_or_else(|| CronError::invalid("job definition must be an object"))?;

    if !obj.contains_key("id") {
        if let Some(id) = obj.get("jobId").and_then(Value::as_str).map(str::to_string) {
            obj.insert("id".into(), Value::String(id));
        }
    }
    obj.remove("jobId");
    let id_missing = obj
        .get("id")
        .and_then(Value::as_str)
        .is_none_or(|s| s.trim().is_empty());
    if id_missing {
        obj.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
    }

    // Run-state and bookkeeping stamps are owned by the scheduler.
    obj.remove("state");
    obj.remove("createdAtMs");
    obj.remove("updatedAtMs");

    if let Some(name) = obj.get("name").and_then(Value::as_str) {
        obj.insert("name".into(), Value::String(name.trim().to_string()));
    }

    if let Some(schedule) = obj.get_mut("schedule") {
        normalize_schedule_object(schedule);
    }

    // Infer the session target from the payload kind when unset.
    if !obj.contains_key("sessionTarget") {
        let kind = obj
            .get("payload")
            .and_then(|p| p.get("kind"))
            .and_then(Value::as_str);
        let target = match kind {
            Some("systemEvent") => Some("main"),
            Some("agentTurn") => Some("isolated"),
            _ => None,
        };
        if let Some(target) = target {
            obj.insert("sessionTarget".into(), Value::String(target.to_string()));
        }
    }

    normalize_agent_id_field(&mut obj);
    Ok(obj)
}

/// Normalize a patch object: same aliasing as full definitions, with the
/// immutable fields stripped instead of generated.
pub fn normalize_patch_object(patch: &Value) -> Result<Map<String, Value>, CronError> {
    let mut obj = patch
        .as_object()
        .cloned()
        .ok_or_else(|| CronError::invalid("patch must be an object"))?;

    for key in ["id", "jobId", "createdAtMs", "updatedAtMs", "state"] {
        obj.remove(key);
    }

    if let Some(name) = obj.get("name").and_then(Value::as_str) {
        obj.insert("name".into(), Value::String(name.trim().to_string()));
    }
    if let Some(schedule) = obj.get_mut("schedule") {
        normalize_schedule_object(schedule);
    }
    normalize_agent_id_field(&mut obj);
    Ok(obj)
}

/// Merge a partial object patch into a draft field, RFC 7386 style:
/// `null` removes a key, anything else replaces it. A patch that switches
/// the `kind` discriminator replaces the object wholesale, since fields of
/// different kinds do not mix.
pub(crate) fn merge_object_patch(existing: &mut Value, patch: Value) {
    let Value::Object(patch_obj) = patch else {
        *existing = patch;
        return;
    };
    let Some(existing_obj) = existing.as_object_mut() else {
        *existing = Value::Object(patch_obj);
        return;
    };

    let kind_changed = matches!(
        (
            existing_obj.get("kind").and_then(Value::as_str),
            patch_obj.get("kind").and_then(Value::as_str),
        ),
        (Some(old), Some(new)) if old != new
    );
    if kind_changed {
        *existing = Value::Object(patch_obj);
        return;
    }

    for (key, value) in patch_obj {
        if value.is_null() {
            existing_obj.remove(&key);
        } else {
            existing_obj.insert(key, value);
        }
    }
}

fn normalize_schedule_object(schedule: &mut Value) {
    let Some(obj) = schedule.as_object_mut() else {
        return;
    };

    // Tolerate the old "cron" key for the expression.
    if !obj.contains_key("expr") {
        if let Some(expr) = obj.get("cron").and_then(Value::as_str).map(str::to_string) {
            obj.insert("expr".into(), Value::String(expr));
        }
    }
    obj.remove("cron");

    if !obj.contains_key("kind") {
        let kind = if obj.contains_key("at") || obj.contains_key("atMs") {
            Some("at")
        } else if obj.contains_key("everyMs") {
            Some("every")
        } else if obj.contains_key("expr") {
            Some("cron")
        } else {
            None
        };
        if let Some(kind) = kind {
            obj.insert("kind".into(), Value::String(kind.to_string()));
        }
    }
}

fn normalize_agent_id_field(obj: &mut Map<String, Value>) {
    match obj.get("agentId") {
        Some(Value::String(raw)) => match sanitize_agent_id(raw) {
            Some(clean) => {
                obj.insert("agentId".into(), Value::String(clean));
            }
            None => {
                obj.remove("agentId");
            }
        },
        Some(Value::Null) | None => {}
        Some(_) => {
            obj.remove("agentId");
        }
    }
}
