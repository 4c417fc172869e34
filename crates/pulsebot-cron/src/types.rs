//! Persisted job model and scheduler data types.
//!
//! The on-disk schema is camelCase JSON (`jobs.json`); tagged unions carry a
//! `kind` discriminator so the session/payload pairing is enforceable before
//! anything reaches the store.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use pulsebot_types::{RunStatus, WakeMode};

/// Smallest accepted fixed interval, in milliseconds. Busy-loop guard.
pub const MIN_EVERY_MS: i64 = 10_000;

/// Version stamped into every persisted store document.
pub const STORE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid job definition: {0}")]
    InvalidJob(String),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("run log path escapes the runs directory")]
    PathEscape,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CronError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidJob(msg.into())
    }
}

// ──────────────────── Schedule ────────────────────

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Schedule {
    /// One-shot absolute time.
    #[serde(rename_all = "camelCase")]
    At {
        /// ISO-8601 timestamp (canonical form).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        at: Option<String>,
        /// Legacy numeric-milliseconds form; normalized into `at` on write.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        at_ms: Option<i64>,
    },
    /// Fixed interval, aligned to an anchor rather than "now".
    #[serde(rename_all = "camelCase")]
    Every {
        every_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor_ms: Option<i64>,
    },
    /// 5-field cron expression with optional IANA timezone.
    #[serde(rename_all = "camelCase")]
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
}

// ──────────────────── Payload ────────────────────

/// What a job does when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Payload {
    /// Text injected into the main conversation session.
    #[serde(rename_all = "camelCase")]
    SystemEvent { text: String },
    /// Prompt executed as an isolated agent turn.
    #[serde(rename_all = "camelCase")]
    AgentTurn {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_seconds: Option<u32>,
        /// Legacy delivery hints, superseded by the job-level `delivery`
        /// object but still honored by the resolver.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deliver: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        best_effort_deliver: Option<bool>,
    },
}

// ──────────────────── Delivery ────────────────────

/// Whether an isolated job's output is announced to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    #[default]
    None,
    /// "deliver" is a deprecated synonym, accepted on read.
    #[serde(alias = "deliver")]
    Announce,
}

/// Modern delivery schema attached to isolated jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    #[serde(default)]
    pub mode: DeliveryMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_effort: Option<bool>,
}

/// Which schema a delivery plan was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanSource {
    Delivery,
    Payload,
}

/// Resolved announcement decision for one job. Ephemeral.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPlan {
    pub mode: DeliveryMode,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub best_effort: bool,
    pub source: PlanSource,
    pub requested: bool,
}

// ──────────────────── Job ────────────────────

/// Which session a job executes against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionTarget {
    Main,
    Isolated,
}

/// Mutable run-state bookkeeping, owned by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
}

impl JobState {
    pub fn is_empty(&self) -> bool {
        self.next_run_at_ms.is_none()
            && self.running_at_ms.is_none()
            && self.last_run_at_ms.is_none()
            && self.last_status.is_none()
    }
}

/// A scheduled job, as persisted in `jobs.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    /// Opaque unique identifier, assigned at creation.
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Defaults to true for `at` schedules when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_after_run: Option<bool>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub schedule: Schedule,
    pub session_target: SessionTarget,
    #[serde(default = "default_wake_mode")]
    pub wake_mode: WakeMode,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<Delivery>,
    /// Sanitized to `[a-z0-9_-]`, max 64 chars.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "JobState::is_empty")]
    pub state: JobState,
}

fn default_true() -> bool {
    true
}

fn default_wake_mode() -> WakeMode {
    WakeMode::NextHeartbeat
}

impl CronJob {
    /// Validate the complete job. `require_future_at` is set when the `at`
    /// schedule is new (creation, or a patch that touched the schedule);
    /// revalidating an old job whose instant already passed must not fail.
    pub fn validate(&self, now_ms: i64, require_future_at: bool) -> Result<(), CronError> {
        if self.id.trim().is_empty() {
            return Err(CronError::invalid("job id must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(CronError::invalid("job name must not be empty"));
        }

        match (self.session_target, &self.payload) {
            (SessionTarget::Main, Payload::SystemEvent { .. }) => {}
            (SessionTarget::Isolated, Payload::AgentTurn { .. }) => {}
            (SessionTarget::Main, Payload::AgentTurn { .. }) => {
                return Err(CronError::invalid(
                    "main-session jobs require a systemEvent payload",
                ));
            }
            (SessionTarget::Isolated, Payload::SystemEvent { .. }) => {
                return Err(CronError::invalid(
                    "isolated jobs require an agentTurn payload",
                ));
            }
        }

        if self.delivery.is_some() && self.session_target == SessionTarget::Main {
            return Err(CronError::invalid(
                "delivery is only valid for isolated jobs",
            ));
        }

        match &self.schedule {
            Schedule::Every { every_ms, .. } => {
                if *every_ms < MIN_EVERY_MS {
                    return Err(CronError::invalid(format!(
                        "everyMs must be at least {MIN_EVERY_MS}"
                    )));
                }
            }
            Schedule::At { .. } => {
                let at = self
                    .schedule
                    .at_instant_ms()
                    .ok_or_else(|| CronError::invalid("at timestamp is missing or unparseable"))?;
                if require_future_at && at <= now_ms {
                    return Err(CronError::invalid("at timestamp must be in the future"));
                }
            }
            Schedule::Cron { .. } => {
                // Malformed expressions degrade to "no occurrences" at
                // evaluation time rather than blocking creation.
            }
        }

        if let Payload::AgentTurn {
            timeout_seconds: Some(t),
            ..
        } = &self.payload
        {
            if !(1..=3600).contains(t) {
                return Err(CronError::invalid(
                    "timeoutSeconds must be between 1 and 3600",
                ));
            }
        }

        Ok(())
    }

    /// One-shot jobs are deleted after a successful run unless overridden.
    pub fn effective_delete_after_run(&self) -> bool {
        self.delete_after_run
            .unwrap_or(matches!(self.schedule, Schedule::At { .. }))
    }
}

// ──────────────────── Store Document ────────────────────

/// The entire persisted unit; every mutation rewrites this whole document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronStoreDoc {
    pub version: u32,
    pub jobs: Vec<CronJob>,
}

impl Default for CronStoreDoc {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            jobs: Vec::new(),
        }
    }
}

// ──────────────────── Run Log ────────────────────

/// One line of a job's append-only run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogEntry {
    pub ts: i64,
    pub job_id: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
}

impl RunLogEntry {
    pub fn finished(ts: i64, job_id: impl Into<String>, status: RunStatus) -> Self {
        Self {
            ts,
            job_id: job_id.into(),
            action: "finished".to_string(),
            status: Some(status),
            error: None,
            summary: None,
            run_at_ms: None,
            duration_ms: None,
            next_run_at_ms: None,
        }
    }
}

// ──────────────────── Projection ────────────────────

/// One projected future occurrence. Ephemeral.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectedRun {
    pub job_id: String,
    pub job_name: String,
    pub run_at_ms: i64,
}
