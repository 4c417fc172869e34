//! Job lifecycle manager — creation, patching, due detection, stuck-run
//! recovery, and the scheduler tick tying store, engine, run log, and
//! executor together.
//!
//! All store mutation goes through one `tokio::sync::Mutex`, so concurrent
//! requests apply in submission order and never race on the document.
//! Executor calls are awaited *outside* that lock; only the brief
//! mark-running and record-outcome steps hold it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pulsebot_types::{
    AgentTurnOutcome, AgentTurnRequest, ChannelMessage, RunStatus, SystemEventRequest, WakeMode,
};

use crate::delivery::resolve_delivery_plan_with;
use crate::executor::CronExecutor;
use crate::normalize;
use crate::now_ms;
use crate::runlog::{RunLog, RunLogOptions};
use crate::schedule::compute_next_run;
use crate::store::{load_store, save_store};
use crate::types::{
    CronError, CronJob, CronStoreDoc, JobState, Payload, ProjectedRun, RunLogEntry, Schedule,
    SessionTarget,
};

/// A running marker older than this is presumed to come from a crashed
/// process and is cleared on the next recompute.
pub const STUCK_RUN_TIMEOUT_MS: i64 = 2 * 60 * 60 * 1000;

/// Shortest sleep between scheduler ticks.
const MIN_TICK_SLEEP_MS: i64 = 250;

#[derive(Debug, Clone)]
pub struct CronServiceSettings {
    /// Path of the `jobs.json` document. Run logs live next to it under
    /// `runs/`.
    pub store_path: PathBuf,
    pub run_log: RunLogOptions,
    pub stuck_run_timeout_ms: i64,
    /// Upper bound on the sleep between ticks.
    pub poll_ceiling_ms: i64,
    /// Channel names jobs may announce to.
    pub known_channels: Vec<String>,
}

impl CronServiceSettings {
    /// Settings rooted at a cron store directory.
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_path: store_dir.into().join("jobs.json"),
            run_log: RunLogOptions::default(),
            stuck_run_timeout_ms: STUCK_RUN_TIMEOUT_MS,
            poll_ceiling_ms: 60_000,
            known_channels: crate::delivery::DEFAULT_KNOWN_CHANNELS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Snapshot summary for the `status` command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronStatus {
    pub store_path: String,
    pub jobs: usize,
    pub enabled_jobs: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_wake_at_ms: Option<i64>,
}

/// `forced` is used by manual run requests and wins over everything else.
pub fn is_job_due(job: &CronJob, now_ms: i64, forced: bool) -> bool {
    if forced {
        return true;
    }
    job.enabled && job.state.next_run_at_ms.is_some_and(|next| now_ms >= next)
}

/// Earliest pending next-run across enabled jobs; sizes the host's sleep.
pub fn next_wake(jobs: &[CronJob]) -> Option<i64> {
    jobs.iter()
        .filter(|j| j.enabled)
        .filter_map(|j| j.state.next_run_at_ms)
        .min()
}

/// The scheduler. One instance owns the store file.
pub struct CronService {
    settings: CronServiceSettings,
    executor: Arc<dyn CronExecutor>,
    run_log: RunLog,
    store: Mutex<CronStoreDoc>,
}

impl CronService {
    /// Load the store (never fails; corruption degrades to an empty store)
    /// and build the service around it.
    pub fn load(settings: CronServiceSettings, executor: Arc<dyn CronExecutor>) -> Self {
        let store = load_store(&settings.store_path);
        let store_dir = settings
            .store_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let run_log = RunLog::new(&store_dir, settings.run_log.clone());
        info!(
            path = %settings.store_path.display(),
            jobs = store.jobs.len(),
            "Cron store loaded"
        );
        Self {
            settings,
            executor,
            run_log,
            store: Mutex::new(store),
        }
    }

    // ─── Job CRUD ───────────────────────────────────

    /// Create a job from loosely-shaped input. Everything is validated on a
    /// draft first; nothing is stored unless the whole definition is good.
    pub async fn create_job(&self, input: &Value) -> Result<CronJob, CronError> {
        let now = now_ms();
        let mut obj = normalize::normalize_job_object(input)?;
        obj.insert("createdAtMs".into(), now.into());
        obj.insert("updatedAtMs".into(), now.into());

        let mut job: CronJob = serde_json::from_value(Value::Object(obj))
            .map_err(|e| CronError::invalid(e.to_string()))?;
        job.schedule.canonicalize();
        if job.delete_after_run.is_none() && matches!(job.schedule, Schedule::At { .. }) {
            job.delete_after_run = Some(true);
        }
        job.state = JobState::default();
        job.validate(now, true)?;
        job.state.next_run_at_ms = if job.enabled {
            compute_next_run(&job, now)
        } else {
            None
        };

        let mut store = self.store.lock().await;
        if store.jobs.iter().any(|j| j.id == job.id) {
            return Err(CronError::invalid(format!("duplicate job id: {}", job.id)));
        }
        store.jobs.push(job.clone());
        if let Err(e) = save_store(&self.settings.store_path, &store) {
            store.jobs.pop();
            return Err(e);
        }
        info!(job_id = %job.id, name = %job.name, "Cron job created");
        Ok(job)
    }

    /// Apply a partial patch. The existing job is deep-cloned into a draft,
    /// the patch is merged (payload/delivery field-by-field), the complete
    /// draft is revalidated, and only then does it replace the stored job —
    /// the store never observes an invalid intermediate state.
    pub async fn apply_job_patch(&self, id: &str, patch: &Value) -> Result<CronJob, CronError> {
        let now = now_ms();
        let patch_obj = normalize::normalize_patch_object(patch)?;

        let mut store = self.store.lock().await;
        let index = store
            .jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| CronError::NotFound(id.to_string()))?;

        let draft = patched_draft(&store.jobs[index], patch_obj, now)?;
        let previous = std::mem::replace(&mut store.jobs[index], draft.clone());
        if let Err(e) = save_store(&self.settings.store_path, &store) {
            store.jobs[index] = previous;
            return Err(e);
        }
        info!(job_id = %id, "Cron job updated");
        Ok(draft)
    }

    pub async fn remove_job(&self, id: &str) -> Result<CronJob, CronError> {
        let mut store = self.store.lock().await;
        let index = store
            .jobs
            .iter()
            .position(|j| j.id == id)
            .ok_or_else(|| CronError::NotFound(id.to_string()))?;

        let removed = store.jobs.remove(index);
        if let Err(e) = save_store(&self.settings.store_path, &store) {
            store.jobs.insert(index, removed);
            return Err(e);
        }
        info!(job_id = %id, "Cron job removed");
        Ok(removed)
    }

    pub async fn list_jobs(&self, include_disabled: bool) -> Vec<CronJob> {
        let store = self.store.lock().await;
        store
            .jobs
            .iter()
            .filter(|j| include_disabled || j.enabled)
            .cloned()
            .collect()
    }

    pub async fn get_job(&self, id: &str) -> Option<CronJob> {
        let store = self.store.lock().await;
        store.jobs.iter().find(|j| j.id == id).cloned()
    }

    // ─── Introspection ───────────────────────────────────

    pub async fn status(&self) -> CronStatus {
        let store = self.store.lock().await;
        CronStatus {
            store_path: self.settings.store_path.display().to_string(),
            jobs: store.jobs.len(),
            enabled_jobs: store.jobs.iter().filter(|j| j.enabled).count(),
            next_wake_at_ms: next_wake(&store.jobs),
        }
    }

    pub async fn next_wake_at_ms(&self) -> Option<i64> {
        let store = self.store.lock().await;
        next_wake(&store.jobs)
    }

    /// A job's run history, most recent first.
    pub async fn runs(&self, id: &str, limit: Option<usize>) -> Result<Vec<RunLogEntry>, CronError> {
        self.run_log.read(id, limit).await
    }

    /// Project enabled jobs' occurrences over the horizon.
    pub async fn project(&self, horizon_days: u32) -> Vec<ProjectedRun> {
        let jobs = {
            let store = self.store.lock().await;
            store.jobs.clone()
        };
        crate::schedule::project_future_runs(&jobs, now_ms(), horizon_days)
    }

    // ─── Scheduling ───────────────────────────────────

    /// Recompute every job's next-run time: disabled jobs are cleared, stale
    /// running markers from a presumed crash are recovered, enabled jobs get
    /// a fresh value from the engine.
    pub async fn recompute_next_runs(&self, now_ms: i64) {
        let mut store = self.store.lock().await;
        if self.recompute_locked(&mut store, now_ms) {
            if let Err(e) = save_store(&self.settings.store_path, &store) {
                warn!("Failed to persist recomputed schedule state: {e}");
            }
        }
    }

    fn recompute_locked(&self, store: &mut CronStoreDoc, now_ms: i64) -> bool {
        let mut changed = false;
        for job in &mut store.jobs {
            if let Some(running_at) = job.state.running_at_ms {
                if now_ms - running_at > self.settings.stuck_run_timeout_ms {
                    warn!(
                        job_id = %job.id,
                        running_since = running_at,
                        "Clearing stale running marker from a presumed crash"
                    );
                    job.state.running_at_ms = None;
                    changed = true;
                }
            }
            // A pending value stands until the run happens: a boundary that
            // passed between ticks fires late instead of being skipped by a
            // recompute that jumps past it.
            let next = if !job.enabled {
                None
            } else if let Some(pending) = job.state.next_run_at_ms {
                Some(pending)
            } else {
                compute_next_run(job, now_ms)
            };
            if next != job.state.next_run_at_ms {
                job.state.next_run_at_ms = next;
                changed = true;
            }
        }
        changed
    }

    /// One scheduler tick: recompute, collect due jobs, dispatch them.
    /// Returns how many jobs were dispatched.
    pub async fn tick(&self, now_ms: i64) -> usize {
        let due_jobs = {
            let mut store = self.store.lock().await;
            let mut changed = self.recompute_locked(&mut store, now_ms);

            let mut due = Vec::new();
            for job in &mut store.jobs {
                // A job still marked running is either genuinely running or
                // waiting out the stuck-run timeout; never double-dispatch.
                if job.state.running_at_ms.is_some() {
                    continue;
                }
                if is_job_due(job, now_ms, false) {
                    job.state.running_at_ms = Some(now_ms);
                    changed = true;
                    due.push(job.clone());
                }
            }
            if changed {
                if let Err(e) = save_store(&self.settings.store_path, &store) {
                    warn!("Failed to persist scheduler tick: {e}");
                }
            }
            due
        };

        let count = due_jobs.len();
        for job in due_jobs {
            self.execute_job(job).await;
        }
        count
    }

    /// Manual "run now": dispatches immediately regardless of schedule and
    /// enablement.
    pub async fn run_job(&self, id: &str) -> Result<RunLogEntry, CronError> {
        let now = now_ms();
        let job = {
            let mut store = self.store.lock().await;
            let job = store
                .jobs
                .iter_mut()
                .find(|j| j.id == id)
                .ok_or_else(|| CronError::NotFound(id.to_string()))?;
            job.state.running_at_ms = Some(now);
            let cloned = job.clone();
            if let Err(e) = save_store(&self.settings.store_path, &store) {
                warn!("Failed to persist running marker: {e}");
            }
            cloned
        };
        Ok(self.execute_job(job).await)
    }

    /// Emit an out-of-band system event through the executor.
    pub async fn wake(&self, mode: WakeMode, text: impl Into<String>) -> anyhow::Result<()> {
        self.executor
            .system_event(SystemEventRequest {
                text: text.into(),
                wake_mode: mode,
                job_id: None,
            })
            .await
    }

    /// Scheduler loop: tick, then sleep until the next wake time (bounded
    /// by the poll ceiling), until cancelled.
    pub async fn run_loop(self: Arc<Self>, cancel: CancellationToken) {
        info!("Cron scheduler started");
        loop {
            self.tick(now_ms()).await;

            let now = now_ms();
            let sleep_ms = match self.next_wake_at_ms().await {
                Some(wake) => (wake - now).clamp(MIN_TICK_SLEEP_MS, self.settings.poll_ceiling_ms),
                None => self.settings.poll_ceiling_ms,
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms as u64)) => {}
            }
        }
        info!("Cron scheduler stopped");
    }

    // ─── Execution ───────────────────────────────────

    /// Execute one job via the boundary collaborators and record the
    /// outcome. Failures are caught per job; nothing here propagates.
    async fn execute_job(&self, job: CronJob) -> RunLogEntry {
        let started = now_ms();
        info!(job_id = %job.id, name = %job.name, "Executing cron job");

        let mut outcome = match &job.payload {
            Payload::SystemEvent { text } => {
                let request = SystemEventRequest {
                    text: text.clone(),
                    wake_mode: job.wake_mode,
                    job_id: Some(job.id.clone()),
                };
                match self.executor.system_event(request).await {
                    Ok(()) => AgentTurnOutcome::ok(None, None),
                    Err(e) => AgentTurnOutcome::error(e.to_string()),
                }
            }
            Payload::AgentTurn {
                message,
                model,
                thinking,
                timeout_seconds,
                ..
            } => {
                let request = AgentTurnRequest {
                    job_id: job.id.clone(),
                    job_name: job.name.clone(),
                    message: message.clone(),
                    model: model.clone(),
                    thinking: thinking.clone(),
                    timeout_seconds: *timeout_seconds,
                    agent_id: job.agent_id.clone(),
                };
                match self.executor.agent_turn(request).await {
                    Ok(outcome) => outcome,
                    Err(e) => AgentTurnOutcome::error(e.to_string()),
                }
            }
        };

        if job.session_target == SessionTarget::Isolated && outcome.status == RunStatus::Ok {
            if let Some(text) = outcome.output_text.clone() {
                let plan = resolve_delivery_plan_with(&job, &self.settings.known_channels);
                if plan.requested {
                    let message = ChannelMessage {
                        channel: plan.channel.clone(),
                        to: plan.to.clone(),
                        text,
                        best_effort: plan.best_effort,
                    };
                    if let Err(e) = self.executor.deliver(message).await {
                        if plan.best_effort {
                            warn!(job_id = %job.id, "Best-effort delivery failed: {e}");
                        } else {
                            outcome = AgentTurnOutcome::error(format!("delivery failed: {e}"));
                        }
                    }
                }
            }
        }

        if let Some(error) = &outcome.error {
            warn!(job_id = %job.id, "Cron job failed: {error}");
        }

        let finished = now_ms();
        let next_run = self.record_outcome(&job, started, finished, &outcome).await;

        let mut entry = RunLogEntry::finished(finished, &job.id, outcome.status);
        entry.error = outcome.error.clone();
        entry.summary = outcome.summary.clone();
        entry.run_at_ms = Some(started);
        entry.duration_ms = Some(finished - started);
        entry.next_run_at_ms = next_run;
        if let Err(e) = self.run_log.append(&entry).await {
            warn!(job_id = %job.id, "Failed to append run log entry: {e}");
        }
        entry
    }

    /// Fold an execution outcome back into the store. Returns the job's new
    /// next-run time, if it still exists and has one.
    async fn record_outcome(
        &self,
        job: &CronJob,
        started: i64,
        finished: i64,
        outcome: &AgentTurnOutcome,
    ) -> Option<i64> {
        let mut store = self.store.lock().await;
        let Some(index) = store.jobs.iter().position(|j| j.id == job.id) else {
            // Removed while running; the run log still records the outcome.
            return None;
        };

        let mut next_run = None;
        let delete =
            outcome.status == RunStatus::Ok && store.jobs[index].effective_delete_after_run();
        if delete {
            info!(job_id = %job.id, "Removing one-shot job after successful run");
            store.jobs.remove(index);
        } else {
            let stored = &mut store.jobs[index];
            stored.state.running_at_ms = None;
            stored.state.last_run_at_ms = Some(started);
            stored.state.last_status = Some(outcome.status);
            stored.updated_at_ms = finished;
            stored.state.next_run_at_ms = if stored.enabled {
                compute_next_run(stored, finished)
            } else {
                None
            };
            next_run = stored.state.next_run_at_ms;
        }

        if let Err(e) = save_store(&self.settings.store_path, &store) {
            warn!("Failed to persist run outcome: {e}");
        }
        next_run
    }
}

/// Build the patched draft of a job. Pure with respect to the store.
fn patched_draft(
    existing: &CronJob,
    patch: serde_json::Map<String, Value>,
    now: i64,
) -> Result<CronJob, CronError> {
    let schedule_touched = patch.contains_key("schedule");
    let explicit_delivery = patch.contains_key("delivery");

    // Legacy payload-embedded delivery hints, captured before the merge so
    // they can be synthesized into a delivery patch below.
    let payload_hints: Option<serde_json::Map<String, Value>> = patch
        .get("payload")
        .and_then(Value::as_object)
        .map(|p| {
            p.iter()
                .filter(|(k, _)| {
                    matches!(k.as_str(), "deliver" | "channel" | "to" | "bestEffortDeliver")
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .filter(|hints: &serde_json::Map<String, Value>| !hints.is_empty());

    let mut draft_value = serde_json::to_value(existing)?;
    let Some(draft_obj) = draft_value.as_object_mut() else {
        return Err(CronError::invalid("job did not serialize to an object"));
    };

    for (key, value) in patch {
        match key.as_str() {
            "payload" | "delivery" => {
                if value.is_null() {
                    draft_obj.remove(&key);
                    continue;
                }
                let slot = draft_obj.entry(key).or_insert(Value::Null);
                normalize::merge_object_patch(slot, value);
            }
            _ => {
                if value.is_null() {
                    draft_obj.remove(&key);
                } else {
                    draft_obj.insert(key, value);
                }
            }
        }
    }

    // When the caller patched legacy hints without a modern delivery object,
    // migrate them forward so new writes use one schema.
    if !explicit_delivery {
        if let Some(hints) = payload_hints {
            let isolated = draft_obj
                .get("sessionTarget")
                .and_then(Value::as_str)
                .is_some_and(|t| t == "isolated");
            if isolated {
                let mut synthesized = serde_json::Map::new();
                if let Some(deliver) = hints.get("deliver").and_then(Value::as_bool) {
                    let mode = if deliver { "announce" } else { "none" };
                    synthesized.insert("mode".into(), Value::String(mode.to_string()));
                }
                if let Some(channel) = hints.get("channel").and_then(Value::as_str) {
                    synthesized.insert("channel".into(), Value::String(channel.to_string()));
                }
                if let Some(to) = hints.get("to").and_then(Value::as_str) {
                    synthesized.insert("to".into(), Value::String(to.to_string()));
                }
                if let Some(best_effort) = hints.get("bestEffortDeliver").and_then(Value::as_bool) {
                    synthesized.insert("bestEffort".into(), Value::Bool(best_effort));
                }
                if !synthesized.is_empty() {
                    let slot = draft_obj.entry("delivery").or_insert(Value::Null);
                    normalize::merge_object_patch(slot, Value::Object(synthesized));
                }
            }
        }
    }

    draft_obj.insert("updatedAtMs".into(), now.into());

    let mut draft: CronJob =
        serde_json::from_value(draft_value).map_err(|e| CronError::invalid(e.to_string()))?;

    // Flipping to the main session makes delivery meaningless.
    if draft.session_target == SessionTarget::Main {
        draft.delivery = None;
    }

    if schedule_touched {
        draft.schedule.canonicalize();
        // A schedule change is the explicit reset: run markers start over,
        // so an exhausted one-shot becomes eligible again.
        draft.state = JobState::default();
    }

    draft.validate(now, schedule_touched)?;

    // Recompute only when scheduling inputs moved; an unrelated patch must
    // not disturb a pending (possibly past-due) marker.
    if schedule_touched || draft.enabled != existing.enabled {
        draft.state.next_run_at_ms = if draft.enabled {
            compute_next_run(&draft, now)
        } else {
            None
        };
    }
    Ok(draft)
}
