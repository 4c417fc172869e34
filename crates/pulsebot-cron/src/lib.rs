//! pulsebot-cron: scheduled job management.
//!
//! Provides:
//! - Schedule engine for absolute-time, fixed-interval, and cron-expression
//!   jobs, plus occurrence projection over a horizon
//! - Crash-safe JSON job store (atomic write, backup, corruption recovery)
//! - Per-job append-only run history with size-bounded pruning
//! - Delivery-plan resolution for isolated jobs (modern schema + legacy
//!   payload hints)
//! - Job lifecycle manager tying the above into a scheduler tick

pub mod delivery;
pub mod executor;
pub mod normalize;
pub mod runlog;
pub mod schedule;
pub mod service;
pub mod store;
pub mod types;

pub use delivery::resolve_delivery_plan;
pub use executor::CronExecutor;
pub use runlog::{RunLog, RunLogOptions};
pub use schedule::{compute_next_run, next_occurrence, project_future_runs};
pub use service::{
    CronService, CronServiceSettings, CronStatus, STUCK_RUN_TIMEOUT_MS, is_job_due, next_wake,
};
pub use types::{
    CronError, CronJob, CronStoreDoc, Delivery, DeliveryMode, DeliveryPlan, JobState, Payload,
    PlanSource, ProjectedRun, RunLogEntry, Schedule, SessionTarget,
};

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
