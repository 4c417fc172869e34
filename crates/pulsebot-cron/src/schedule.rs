//! Schedule engine — next-due computation and horizon projection.
//!
//! All evaluation is pure with respect to a caller-supplied reference time.
//! A malformed cron expression or timezone never fails evaluation; it
//! degrades to "no occurrences" with a warning so one bad job cannot halt
//! the scheduler.

use std::str::FromStr;

use chrono::{SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::types::{CronJob, ProjectedRun, RunStatus, Schedule};

/// Occurrences enumerated per job during projection. Bounds pathological
/// configurations such as sub-second intervals.
pub const MAX_PROJECTED_PER_JOB: usize = 5_000;

const DAY_MS: i64 = 86_400_000;

/// Parse an ISO-8601 timestamp into unix milliseconds. Accepts RFC 3339 and
/// a naive date-time (interpreted as UTC).
pub fn parse_iso_ms(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc().timestamp_millis());
        }
    }
    None
}

impl Schedule {
    /// The absolute instant of an `at` schedule, from the canonical ISO field
    /// or the legacy numeric one. `None` for other kinds or unparseable input.
    pub fn at_instant_ms(&self) -> Option<i64> {
        match self {
            Schedule::At { at, at_ms } => at.as_deref().and_then(parse_iso_ms).or(*at_ms),
            _ => None,
        }
    }

    /// Fold the legacy numeric `atMs` field into the canonical ISO form.
    /// Called on every write path so the legacy shape never persists.
    pub fn canonicalize(&mut self) {
        if let Schedule::At { at, at_ms } = self {
            if at.is_none() {
                if let Some(ms) = *at_ms {
                    if let Some(dt) = Utc.timestamp_millis_opt(ms).single() {
                        *at = Some(dt.to_rfc3339_opts(SecondsFormat::Millis, true));
                    }
                }
            }
            if at.as_deref().and_then(parse_iso_ms).is_some() {
                *at_ms = None;
            }
        }
    }
}

/// First occurrence strictly after `after_ms`, or `None` if the schedule has
/// no further occurrences. `created_at_ms` anchors un-anchored intervals.
pub fn next_occurrence(schedule: &Schedule, created_at_ms: i64, after_ms: i64) -> Option<i64> {
    match schedule {
        Schedule::At { .. } => {
            let at = schedule.at_instant_ms()?;
            (at > after_ms).then_some(at)
        }
        Schedule::Every { every_ms, anchor_ms } => {
            let every = (*every_ms).max(1);
            // An explicit anchor is itself the first scheduled run; the
            // created-at fallback is not (creation is not a fire time).
            let (anchor, anchor_fires) = match anchor_ms {
                Some(a) => (*a, true),
                None => (created_at_ms, false),
            };
            if anchor > after_ms {
                return Some(if anchor_fires { anchor } else { anchor + every });
            }
            // Anchor-aligned: whole multiples of the interval from the
            // anchor, never from the reference time.
            let k = (after_ms - anchor) / every + 1;
            Some(anchor + k * every)
        }
        Schedule::Cron { expr, tz } => cron_next_after(expr, tz.as_deref(), after_ms),
    }
}

/// Next due time for a job, `None` if it will not fire again.
///
/// Lifecycle-aware on top of the pure engine: a one-shot that completed
/// successfully stays exhausted until its schedule is explicitly reset.
/// Callers recompute only when no pending value exists — a boundary that
/// passed between ticks keeps its (past) marker and fires late rather than
/// being skipped.
pub fn compute_next_run(job: &CronJob, now_ms: i64) -> Option<i64> {
    match &job.schedule {
        Schedule::At { .. } => {
            if job.state.last_status == Some(RunStatus::Ok) {
                return None;
            }
            let at = job.schedule.at_instant_ms()?;
            (at > now_ms).then_some(at)
        }
        _ => next_occurrence(&job.schedule, job.created_at_ms, now_ms - 1),
    }
}

/// Enumerate future occurrences for every enabled job within
/// `[now, now + horizon_days]`, merged ascending by timestamp (ties keep
/// input order).
pub fn project_future_runs(
    jobs: &[CronJob],
    now_ms: i64,
    horizon_days: u32,
) -> Vec<ProjectedRun> {
    let end_ms = now_ms + horizon_days as i64 * DAY_MS;
    let mut merged: Vec<ProjectedRun> = Vec::new();

    for job in jobs {
        if !job.enabled {
            continue;
        }
        // An exhausted one-shot has nothing left to project.
        if matches!(job.schedule, Schedule::At { .. })
            && job.state.last_status == Some(RunStatus::Ok)
        {
            continue;
        }

        let mut cursor = now_ms;
        let mut count = 0usize;
        while count < MAX_PROJECTED_PER_JOB {
            let Some(next) = next_occurrence(&job.schedule, job.created_at_ms, cursor - 1) else {
                break;
            };
            if next > end_ms {
                break;
            }
            merged.push(ProjectedRun {
                job_id: job.id.clone(),
                job_name: job.name.clone(),
                run_at_ms: next,
            });
            count += 1;
            // Advance past the hit so an evaluator that returns the same
            // instant twice cannot loop forever.
            cursor = next + 1;
        }
    }

    merged.sort_by_key(|r| r.run_at_ms);
    merged
}

/// Evaluate a cron expression; `None` (with a warning) on any malformed
/// input rather than an error.
fn cron_next_after(expr: &str, tz: Option<&str>, after_ms: i64) -> Option<i64> {
    let schedule = match parse_cron_expr(expr) {
        Ok(s) => s,
        Err(e) => {
            warn!(expr, "Invalid cron expression, treating as no occurrences: {e}");
            return None;
        }
    };

    let tz = match tz {
        Some(name) => match name.parse::<Tz>() {
            Ok(tz) => tz,
            Err(_) => {
                warn!(tz = name, "Unknown timezone, falling back to UTC");
                chrono_tz::UTC
            }
        },
        None => chrono_tz::UTC,
    };

    let after = Utc.timestamp_millis_opt(after_ms).single()?;
    let after_tz = after.with_timezone(&tz);
    schedule.after(&after_tz).next().map(|dt| dt.timestamp_millis())
}

/// The `cron` crate wants a seconds field; standard 5-field expressions get
/// one prepended.
fn parse_cron_expr(expr: &str) -> Result<cron::Schedule, cron::error::Error> {
    let trimmed = expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        cron::Schedule::from_str(&format!("0 {trimmed}"))
    } else {
        cron::Schedule::from_str(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JobState, Schedule};

    fn ms(year: i32, month: u32, day: u32, hour: u32, minute: u32, second: u32) -> i64 {
        Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
            .single()
            .expect("valid datetime")
            .timestamp_millis()
    }

    fn job_with(schedule: Schedule) -> CronJob {
        crate::types::tests::sample_job(schedule)
    }

    #[test]
    fn test_parse_iso_variants() {
        assert_eq!(
            parse_iso_ms("2026-02-04T12:00:00Z"),
            Some(ms(2026, 2, 4, 12, 0, 0))
        );
        assert_eq!(
            parse_iso_ms("2026-02-04T12:00:00+00:00"),
            Some(ms(2026, 2, 4, 12, 0, 0))
        );
        // Naive timestamps are read as UTC
        assert_eq!(
            parse_iso_ms("2026-02-04T12:00"),
            Some(ms(2026, 2, 4, 12, 0, 0))
        );
        assert_eq!(parse_iso_ms("yesterday at noon"), None);
    }

    #[test]
    fn test_at_occurrence() {
        let now = ms(2026, 2, 4, 12, 0, 0);
        let schedule = Schedule::At {
            at: Some("2026-02-04T13:00:00Z".into()),
            at_ms: None,
        };
        assert_eq!(
            next_occurrence(&schedule, 0, now),
            Some(ms(2026, 2, 4, 13, 0, 0))
        );
        assert_eq!(next_occurrence(&schedule, 0, ms(2026, 2, 4, 14, 0, 0)), None);
    }

    #[test]
    fn test_at_legacy_ms_field() {
        let at = ms(2026, 2, 4, 13, 0, 0);
        let mut schedule = Schedule::At {
            at: None,
            at_ms: Some(at),
        };
        assert_eq!(schedule.at_instant_ms(), Some(at));

        schedule.canonicalize();
        match &schedule {
            Schedule::At { at: Some(iso), at_ms: None } => {
                assert_eq!(parse_iso_ms(iso), Some(at));
            }
            other => panic!("expected canonical at, got {other:?}"),
        }
    }

    #[test]
    fn test_every_is_anchor_aligned() {
        let anchor = ms(2026, 2, 4, 12, 0, 0);
        let schedule = Schedule::Every {
            every_ms: 60_000,
            anchor_ms: Some(anchor),
        };

        // Any reference time inside an interval lands on the same boundary.
        let boundary = anchor + 180_000;
        assert_eq!(next_occurrence(&schedule, 0, boundary - 59_999), Some(boundary));
        assert_eq!(next_occurrence(&schedule, 0, boundary - 1), Some(boundary));
        // Exactly on a boundary advances to the next one (strictly after).
        assert_eq!(next_occurrence(&schedule, 0, boundary), Some(boundary + 60_000));
    }

    #[test]
    fn test_every_future_anchor_and_created_fallback() {
        let created = ms(2026, 2, 4, 12, 0, 0);
        let anchor = created + 500_000;
        let schedule = Schedule::Every {
            every_ms: 60_000,
            anchor_ms: Some(anchor),
        };
        assert_eq!(next_occurrence(&schedule, created, created), Some(anchor));

        let unanchored = Schedule::Every {
            every_ms: 60_000,
            anchor_ms: None,
        };
        assert_eq!(
            next_occurrence(&unanchored, created, created + 30_000),
            Some(created + 60_000)
        );
        // Creation itself is not a fire time: the first occurrence of an
        // unanchored interval is one interval after creation.
        assert_eq!(
            next_occurrence(&unanchored, created, created - 1),
            Some(created + 60_000)
        );
    }

    #[test]
    fn test_cron_five_field_daily() {
        let now = ms(2026, 2, 4, 8, 0, 0);
        let schedule = Schedule::Cron {
            expr: "0 9 * * *".into(),
            tz: None,
        };
        assert_eq!(next_occurrence(&schedule, 0, now), Some(ms(2026, 2, 4, 9, 0, 0)));
        assert_eq!(
            next_occurrence(&schedule, 0, ms(2026, 2, 4, 9, 0, 0)),
            Some(ms(2026, 2, 5, 9, 0, 0))
        );
    }

    #[test]
    fn test_cron_with_timezone() {
        // 09:00 in Berlin is 08:00 UTC in winter
        let schedule = Schedule::Cron {
            expr: "0 9 * * *".into(),
            tz: Some("Europe/Berlin".into()),
        };
        let now = ms(2026, 2, 4, 0, 0, 0);
        assert_eq!(next_occurrence(&schedule, 0, now), Some(ms(2026, 2, 4, 8, 0, 0)));
    }

    #[test]
    fn test_invalid_cron_yields_none() {
        let schedule = Schedule::Cron {
            expr: "not a cron line".into(),
            tz: None,
        };
        assert_eq!(next_occurrence(&schedule, 0, 0), None);
    }

    #[test]
    fn test_unknown_timezone_falls_back_to_utc() {
        let schedule = Schedule::Cron {
            expr: "0 9 * * *".into(),
            tz: Some("Mars/Olympus_Mons".into()),
        };
        let now = ms(2026, 2, 4, 8, 0, 0);
        assert_eq!(next_occurrence(&schedule, 0, now), Some(ms(2026, 2, 4, 9, 0, 0)));
    }

    #[test]
    fn test_compute_next_run_exhausted_one_shot() {
        let mut job = job_with(Schedule::At {
            at: Some("2026-02-04T13:00:00Z".into()),
            at_ms: None,
        });
        job.state = JobState {
            last_status: Some(RunStatus::Ok),
            last_run_at_ms: Some(ms(2026, 2, 4, 13, 0, 0)),
            ..JobState::default()
        };
        assert_eq!(compute_next_run(&job, ms(2026, 2, 4, 14, 0, 0)), None);
    }

    #[test]
    fn test_compute_next_run_for_one_shot() {
        let at = ms(2026, 2, 4, 13, 0, 0);
        let mut job = job_with(Schedule::At {
            at: Some("2026-02-04T13:00:00Z".into()),
            at_ms: None,
        });

        assert_eq!(compute_next_run(&job, at - 60_000), Some(at));
        // A past instant yields nothing fresh; late fires rely on the
        // pending marker the scheduler keeps, not on recomputation.
        assert_eq!(compute_next_run(&job, at + 60_000), None);

        // A failed attempt is not retried.
        job.state.last_run_at_ms = Some(at + 60_000);
        job.state.last_status = Some(RunStatus::Error);
        assert_eq!(compute_next_run(&job, at + 120_000), None);
    }

    #[test]
    fn test_projection_caps_per_job() {
        // Raw sub-second interval (below the creation-time floor) to prove
        // the projection bound holds regardless of validation.
        let mut job = job_with(Schedule::Every {
            every_ms: 1,
            anchor_ms: Some(0),
        });
        job.created_at_ms = 0;
        let runs = project_future_runs(&[job], 1_000, 7);
        assert_eq!(runs.len(), MAX_PROJECTED_PER_JOB);
    }

    #[test]
    fn test_projection_sorted_with_stable_ties() {
        let now = ms(2026, 2, 4, 12, 0, 0);
        let mut a = job_with(Schedule::Every {
            every_ms: 3_600_000,
            anchor_ms: Some(now),
        });
        a.id = "a".into();
        let mut b = job_with(Schedule::Every {
            every_ms: 3_600_000,
            anchor_ms: Some(now),
        });
        b.id = "b".into();

        let runs = project_future_runs(&[a, b], now, 1);
        assert!(!runs.is_empty());
        assert!(runs.windows(2).all(|w| w[0].run_at_ms <= w[1].run_at_ms));
        // Identical timestamps keep input order
        assert_eq!(runs[0].job_id, "a");
        assert_eq!(runs[1].job_id, "b");
    }

    #[test]
    fn test_projection_daily_cron_over_week() {
        let now = ms(2026, 2, 4, 12, 0, 0);
        let job = job_with(Schedule::Cron {
            expr: "0 9 * * *".into(),
            tz: None,
        });
        let runs = project_future_runs(&[job], now, 7);
        assert!((6..=8).contains(&runs.len()), "got {} occurrences", runs.len());
    }

    #[test]
    fn test_projection_skips_disabled() {
        let now = ms(2026, 2, 4, 12, 0, 0);
        let mut job = job_with(Schedule::Every {
            every_ms: 60_000,
            anchor_ms: Some(now),
        });
        job.enabled = false;
        assert!(project_future_runs(&[job], now, 1).is_empty());
    }
}
