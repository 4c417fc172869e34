//! Delivery-plan resolution for isolated jobs.
//!
//! Jobs carry either the modern job-level `delivery` object or, for stores
//! written before it existed, delivery hints embedded in the agent-turn
//! payload. The resolver merges both into one plan and records which path
//! was taken so migrations stay observable.

use tracing::warn;

use crate::types::{CronJob, Delivery, DeliveryMode, DeliveryPlan, Payload, PlanSource};

/// Channel used when none is specified or the requested one is unknown:
/// whichever channel last interacted with the job's originating context.
pub const LAST_CHANNEL: &str = "last";

/// Channels the default deployment can announce to.
pub const DEFAULT_KNOWN_CHANNELS: &[&str] = &[LAST_CHANNEL, "telegram", "discord"];

/// Resolve a job's delivery plan against the default channel set.
pub fn resolve_delivery_plan(job: &CronJob) -> DeliveryPlan {
    resolve_delivery_plan_with(job, DEFAULT_KNOWN_CHANNELS)
}

/// Resolve a job's delivery plan against a configured channel set.
pub fn resolve_delivery_plan_with<S: AsRef<str>>(job: &CronJob, known: &[S]) -> DeliveryPlan {
    if let Some(delivery) = &job.delivery {
        return plan_from_delivery(job, delivery, known);
    }
    plan_from_payload(job, known)
}

fn plan_from_delivery<S: AsRef<str>>(
    job: &CronJob,
    delivery: &Delivery,
    known: &[S],
) -> DeliveryPlan {
    let requested = delivery.mode == DeliveryMode::Announce;
    DeliveryPlan {
        mode: delivery.mode,
        channel: coerce_channel(job, delivery.channel.as_deref(), known),
        to: delivery.to.clone(),
        best_effort: delivery.best_effort.unwrap_or(false),
        source: PlanSource::Delivery,
        requested,
    }
}

fn plan_from_payload<S: AsRef<str>>(job: &CronJob, known: &[S]) -> DeliveryPlan {
    let (requested, channel, to, best_effort) = match &job.payload {
        Payload::AgentTurn {
            deliver,
            channel,
            to,
            best_effort_deliver,
            ..
        } => {
            // `deliver: false` wins over a `to` target; an unset `deliver`
            // with a target present means delivery was wanted.
            let requested = match deliver {
                Some(explicit) => *explicit,
                None => to.is_some(),
            };
            (
                requested,
                channel.as_deref(),
                to.clone(),
                best_effort_deliver.unwrap_or(false),
            )
        }
        Payload::SystemEvent { .. } => (false, None, None, false),
    };

    DeliveryPlan {
        mode: if requested {
            DeliveryMode::Announce
        } else {
            DeliveryMode::None
        },
        channel: coerce_channel(job, channel, known),
        to,
        best_effort,
        source: PlanSource::Payload,
        requested,
    }
}

fn coerce_channel<S: AsRef<str>>(job: &CronJob, channel: Option<&str>, known: &[S]) -> String {
    match channel {
        Some(name) if known.iter().any(|k| k.as_ref() == name) => name.to_string(),
        Some(name) => {
            warn!(
                job_id = %job.id,
                channel = name,
                "Unknown delivery channel, falling back to \"{LAST_CHANNEL}\""
            );
            LAST_CHANNEL.to_string()
        }
        None => LAST_CHANNEL.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Schedule, SessionTarget};

    fn isolated_job() -> CronJob {
        let mut job = crate::types::tests::sample_job(Schedule::Every {
            every_ms: 60_000,
            anchor_ms: None,
        });
        job.session_target = SessionTarget::Isolated;
        job.payload = Payload::AgentTurn {
            message: "do the thing".into(),
            model: None,
            thinking: None,
            timeout_seconds: None,
            deliver: None,
            channel: None,
            to: None,
            best_effort_deliver: None,
        };
        job
    }

    #[test]
    fn test_modern_delivery_announce() {
        let mut job = isolated_job();
        job.delivery = Some(Delivery {
            mode: DeliveryMode::Announce,
            channel: Some("telegram".into()),
            to: None,
            best_effort: None,
        });

        let plan = resolve_delivery_plan(&job);
        assert_eq!(plan.mode, DeliveryMode::Announce);
        assert_eq!(plan.channel, "telegram");
        assert_eq!(plan.source, PlanSource::Delivery);
        assert!(plan.requested);
    }

    #[test]
    fn test_modern_delivery_defaults_to_none_and_last() {
        let mut job = isolated_job();
        job.delivery = Some(Delivery {
            mode: DeliveryMode::None,
            channel: None,
            to: None,
            best_effort: None,
        });

        let plan = resolve_delivery_plan(&job);
        assert!(!plan.requested);
        assert_eq!(plan.channel, LAST_CHANNEL);
        assert_eq!(plan.source, PlanSource::Delivery);
    }

    #[test]
    fn test_unknown_channel_coerced_to_last() {
        let mut job = isolated_job();
        job.delivery = Some(Delivery {
            mode: DeliveryMode::Announce,
            channel: Some("carrier-pigeon".into()),
            to: None,
            best_effort: None,
        });

        let plan = resolve_delivery_plan(&job);
        assert_eq!(plan.channel, LAST_CHANNEL);
        assert!(plan.requested);
    }

    #[test]
    fn test_legacy_payload_deliver_true_with_target() {
        let mut job = isolated_job();
        job.payload = Payload::AgentTurn {
            message: "check".into(),
            model: None,
            thinking: None,
            timeout_seconds: None,
            deliver: Some(true),
            channel: None,
            to: Some("+15555550100".into()),
            best_effort_deliver: None,
        };

        let plan = resolve_delivery_plan(&job);
        assert!(plan.requested);
        assert_eq!(plan.source, PlanSource::Payload);
        assert_eq!(plan.to.as_deref(), Some("+15555550100"));
    }

    #[test]
    fn test_legacy_target_alone_implies_delivery() {
        let mut job = isolated_job();
        job.payload = Payload::AgentTurn {
            message: "check".into(),
            model: None,
            thinking: None,
            timeout_seconds: None,
            deliver: None,
            channel: Some("discord".into()),
            to: Some("user#1".into()),
            best_effort_deliver: None,
        };

        let plan = resolve_delivery_plan(&job);
        assert!(plan.requested);
        assert_eq!(plan.channel, "discord");
    }

    #[test]
    fn test_legacy_deliver_false_wins_over_target() {
        let mut job = isolated_job();
        job.payload = Payload::AgentTurn {
            message: "check".into(),
            model: None,
            thinking: None,
            timeout_seconds: None,
            deliver: Some(false),
            channel: None,
            to: Some("+15555550100".into()),
            best_effort_deliver: None,
        };

        let plan = resolve_delivery_plan(&job);
        assert!(!plan.requested);
        assert_eq!(plan.mode, DeliveryMode::None);
    }

    #[test]
    fn test_modern_delivery_shadows_legacy_hints() {
        let mut job = isolated_job();
        job.payload = Payload::AgentTurn {
            message: "check".into(),
            model: None,
            thinking: None,
            timeout_seconds: None,
            deliver: Some(true),
            channel: Some("telegram".into()),
            to: Some("+15555550100".into()),
            best_effort_deliver: None,
        };
        job.delivery = Some(Delivery {
            mode: DeliveryMode::None,
            channel: None,
            to: None,
            best_effort: None,
        });

        let plan = resolve_delivery_plan(&job);
        assert!(!plan.requested);
        assert_eq!(plan.source, PlanSource::Delivery);
    }

    #[test]
    fn test_configured_channel_set() {
        let mut job = isolated_job();
        job.delivery = Some(Delivery {
            mode: DeliveryMode::Announce,
            channel: Some("matrix".into()),
            to: None,
            best_effort: None,
        });

        let known = vec!["last".to_string(), "matrix".to_string()];
        let plan = resolve_delivery_plan_with(&job, &known);
        assert_eq!(plan.channel, "matrix");
    }
}
