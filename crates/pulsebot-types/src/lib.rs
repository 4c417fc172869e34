use serde::{Deserialize, Serialize};

// ──────────────────── Run Outcome Types ────────────────────

/// Terminal status of a single job execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Execution completed normally.
    Ok,
    /// Execution failed; the error is recorded alongside.
    Error,
    /// Execution was deliberately not performed (e.g. no runtime attached).
    Skipped,
}

/// How a scheduled event should reach the main session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WakeMode {
    /// Queue the event; the host picks it up on its next heartbeat.
    NextHeartbeat,
    /// Interrupt the host immediately.
    Now,
}

// ──────────────────── Executor Boundary Types ────────────────────

/// A system event emitted into the main conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEventRequest {
    /// Event text injected into the session.
    pub text: String,
    /// Immediate wake vs. next-heartbeat pickup.
    pub wake_mode: WakeMode,
    /// Originating job, if any (absent for ad-hoc `wake` requests).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// Request to run an isolated agent turn on behalf of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTurnRequest {
    /// Originating job ID.
    pub job_id: String,
    /// Human-readable job name, used for session labeling.
    pub job_name: String,
    /// Prompt text for the turn.
    pub message: String,
    /// Model override (runtime default if None).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Thinking-budget hint passed through to the runtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Per-turn timeout in seconds (1–3600).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u32>,
    /// Agent to run the turn on (runtime default if None).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Result of an isolated agent turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTurnOutcome {
    pub status: RunStatus,
    /// Short one-line summary for the run log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Full output text, used when the job's result is announced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_text: Option<String>,
    /// Error message when status is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentTurnOutcome {
    pub fn ok(summary: Option<String>, output_text: Option<String>) -> Self {
        Self {
            status: RunStatus::Ok,
            summary,
            output_text,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Error,
            summary: None,
            output_text: None,
            error: Some(message.into()),
        }
    }

    pub fn skipped(summary: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Skipped,
            summary: Some(summary.into()),
            output_text: None,
            error: None,
        }
    }
}

/// A job announcement handed to a messaging channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// Target channel name ("last" means whichever channel last interacted
    /// with the job's originating context).
    pub channel: String,
    /// Recipient identifier on the channel, if the channel needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Announcement text.
    pub text: String,
    /// When true, delivery failures are tolerated.
    #[serde(default)]
    pub best_effort: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_serde() {
        assert_eq!(serde_json::to_string(&RunStatus::Ok).unwrap(), "\"ok\"");
        let parsed: RunStatus = serde_json::from_str("\"skipped\"").unwrap();
        assert_eq!(parsed, RunStatus::Skipped);
    }

    #[test]
    fn test_wake_mode_serde() {
        assert_eq!(
            serde_json::to_string(&WakeMode::NextHeartbeat).unwrap(),
            "\"next-heartbeat\""
        );
        let parsed: WakeMode = serde_json::from_str("\"now\"").unwrap();
        assert_eq!(parsed, WakeMode::Now);
    }

    #[test]
    fn test_agent_turn_outcome_roundtrip() {
        let outcome = AgentTurnOutcome::ok(Some("done".into()), Some("full text".into()));
        let json = serde_json::to_string(&outcome).unwrap();
        let parsed: AgentTurnOutcome = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.status, RunStatus::Ok);
        assert_eq!(parsed.summary.as_deref(), Some("done"));
        assert_eq!(parsed.output_text.as_deref(), Some("full text"));
        assert!(parsed.error.is_none());
    }

    #[test]
    fn test_agent_turn_outcome_error() {
        let outcome = AgentTurnOutcome::error("boom");
        assert_eq!(outcome.status, RunStatus::Error);
        assert_eq!(outcome.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_channel_message_defaults() {
        let json = r#"{"channel":"telegram","text":"hi"}"#;
        let msg: ChannelMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.channel, "telegram");
        assert!(msg.to.is_none());
        assert!(!msg.best_effort);
    }

    #[test]
    fn test_system_event_request_roundtrip() {
        let req = SystemEventRequest {
            text: "tick".into(),
            wake_mode: WakeMode::Now,
            job_id: Some("job-1".into()),
        };
        let json = serde_json::to_string(&req).unwrap();
        let parsed: SystemEventRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.text, "tick");
        assert_eq!(parsed.wake_mode, WakeMode::Now);
        assert_eq!(parsed.job_id.as_deref(), Some("job-1"));
    }
}
