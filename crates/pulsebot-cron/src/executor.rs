//! Boundary to the execution collaborators.
//!
//! The scheduler itself never talks to a conversation session, an agent
//! runtime, or a messaging platform; it hands work across this trait. The
//! gateway wires the real implementations, the CLI wires a console one, and
//! tests wire mocks.
//!
//! Use `&self` for all methods — implementations should use interior
//! mutability (e.g. `Mutex`, `RwLock`) for any mutable state.

use async_trait::async_trait;

use pulsebot_types::{AgentTurnOutcome, AgentTurnRequest, ChannelMessage, SystemEventRequest};

/// Executes job payloads and delivers announced output.
#[async_trait]
pub trait CronExecutor: Send + Sync {
    /// Emit a system event into the main conversation session, honoring the
    /// request's wake mode.
    async fn system_event(&self, request: SystemEventRequest) -> anyhow::Result<()>;

    /// Run an isolated agent turn and report its outcome. Implementations
    /// should catch their own failures and fold them into the outcome where
    /// possible; a returned `Err` is recorded as an execution error.
    async fn agent_turn(&self, request: AgentTurnRequest) -> anyhow::Result<AgentTurnOutcome>;

    /// Hand an announcement to a messaging channel.
    async fn deliver(&self, message: ChannelMessage) -> anyhow::Result<()>;
}
