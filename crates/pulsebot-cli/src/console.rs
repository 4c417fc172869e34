//! Console executor for CLI runs.
//!
//! The CLI has no conversation session, agent runtime, or channel
//! connections; system events and deliveries print to stdout, and agent
//! turns report that no runtime is attached.

use async_trait::async_trait;

use pulsebot_cron::CronExecutor;
use pulsebot_types::{AgentTurnOutcome, AgentTurnRequest, ChannelMessage, SystemEventRequest};

pub struct ConsoleExecutor;

#[async_trait]
impl CronExecutor for ConsoleExecutor {
    async fn system_event(&self, request: SystemEventRequest) -> anyhow::Result<()> {
        match &request.job_id {
            Some(id) => println!("[cron:{id}] {}", request.text),
            None => println!("[wake] {}", request.text),
        }
        Ok(())
    }

    async fn agent_turn(&self, request: AgentTurnRequest) -> anyhow::Result<AgentTurnOutcome> {
        tracing::warn!(job_id = %request.job_id, "No agent runtime attached to the CLI");
        Ok(AgentTurnOutcome::error(
            "no agent runtime attached; run isolated jobs from the gateway",
        ))
    }

    async fn deliver(&self, message: ChannelMessage) -> anyhow::Result<()> {
        match &message.to {
            Some(to) => println!("[deliver:{} to {to}] {}", message.channel, message.text),
            None => println!("[deliver:{}] {}", message.channel, message.text),
        }
        Ok(())
    }
}
