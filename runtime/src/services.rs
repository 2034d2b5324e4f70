//! External collaborator seams.
//!
//! The runtime core does not own persistence, event publishing, or the LLM
//! loop. It talks to them through the traits in this module: the sub-agent
//! runner records executions via [`StageService`] and [`TimelineService`],
//! obtains agent implementations from an [`AgentFactory`], and the health
//! monitor surfaces problems through a [`WarningsService`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::runner::ExecutionStatus;

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A message destined for an agent conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Everything an agent implementation needs to know about the execution it
/// is running under.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub session_id: String,
    pub stage_id: String,
    pub agent_name: String,
    pub llm_provider: String,
    pub llm_backend: String,
    pub task: String,
    /// Tool servers this execution may talk to.
    pub server_ids: Vec<String>,
    pub max_iterations: u32,
}

/// Request to create a child execution record under a parent execution.
#[derive(Debug, Clone)]
pub struct NewAgentExecution {
    pub parent_execution_id: String,
    pub stage_id: String,
    pub session_id: String,
    pub agent_name: String,
    /// Ordinal of this sub-agent within the parent execution.
    pub agent_index: u64,
    pub llm_provider: String,
    pub llm_backend: String,
    pub task: String,
}

/// Persistence surface for execution records.
#[async_trait]
pub trait StageService: Send + Sync {
    /// Create a child execution record and return its ID.
    async fn create_agent_execution(&self, req: NewAgentExecution) -> anyhow::Result<String>;

    /// Record a status transition for an execution.
    async fn update_agent_execution_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        error_message: Option<String>,
    ) -> anyhow::Result<()>;
}

/// Kind of a timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventKind {
    LlmResponse,
    ToolCall,
    TaskAssignment,
    ExecutiveSummary,
}

/// An append-only record of agent activity within an execution.
#[derive(Debug, Clone)]
pub struct NewTimelineEvent {
    pub execution_id: String,
    pub sequence: i64,
    pub kind: TimelineEventKind,
    pub summary: String,
    pub payload: serde_json::Value,
}

/// Persistence surface for timeline events.
#[async_trait]
pub trait TimelineService: Send + Sync {
    /// Highest sequence number recorded for an execution, 0 if none.
    async fn max_sequence_number(&self, execution_id: &str) -> anyhow::Result<i64>;

    async fn create_timeline_event(&self, event: NewTimelineEvent) -> anyhow::Result<()>;
}

/// Outcome of a completed agent run.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// The agent's final analysis text.
    pub analysis: String,
}

/// One LLM-driven investigation loop. Implementations live outside the core.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        initial_prompt: &str,
    ) -> anyhow::Result<AgentOutcome>;
}

/// Builds agent instances for sub-agent executions.
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn create_agent(&self, ctx: &ExecutionContext) -> anyhow::Result<Box<dyn Agent>>;
}

/// Category of an operator-facing system warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningCategory {
    McpHealth,
}

/// Named, keyed, dismissible advisories surfaced to operators.
///
/// Warnings are keyed so a repeated failure updates the existing entry
/// instead of stacking duplicates, and recovery can clear exactly the
/// warning it owns.
pub trait WarningsService: Send + Sync {
    fn add_warning(&self, category: WarningCategory, message: &str, detail: &str, key: &str);

    fn clear_warning(&self, category: WarningCategory, key: &str);
}
