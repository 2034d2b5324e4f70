//! Composite tool execution: orchestration tools plus MCP tools.
//!
//! The three orchestration tools (`dispatch_agent`, `cancel_agent`,
//! `list_agents`) carry no dot in their names, which is what tells them
//! apart from `server.tool` calls. Everything else falls through to the
//! wrapped MCP executor.
//!
//! `close` is the session's single shutdown choke point and runs strictly
//! in order: cancel all sub-agents, wait for them under a bounded budget
//! detached from the caller's cancellation, then close the transports.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::runner::SubAgentRunner;
use super::{args, ToolCall, ToolDefinition, ToolExecutor, ToolResult};

/// Default budget for draining sub-agents during shutdown.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

const DISPATCH_AGENT: &str = "dispatch_agent";
const CANCEL_AGENT: &str = "cancel_agent";
const LIST_AGENTS: &str = "list_agents";

const ORCHESTRATION_TOOLS: [&str; 3] = [DISPATCH_AGENT, CANCEL_AGENT, LIST_AGENTS];

/// Merges sub-agent orchestration tools with the MCP tool surface.
pub struct CompositeToolExecutor {
    runner: Arc<SubAgentRunner>,
    wrapped: Option<Box<dyn ToolExecutor>>,
    close_timeout: Duration,
}

impl CompositeToolExecutor {
    pub fn new(runner: Arc<SubAgentRunner>, wrapped: Option<Box<dyn ToolExecutor>>) -> Self {
        Self {
            runner,
            wrapped,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// Shorten the shutdown drain budget, for tests.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    fn orchestration_definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: DISPATCH_AGENT.to_string(),
                description: "Dispatch a sub-agent to investigate a task concurrently. \
                              Returns an execution ID immediately; the result arrives later."
                    .to_string(),
                parameters_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "agent_name": {
                            "type": "string",
                            "description": "Registered agent to dispatch"
                        },
                        "task": {
                            "type": "string",
                            "description": "Task description for the sub-agent"
                        }
                    },
                    "required": ["agent_name", "task"]
                })
                .to_string(),
            },
            ToolDefinition {
                name: CANCEL_AGENT.to_string(),
                description: "Request cancellation of a dispatched sub-agent.".to_string(),
                parameters_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "execution_id": {
                            "type": "string",
                            "description": "Execution ID returned by dispatch_agent"
                        }
                    },
                    "required": ["execution_id"]
                })
                .to_string(),
            },
            ToolDefinition {
                name: LIST_AGENTS.to_string(),
                description: "List dispatched sub-agents and their statuses.".to_string(),
                parameters_schema: serde_json::json!({
                    "type": "object",
                    "properties": {}
                })
                .to_string(),
            },
        ]
    }

    async fn execute_orchestration(&self, call: &ToolCall) -> ToolResult {
        match call.name.as_str() {
            DISPATCH_AGENT => self.dispatch_agent(call).await,
            CANCEL_AGENT => self.cancel_agent(call),
            LIST_AGENTS => self.list_agents(call),
            other => ToolResult::error(call, format!("unknown orchestration tool '{other}'")),
        }
    }

    async fn dispatch_agent(&self, call: &ToolCall) -> ToolResult {
        let arguments = args::parse_arguments(&call.arguments);
        let Some(agent_name) = arguments.get("agent_name").and_then(|v| v.as_str()) else {
            return ToolResult::error(call, "dispatch_agent requires an 'agent_name' parameter");
        };
        let Some(task) = arguments.get("task").and_then(|v| v.as_str()) else {
            return ToolResult::error(call, "dispatch_agent requires a 'task' parameter");
        };

        match self.runner.dispatch(agent_name, task).await {
            Ok(execution_id) => {
                let body = serde_json::json!({
                    "execution_id": execution_id,
                    "status": "accepted",
                });
                ToolResult::success(call, body.to_string())
            }
            Err(e) => ToolResult::error(call, e.to_string()),
        }
    }

    fn cancel_agent(&self, call: &ToolCall) -> ToolResult {
        let arguments = args::parse_arguments(&call.arguments);
        let Some(execution_id) = arguments.get("execution_id").and_then(|v| v.as_str()) else {
            return ToolResult::error(call, "cancel_agent requires an 'execution_id' parameter");
        };
        match self.runner.cancel(execution_id) {
            Ok(message) => ToolResult::success(call, message),
            Err(e) => ToolResult::error(call, e.to_string()),
        }
    }

    fn list_agents(&self, call: &ToolCall) -> ToolResult {
        let mut rows = self.runner.list();
        if rows.is_empty() {
            return ToolResult::success(call, "no sub-agents dispatched");
        }
        rows.sort_by(|a, b| a.execution_id.cmp(&b.execution_id));
        let listing = rows
            .iter()
            .map(|row| {
                format!(
                    "{}: {} [{}] - {}",
                    row.execution_id, row.agent_name, row.status, row.task
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        ToolResult::success(call, listing)
    }
}

#[async_trait]
impl ToolExecutor for CompositeToolExecutor {
    /// Orchestration definitions always come first, then the MCP tools.
    async fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut definitions = Self::orchestration_definitions();
        if let Some(wrapped) = &self.wrapped {
            definitions.extend(wrapped.list_tools().await);
        }
        definitions
    }

    async fn execute(&self, call: &ToolCall) -> ToolResult {
        if ORCHESTRATION_TOOLS.contains(&call.name.as_str()) {
            return self.execute_orchestration(call).await;
        }
        match &self.wrapped {
            Some(wrapped) => wrapped.execute(call).await,
            None => ToolResult::error(call, format!("unknown tool '{}'", call.name)),
        }
    }

    async fn close(&self) {
        self.runner.cancel_all();
        if tokio::time::timeout(self.close_timeout, self.runner.wait_all())
            .await
            .is_err()
        {
            tracing::warn!(
                timeout = ?self.close_timeout,
                "timed out waiting for sub-agents during shutdown"
            );
        }
        if let Some(wrapped) = &self.wrapped {
            wrapped.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::name;

    #[test]
    fn orchestration_names_have_no_dot() {
        for tool in ORCHESTRATION_TOOLS {
            assert!(!tool.contains('.'));
            assert!(name::split(tool).is_err());
        }
    }

    #[test]
    fn orchestration_definitions_are_well_formed() {
        let definitions = CompositeToolExecutor::orchestration_definitions();
        assert_eq!(definitions.len(), 3);
        assert_eq!(definitions[0].name, DISPATCH_AGENT);
        for definition in &definitions {
            let schema: serde_json::Value =
                serde_json::from_str(&definition.parameters_schema).unwrap();
            assert_eq!(schema["type"], "object");
        }
    }
}
