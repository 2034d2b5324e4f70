//! Tool-calling surface between the LLM loop and the tool servers.
//!
//! A [`ToolCall`] comes out of the LLM with a free-form argument string; the
//! executor resolves it to a server and tool, runs it, and hands back a
//! [`ToolResult`]. Failures travel as result content with `is_error` set,
//! never as operation errors, so the LLM can react to them in its next
//! iteration.

use async_trait::async_trait;

pub mod args;
pub mod composite;
pub mod executor;
pub mod name;
pub mod truncate;

pub use composite::CompositeToolExecutor;
pub use executor::{McpToolExecutor, StubToolExecutor};

/// A tool invocation requested by the LLM.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Unique call ID assigned by the LLM backend.
    pub id: String,
    /// Canonical `server.tool` name (or an orchestration tool name).
    pub name: String,
    /// Free-form argument string: JSON, YAML, `key: value`, `key=value`,
    /// or raw text.
    pub arguments: String,
}

/// Outcome of a tool invocation.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            name: call.name.clone(),
            content: message.into(),
            is_error: true,
        }
    }
}

/// A tool made available to the LLM.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    /// Canonical `server.tool` name (or an orchestration tool name).
    pub name: String,
    pub description: String,
    /// JSON-schema-encoded parameter schema.
    pub parameters_schema: String,
}

/// The executor surface consumed by the agent loop.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Enumerate the tools available to this session.
    async fn list_tools(&self) -> Vec<ToolDefinition>;

    /// Execute one tool call. Every non-systemic failure is returned as an
    /// `is_error` result rather than surfaced as an operation error.
    async fn execute(&self, call: &ToolCall) -> ToolResult;

    /// Release underlying resources (sessions, subprocesses).
    async fn close(&self);
}
