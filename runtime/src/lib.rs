//! Execution core for an LLM-driven incident-investigation agent.
//!
//! The agent loop itself, the LLM adapters, and persistence live outside
//! this crate; what lives here is the substrate they run on: the MCP
//! client layer with health monitoring, the bounded sub-agent runner, the
//! composite tool executor, and the data-masking engine.

pub mod config;
pub mod masking;
pub mod mcp;
pub mod runner;
pub mod services;
pub mod session;
pub mod tools;

pub use config::{AgentRegistryConfig, McpConfig, RunnerConfig};
pub use masking::MaskingService;
pub use mcp::{HealthMonitor, McpClient};
pub use runner::{ExecutionStatus, SubAgentResult, SubAgentRunner};
pub use session::{Session, SessionBuilder};
pub use tools::{CompositeToolExecutor, McpToolExecutor, ToolCall, ToolExecutor, ToolResult};
