//! MCP client layer.
//!
//! One [`McpClient`](client::McpClient) per session holds connections to
//! every configured tool server, caches tool lists lazily, and recreates
//! sessions when the transport goes bad. The [`retry`] module decides
//! whether a failed call is worth retrying; [`transport`] builds the
//! stdio/HTTP/SSE transports; [`health`] runs the background probe loop.

use std::time::Duration;

pub mod client;
pub mod health;
pub mod retry;
pub mod transport;

pub use client::McpClient;
pub use health::{HealthMonitor, HealthStatus};
pub use retry::RetryDecision;

/// Budget for the initial connect of a server session.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for a single list-tools or call-tool round trip.
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(90);

/// Budget for tearing down and reconnecting a bad session.
pub const REINIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised by the MCP client layer.
///
/// These only reach callers that talk to the client directly; the tool
/// executor converts them into `is_error` tool results before the LLM
/// sees anything.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP server '{0}' is not configured")]
    UnknownServer(String),

    #[error("no active session for MCP server '{0}'")]
    NoSession(String),

    #[error("failed to initialize MCP session for '{server}': {message}")]
    Connect { server: String, message: String },

    #[error("connect to MCP server '{server}' timed out after {timeout:?}")]
    ConnectTimeout { server: String, timeout: Duration },

    #[error("operation against MCP server '{server}' timed out after {timeout:?}")]
    OperationTimeout { server: String, timeout: Duration },

    #[error("MCP service error: {0}")]
    Service(#[from] rmcp::service::ServiceError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
