//! MCP-backed tool execution.
//!
//! The executor sits between the LLM and the MCP client: it normalizes
//! and routes tool names, enforces the session's server allow-list and
//! per-server tool filters, parses arguments, and masks output. Every
//! failure up to and including MCP errors comes back as an `is_error`
//! result, so the LLM sees a tool answer it can react to rather than a
//! broken iteration.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::McpServerConfig;
use crate::masking::MaskingService;
use crate::mcp::McpClient;
use super::{args, name, ToolCall, ToolDefinition, ToolExecutor, ToolResult};

/// Executes `server.tool` calls against the session's MCP client.
pub struct McpToolExecutor {
    client: Arc<McpClient>,
    /// Authoritative list of servers this session may use.
    server_ids: Vec<String>,
    /// Optional per-server tool filter.
    tool_filter: HashMap<String, Vec<String>>,
    masking: Option<Arc<MaskingService>>,
}

impl McpToolExecutor {
    pub fn new(
        client: Arc<McpClient>,
        server_ids: Vec<String>,
        tool_filter: HashMap<String, Vec<String>>,
        masking: Option<Arc<MaskingService>>,
    ) -> Self {
        Self { client, server_ids, tool_filter, masking }
    }

    /// Assemble an executor for a session straight from its server
    /// registry: every configured server is allowed, per-server
    /// `allowed_tools` become the tool filter, and masking is resolved
    /// from the per-server masking configs.
    pub fn for_session(
        client: Arc<McpClient>,
        configs: &HashMap<String, McpServerConfig>,
    ) -> Self {
        let server_ids = configs.keys().cloned().collect();
        let tool_filter = configs
            .iter()
            .filter_map(|(id, config)| {
                config.allowed_tools.clone().map(|tools| (id.clone(), tools))
            })
            .collect();
        let masking = Arc::new(MaskingService::new(configs));
        Self::new(client, server_ids, tool_filter, Some(masking))
    }

    fn tool_allowed(&self, server: &str, tool: &str) -> bool {
        match self.tool_filter.get(server) {
            Some(allowed) => allowed.iter().any(|t| t == tool),
            None => true,
        }
    }
}

#[async_trait]
impl ToolExecutor for McpToolExecutor {
    async fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut definitions = Vec::new();
        for server_id in &self.server_ids {
            let tools = match self.client.list_tools(server_id).await {
                Ok(tools) => tools,
                Err(e) => {
                    tracing::warn!(server_id = %server_id, error = %e, "failed to list tools, skipping server");
                    continue;
                }
            };
            for tool in tools {
                if !self.tool_allowed(server_id, &tool.name) {
                    continue;
                }
                definitions.push(ToolDefinition {
                    name: format!("{server_id}.{}", tool.name),
                    description: tool.description,
                    parameters_schema: tool.parameters_schema,
                });
            }
        }
        definitions
    }

    async fn execute(&self, call: &ToolCall) -> ToolResult {
        let canonical = name::normalize(&call.name);
        let (server, tool) = match name::split(&canonical) {
            Ok(parts) => parts,
            Err(e) => return ToolResult::error(call, e.to_string()),
        };

        if !self.server_ids.iter().any(|id| id == server) {
            return ToolResult::error(
                call,
                format!("server '{server}' is not available in this session"),
            );
        }
        if !self.tool_allowed(server, tool) {
            return ToolResult::error(
                call,
                format!("tool '{tool}' is not allowed on server '{server}'"),
            );
        }

        let arguments = args::parse_arguments(&call.arguments);
        let result = match self.client.call_tool(server, tool, arguments).await {
            Ok(result) => result,
            Err(e) => {
                return ToolResult::error(call, format!("tool call failed: {e}"));
            }
        };

        // Concatenate the text parts; anything else is logged and skipped.
        let mut content = String::new();
        for part in &result.content {
            match part.as_text() {
                Some(text) => {
                    if !content.is_empty() {
                        content.push('\n');
                    }
                    content.push_str(&text.text);
                }
                None => {
                    tracing::debug!(tool = %canonical, "skipping non-text content part");
                }
            }
        }

        if let Some(masking) = &self.masking {
            content = masking.mask_tool_result(server, &content);
        }

        ToolResult {
            call_id: call.id.clone(),
            name: canonical,
            content,
            is_error: result.is_error.unwrap_or(false),
        }
    }

    async fn close(&self) {
        self.client.close().await;
    }
}

/// Executor for sessions with no configured tool servers: no tools, and a
/// uniform error answer for any call that slips through.
pub struct StubToolExecutor;

#[async_trait]
impl ToolExecutor for StubToolExecutor {
    async fn list_tools(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    async fn execute(&self, call: &ToolCall) -> ToolResult {
        ToolResult::error(
            call,
            format!("unknown tool '{}': no tool servers are configured", call.name),
        )
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: "call-1".to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    fn executor() -> McpToolExecutor {
        let client = Arc::new(McpClient::new(HashMap::new()));
        let mut filter = HashMap::new();
        filter.insert("kubernetes".to_string(), vec!["get_pods".to_string()]);
        McpToolExecutor::new(
            client,
            vec!["kubernetes".to_string()],
            filter,
            None,
        )
    }

    #[tokio::test]
    async fn malformed_names_become_error_results() {
        let result = executor().execute(&call("notatool", "{}")).await;
        assert!(result.is_error);
        assert!(result.content.contains("invalid tool name"));
    }

    #[tokio::test]
    async fn unknown_server_becomes_error_result() {
        let result = executor().execute(&call("grafana.query", "{}")).await;
        assert!(result.is_error);
        assert!(result.content.contains("not available in this session"));
    }

    #[tokio::test]
    async fn filtered_tool_becomes_error_result() {
        let result = executor().execute(&call("kubernetes.delete_pod", "{}")).await;
        assert!(result.is_error);
        assert!(result.content.contains("not allowed"));
    }

    #[tokio::test]
    async fn double_underscore_names_are_normalized() {
        // Routing happens on the normalized name; the unknown-session
        // error proves the name was split as kubernetes.get_pods would be.
        let result = executor().execute(&call("grafana__query", "{}")).await;
        assert!(result.is_error);
        assert!(result.content.contains("not available in this session"));
    }

    #[tokio::test]
    async fn for_session_applies_registry_filters() {
        use crate::config::{McpServerConfig, TransportConfig};

        let mut configs = HashMap::new();
        configs.insert(
            "kubernetes".to_string(),
            McpServerConfig {
                transport: TransportConfig::Stdio {
                    command: "kubectl-mcp".to_string(),
                    args: Vec::new(),
                    env: Default::default(),
                },
                allowed_tools: Some(vec!["get_pods".to_string()]),
                masking: None,
            },
        );
        let client = Arc::new(McpClient::new(configs.clone()));
        let executor = McpToolExecutor::for_session(client, &configs);

        let blocked = executor.execute(&call("kubernetes.delete_pod", "{}")).await;
        assert!(blocked.is_error);
        assert!(blocked.content.contains("not allowed"));

        let elsewhere = executor.execute(&call("grafana.query", "{}")).await;
        assert!(elsewhere.content.contains("not available in this session"));
    }

    #[tokio::test]
    async fn stub_executor_has_no_tools() {
        let stub = StubToolExecutor;
        assert!(stub.list_tools().await.is_empty());
        let result = stub.execute(&call("anything.goes", "{}")).await;
        assert!(result.is_error);
    }
}
