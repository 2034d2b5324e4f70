//! Session-scoped MCP client.
//!
//! One `McpClient` serves one investigation session. It owns a session per
//! configured tool server, a lazy per-server tool cache, and the recovery
//! path that tears a bad session down and reconnects.
//!
//! Lock ordering: the per-server reinit mutex is taken first (and held
//! across connects), then the coarse state mutex, then the tool-cache
//! mutex. Never the reverse. The state and cache mutexes are synchronous
//! and never held across an await point.

use rmcp::model::{CallToolRequestParams, CallToolResult, ClientInfo};
use rmcp::service::{Peer, RoleClient, RunningService};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::McpServerConfig;
use crate::tools::ToolDefinition;
use super::retry::{self, RetryDecision, MAX_RETRIES};
use super::transport;
use super::{McpError, INIT_TIMEOUT, OPERATION_TIMEOUT, REINIT_TIMEOUT};

/// A live connection to one tool server.
struct ServerSession {
    peer: Peer<RoleClient>,
    /// Keeps the transport alive; dropping it closes the connection and
    /// reaps any child process.
    _service: RunningService<RoleClient, ClientInfo>,
}

#[derive(Default)]
struct ClientState {
    sessions: HashMap<String, ServerSession>,
    /// Most recent initialization error per server that failed to connect.
    failed: HashMap<String, String>,
}

/// Per-session handle to one or more tool servers.
pub struct McpClient {
    configs: HashMap<String, McpServerConfig>,
    state: StdMutex<ClientState>,
    tool_cache: StdMutex<HashMap<String, Vec<ToolDefinition>>>,
    /// One async mutex per server so exactly one initialization or
    /// recreation is in flight per server at any time.
    reinit_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl McpClient {
    pub fn new(configs: HashMap<String, McpServerConfig>) -> Self {
        Self {
            configs,
            state: StdMutex::new(ClientState::default()),
            tool_cache: StdMutex::new(HashMap::new()),
            reinit_locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Server IDs known to this client.
    pub fn server_ids(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }

    /// Attempt to connect to each listed server concurrently, recording
    /// failures in the per-server failure map. Partial failure is not an
    /// error here: the caller decides whether a non-empty failure map is
    /// fatal.
    pub async fn initialize(&self, server_ids: &[String]) {
        let connects = server_ids.iter().map(|id| self.initialize_server(id));
        let results = futures_util::future::join_all(connects).await;
        for (id, result) in server_ids.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(server_id = %id, error = %e, "failed to initialize MCP server");
            }
        }
    }

    /// Idempotent connect for one server. Returns immediately when a
    /// session already exists.
    pub async fn initialize_server(&self, server_id: &str) -> Result<(), McpError> {
        let lock = self.reinit_lock(server_id);
        let _guard = lock.lock().await;
        if self.has_session(server_id) {
            return Ok(());
        }
        self.connect_locked(server_id, INIT_TIMEOUT).await
    }

    /// Connect and register a session. The caller must hold the server's
    /// reinit lock.
    async fn connect_locked(&self, server_id: &str, timeout: Duration) -> Result<(), McpError> {
        let config = self
            .configs
            .get(server_id)
            .ok_or_else(|| McpError::UnknownServer(server_id.to_string()))?;

        let connected = tokio::time::timeout(timeout, transport::connect(server_id, &config.transport)).await;
        match connected {
            Ok(Ok(service)) => {
                let peer = service.peer().clone();
                let mut state = self.state.lock().expect("mcp client state poisoned");
                state.sessions.insert(
                    server_id.to_string(),
                    ServerSession { peer, _service: service },
                );
                state.failed.remove(server_id);
                tracing::info!(server_id = %server_id, "MCP session established");
                Ok(())
            }
            Ok(Err(e)) => {
                self.record_failure(server_id, &e);
                Err(e)
            }
            Err(_) => {
                let e = McpError::ConnectTimeout {
                    server: server_id.to_string(),
                    timeout,
                };
                self.record_failure(server_id, &e);
                Err(e)
            }
        }
    }

    fn record_failure(&self, server_id: &str, error: &McpError) {
        let mut state = self.state.lock().expect("mcp client state poisoned");
        state.failed.insert(server_id.to_string(), error.to_string());
    }

    fn reinit_lock(&self, server_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.reinit_locks.lock().expect("reinit lock map poisoned");
        locks
            .entry(server_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn peer(&self, server_id: &str) -> Result<Peer<RoleClient>, McpError> {
        let state = self.state.lock().expect("mcp client state poisoned");
        state
            .sessions
            .get(server_id)
            .map(|s| s.peer.clone())
            .ok_or_else(|| McpError::NoSession(server_id.to_string()))
    }

    /// List the tools exposed by one server, from cache when possible.
    /// A server that returns nothing is cached as an empty list so the
    /// question is not re-asked every iteration.
    pub async fn list_tools(&self, server_id: &str) -> Result<Vec<ToolDefinition>, McpError> {
        {
            let cache = self.tool_cache.lock().expect("tool cache poisoned");
            if let Some(tools) = cache.get(server_id) {
                return Ok(tools.clone());
            }
        }

        self.initialize_server(server_id).await?;
        let peer = self.peer(server_id)?;

        let listed = tokio::time::timeout(OPERATION_TIMEOUT, peer.list_all_tools())
            .await
            .map_err(|_| McpError::OperationTimeout {
                server: server_id.to_string(),
                timeout: OPERATION_TIMEOUT,
            })?
            .map_err(McpError::Service)?;

        let tools: Vec<ToolDefinition> = listed
            .into_iter()
            .map(|tool| ToolDefinition {
                name: tool.name.to_string(),
                description: tool.description.as_deref().unwrap_or("").to_string(),
                parameters_schema: serde_json::to_string(&tool.input_schema)
                    .unwrap_or_else(|_| "{}".to_string()),
            })
            .collect();

        let mut cache = self.tool_cache.lock().expect("tool cache poisoned");
        cache.insert(server_id.to_string(), tools.clone());
        Ok(tools)
    }

    /// List tools across every configured server. Per-server failures are
    /// logged; the call fails only when every server failed.
    pub async fn list_all_tools(
        &self,
    ) -> Result<HashMap<String, Vec<ToolDefinition>>, McpError> {
        let mut all = HashMap::new();
        let mut last_error = None;
        for server_id in self.configs.keys() {
            match self.list_tools(server_id).await {
                Ok(tools) => {
                    all.insert(server_id.clone(), tools);
                }
                Err(e) => {
                    tracing::warn!(server_id = %server_id, error = %e, "failed to list tools");
                    last_error = Some(e);
                }
            }
        }
        match (all.is_empty(), last_error) {
            (true, Some(e)) => Err(e),
            _ => Ok(all),
        }
    }

    /// Call a tool on a server, retrying at most once when the failure
    /// looks like a dead transport.
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, McpError> {
        let mut attempt = 0u32;
        loop {
            match self.call_tool_once(server_id, tool_name, arguments.clone()).await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    if attempt >= MAX_RETRIES {
                        return Err(error);
                    }
                    let decision = retry::classify(&error);
                    tracing::debug!(
                        server_id = %server_id,
                        tool = %tool_name,
                        error = %error,
                        decision = ?decision,
                        "tool call failed"
                    );
                    match decision {
                        RetryDecision::NoRetry => return Err(error),
                        RetryDecision::RetrySameSession => {
                            retry::backoff().await;
                        }
                        RetryDecision::RetryNewSession => {
                            retry::backoff().await;
                            if let Err(e) = self.recreate_session(server_id).await {
                                tracing::warn!(
                                    server_id = %server_id,
                                    error = %e,
                                    "session recreation failed, retrying anyway"
                                );
                            }
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn call_tool_once(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, McpError> {
        self.initialize_server(server_id).await?;
        let peer = self.peer(server_id)?;

        let request = CallToolRequestParams {
            meta: None,
            name: tool_name.to_string().into(),
            arguments: Some(arguments),
            task: None,
        };

        tokio::time::timeout(OPERATION_TIMEOUT, peer.call_tool(request))
            .await
            .map_err(|_| McpError::OperationTimeout {
                server: server_id.to_string(),
                timeout: OPERATION_TIMEOUT,
            })?
            .map_err(McpError::Service)
    }

    /// Tear down a server's session and connect a fresh one. The tool
    /// cache for the server is flushed with the old session.
    pub async fn recreate_session(&self, server_id: &str) -> Result<(), McpError> {
        let lock = self.reinit_lock(server_id);
        let _guard = lock.lock().await;

        tracing::info!(server_id = %server_id, "recreating MCP session");
        {
            let mut state = self.state.lock().expect("mcp client state poisoned");
            // Dropping the old session closes its transport.
            state.sessions.remove(server_id);
        }
        self.invalidate_tool_cache(server_id);

        self.connect_locked(server_id, REINIT_TIMEOUT).await
    }

    /// Drop the cached tool list for a server so the next `list_tools`
    /// crosses the wire.
    pub fn invalidate_tool_cache(&self, server_id: &str) {
        let mut cache = self.tool_cache.lock().expect("tool cache poisoned");
        cache.remove(server_id);
    }

    pub fn has_session(&self, server_id: &str) -> bool {
        let state = self.state.lock().expect("mcp client state poisoned");
        state.sessions.contains_key(server_id)
    }

    /// Servers whose most recent initialization failed, with the error.
    pub fn failed_servers(&self) -> HashMap<String, String> {
        let state = self.state.lock().expect("mcp client state poisoned");
        state.failed.clone()
    }

    /// Close every session and clear all cached state.
    pub async fn close(&self) {
        let sessions: Vec<(String, ServerSession)> = {
            let mut state = self.state.lock().expect("mcp client state poisoned");
            state.failed.clear();
            state.sessions.drain().collect()
        };
        for (server_id, session) in sessions {
            tracing::debug!(server_id = %server_id, "closing MCP session");
            drop(session);
        }
        let mut cache = self.tool_cache.lock().expect("tool cache poisoned");
        cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;

    fn stdio_config(command: &str) -> McpServerConfig {
        McpServerConfig {
            transport: TransportConfig::Stdio {
                command: command.to_string(),
                args: Vec::new(),
                env: Default::default(),
            },
            allowed_tools: None,
            masking: None,
        }
    }

    fn client_with(server_id: &str, command: &str) -> McpClient {
        let mut configs = HashMap::new();
        configs.insert(server_id.to_string(), stdio_config(command));
        McpClient::new(configs)
    }

    #[tokio::test]
    async fn unknown_server_is_rejected() {
        let client = McpClient::new(HashMap::new());
        let err = client.initialize_server("ghost").await.unwrap_err();
        assert!(matches!(err, McpError::UnknownServer(_)));
    }

    #[tokio::test]
    async fn failed_connect_is_recorded() {
        let client = client_with("bad", "/nonexistent/tool-server");
        assert!(client.initialize_server("bad").await.is_err());
        assert!(!client.has_session("bad"));
        let failed = client.failed_servers();
        assert!(failed.contains_key("bad"));
    }

    #[tokio::test]
    async fn initialize_swallows_partial_failure() {
        let client = client_with("bad", "/nonexistent/tool-server");
        // Must not panic or error out even though the server is unreachable.
        client.initialize(&["bad".to_string()]).await;
        assert_eq!(client.failed_servers().len(), 1);
    }

    #[tokio::test]
    async fn list_all_tools_surfaces_total_failure() {
        let client = client_with("bad", "/nonexistent/tool-server");
        // The only configured server is unreachable, so the aggregate call
        // reports the last error instead of an empty map.
        assert!(client.list_all_tools().await.is_err());
    }

    #[tokio::test]
    async fn list_all_tools_with_no_servers_is_empty() {
        let client = McpClient::new(HashMap::new());
        let all = client.list_all_tools().await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn cache_invalidation_is_idempotent() {
        let client = client_with("srv", "/nonexistent/tool-server");
        client.invalidate_tool_cache("srv");
        client.invalidate_tool_cache("srv");
        client.invalidate_tool_cache("never-seen");
    }

    #[tokio::test]
    async fn close_clears_failure_state() {
        let client = client_with("bad", "/nonexistent/tool-server");
        let _ = client.initialize_server("bad").await;
        client.close().await;
        assert!(client.failed_servers().is_empty());
    }
}
