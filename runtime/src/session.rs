//! Session assembly.
//!
//! One session is one alert being investigated: a root cancellation
//! token, live tool-server connections, a sub-agent runner, and the
//! composite tool executor the agent loop calls into. The builder wires
//! those pieces in dependency order; [`Session::shutdown`] unwinds them
//! in reverse.

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentRegistryConfig, McpConfig};
use crate::masking::MaskingService;
use crate::mcp::{HealthMonitor, McpClient};
use crate::runner::{RunnerScope, SubAgentRunner};
use crate::services::{AgentFactory, StageService, TimelineService, WarningsService};
use crate::tools::{CompositeToolExecutor, McpToolExecutor, StubToolExecutor, ToolExecutor};

/// Builder for a fully wired session.
pub struct SessionBuilder {
    session_id: String,
    stage_id: String,
    parent_execution_id: String,
    mcp_config: McpConfig,
    registry: AgentRegistryConfig,
    stage: Option<Arc<dyn StageService>>,
    timeline: Option<Arc<dyn TimelineService>>,
    factory: Option<Arc<dyn AgentFactory>>,
    warnings: Option<Arc<dyn WarningsService>>,
}

impl SessionBuilder {
    pub fn new(session_id: &str, stage_id: &str, parent_execution_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            stage_id: stage_id.to_string(),
            parent_execution_id: parent_execution_id.to_string(),
            mcp_config: McpConfig::default(),
            registry: AgentRegistryConfig::default(),
            stage: None,
            timeline: None,
            factory: None,
            warnings: None,
        }
    }

    /// Set the tool-server registry for this session.
    pub fn with_mcp_config(mut self, config: McpConfig) -> Self {
        self.mcp_config = config;
        self
    }

    /// Set the agent registry and runner settings.
    pub fn with_agent_registry(mut self, registry: AgentRegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_stage_service(mut self, stage: Arc<dyn StageService>) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_timeline_service(mut self, timeline: Arc<dyn TimelineService>) -> Self {
        self.timeline = Some(timeline);
        self
    }

    pub fn with_agent_factory(mut self, factory: Arc<dyn AgentFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Enable background health monitoring, surfacing failures through the
    /// given warnings service.
    pub fn with_warnings_service(mut self, warnings: Arc<dyn WarningsService>) -> Self {
        self.warnings = Some(warnings);
        self
    }

    /// Assemble the session: connect the MCP client, build the executor
    /// chain, create the runner, and start health monitoring when a
    /// warnings service was provided.
    ///
    /// Server connection failures are not fatal here; they land in
    /// [`Session::failed_servers`] for the caller to judge.
    pub async fn build(self) -> Result<Session> {
        if self.session_id.is_empty() || self.stage_id.is_empty() || self.parent_execution_id.is_empty()
        {
            anyhow::bail!("SessionBuilder: session, stage, and parent execution IDs are required");
        }
        let stage = self
            .stage
            .ok_or_else(|| anyhow::anyhow!("SessionBuilder: a stage service is required"))?;
        let timeline = self
            .timeline
            .ok_or_else(|| anyhow::anyhow!("SessionBuilder: a timeline service is required"))?;
        let factory = self
            .factory
            .ok_or_else(|| anyhow::anyhow!("SessionBuilder: an agent factory is required"))?;

        let cancel = CancellationToken::new();
        let servers = self.mcp_config.servers;

        let client = Arc::new(McpClient::new(servers.clone()));
        let server_ids: Vec<String> = servers.keys().cloned().collect();
        client.initialize(&server_ids).await;
        for (server_id, error) in client.failed_servers() {
            tracing::warn!(server_id = %server_id, error = %error, "session started with unreachable MCP server");
        }

        let inner: Box<dyn ToolExecutor> = if servers.is_empty() {
            Box::new(StubToolExecutor)
        } else {
            Box::new(McpToolExecutor::for_session(client.clone(), &servers))
        };

        let runner = SubAgentRunner::new(
            RunnerScope {
                parent_execution_id: self.parent_execution_id,
                stage_id: self.stage_id,
                session_id: self.session_id,
            },
            cancel.clone(),
            self.registry.runner,
            self.registry.agents,
            self.registry.overrides,
            stage,
            timeline,
            factory,
        );

        let executor = CompositeToolExecutor::new(runner.clone(), Some(inner));

        let health = match (&self.warnings, servers.is_empty()) {
            (Some(warnings), false) => {
                let monitor = Arc::new(HealthMonitor::new(servers.clone(), warnings.clone()));
                monitor.start();
                Some(monitor)
            }
            _ => None,
        };

        Ok(Session {
            cancel,
            client,
            runner,
            executor,
            health,
        })
    }
}

/// A fully wired session. The composite executor is the surface the agent
/// loop talks to; everything else is reachable for orchestration code.
pub struct Session {
    cancel: CancellationToken,
    client: Arc<McpClient>,
    runner: Arc<SubAgentRunner>,
    executor: CompositeToolExecutor,
    health: Option<Arc<HealthMonitor>>,
}

impl Session {
    /// The tool executor the agent loop calls for every LLM tool call.
    pub fn executor(&self) -> &CompositeToolExecutor {
        &self.executor
    }

    pub fn runner(&self) -> &Arc<SubAgentRunner> {
        &self.runner
    }

    pub fn client(&self) -> &Arc<McpClient> {
        &self.client
    }

    pub fn health(&self) -> Option<&Arc<HealthMonitor>> {
        self.health.as_ref()
    }

    /// The session-level cancellation token. Sub-agent tokens derive from
    /// this one; cancelling it cancels the whole session.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Servers that failed to connect at session start.
    pub fn failed_servers(&self) -> std::collections::HashMap<String, String> {
        self.client.failed_servers()
    }

    /// Build a masking service for alert data using this session's server
    /// configs. Tool-result masking already happens inside the executor.
    pub fn masking_for(configs: &McpConfig) -> MaskingService {
        MaskingService::new(&configs.servers)
    }

    /// Tear the session down: stop health monitoring, close the executor
    /// chain (cancel sub-agents, drain, close transports), then fire the
    /// session token.
    pub async fn shutdown(&self) {
        if let Some(health) = &self.health {
            health.stop().await;
        }
        self.executor.close().await;
        self.cancel.cancel();
        tracing::info!("session shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        Agent, AgentOutcome, ExecutionContext, NewAgentExecution, NewTimelineEvent,
    };
    use crate::runner::ExecutionStatus;
    use crate::tools::ToolCall;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct NullStage {
        counter: AtomicU64,
    }

    #[async_trait]
    impl StageService for NullStage {
        async fn create_agent_execution(&self, _req: NewAgentExecution) -> Result<String> {
            Ok(format!("exec-{}", self.counter.fetch_add(1, Ordering::SeqCst)))
        }

        async fn update_agent_execution_status(
            &self,
            _execution_id: &str,
            _status: ExecutionStatus,
            _error_message: Option<String>,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct NullTimeline;

    #[async_trait]
    impl TimelineService for NullTimeline {
        async fn max_sequence_number(&self, _execution_id: &str) -> Result<i64> {
            Ok(0)
        }

        async fn create_timeline_event(&self, _event: NewTimelineEvent) -> Result<()> {
            Ok(())
        }
    }

    struct EchoAgent;

    #[async_trait]
    impl Agent for EchoAgent {
        async fn execute(
            &self,
            _ctx: &ExecutionContext,
            initial_prompt: &str,
        ) -> Result<AgentOutcome> {
            Ok(AgentOutcome { analysis: format!("analyzed: {initial_prompt}") })
        }
    }

    struct EchoFactory;

    #[async_trait]
    impl crate::services::AgentFactory for EchoFactory {
        async fn create_agent(&self, _ctx: &ExecutionContext) -> Result<Box<dyn Agent>> {
            Ok(Box::new(EchoAgent))
        }
    }

    fn builder() -> SessionBuilder {
        SessionBuilder::new("session-1", "stage-1", "parent-1")
            .with_stage_service(Arc::new(NullStage::default()))
            .with_timeline_service(Arc::new(NullTimeline))
            .with_agent_factory(Arc::new(EchoFactory))
    }

    #[tokio::test]
    async fn build_requires_collaborators() {
        let result = SessionBuilder::new("s", "st", "p").build().await;
        let err = result.err().expect("build must fail without services");
        assert!(err.to_string().contains("stage service"));
    }

    #[tokio::test]
    async fn build_requires_ids() {
        let result = SessionBuilder::new("", "st", "p")
            .with_stage_service(Arc::new(NullStage::default()))
            .with_timeline_service(Arc::new(NullTimeline))
            .with_agent_factory(Arc::new(EchoFactory))
            .build()
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn serverless_session_exposes_orchestration_tools_only() {
        let session = builder().build().await.unwrap();

        let tools = session.executor().list_tools().await;
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["dispatch_agent", "cancel_agent", "list_agents"]);

        // Non-orchestration calls fall through to the stub.
        let result = session
            .executor()
            .execute(&ToolCall {
                id: "c1".to_string(),
                name: "kubernetes.get_pods".to_string(),
                arguments: String::new(),
            })
            .await;
        assert!(result.is_error);

        session.shutdown().await;
    }

    #[tokio::test]
    async fn dispatch_flows_through_the_session() {
        let mut registry = AgentRegistryConfig::default();
        registry
            .agents
            .insert("investigator".to_string(), crate::config::AgentConfig::default());

        let session = builder().with_agent_registry(registry).build().await.unwrap();

        let result = session
            .executor()
            .execute(&ToolCall {
                id: "c1".to_string(),
                name: "dispatch_agent".to_string(),
                arguments: r#"{"agent_name": "investigator", "task": "look around"}"#.to_string(),
            })
            .await;
        assert!(!result.is_error, "dispatch failed: {}", result.content);

        let never = CancellationToken::new();
        let outcome = session.runner().wait_for_next(&never).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(outcome.analysis.as_deref(), Some("analyzed: look around"));

        session.shutdown().await;
    }
}
