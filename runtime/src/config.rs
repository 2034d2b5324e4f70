//! Configuration loading.
//!
//! Two registries feed the runtime: the tool-server registry (JSON, one
//! entry per MCP server with its transport, optional tool allow-list, and
//! optional masking settings) and the agent registry (TOML, one entry per
//! dispatchable sub-agent). Both are loaded once at session start and
//! treated as read-only afterwards.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

fn default_tls_verify() -> bool {
    true
}

/// Transport used to reach a tool server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Spawn a subprocess and speak JSON-RPC over stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Streamable HTTP endpoint.
    Http {
        url: String,
        #[serde(default)]
        bearer_token: Option<String>,
        #[serde(default = "default_tls_verify")]
        tls_verify: bool,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Server-sent events endpoint.
    Sse {
        url: String,
        #[serde(default)]
        bearer_token: Option<String>,
        #[serde(default = "default_tls_verify")]
        tls_verify: bool,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

impl TransportConfig {
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            TransportConfig::Stdio { .. } => None,
            TransportConfig::Http { timeout_secs, .. }
            | TransportConfig::Sse { timeout_secs, .. } => timeout_secs.map(Duration::from_secs),
        }
    }
}

/// A server-local custom masking pattern.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomPattern {
    pub name: String,
    pub pattern: String,
    pub replacement: String,
}

/// Per-server masking settings: named pattern groups, individual built-in
/// patterns, and server-local custom patterns.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MaskingConfig {
    #[serde(default)]
    pub pattern_groups: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub custom_patterns: Vec<CustomPattern>,
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, Deserialize)]
pub struct McpServerConfig {
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// When present, only the listed tools may be called on this server.
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub masking: Option<MaskingConfig>,
}

/// The tool-server registry (from a `.mcp.json`-style file).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers", alias = "servers")]
    pub servers: HashMap<String, McpServerConfig>,
}

impl McpConfig {
    /// Load from a specific path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: McpConfig = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.expand_env();
        Ok(config)
    }

    /// Expand `${VAR}` references in stdio env values. The transport layer
    /// receives the values as-is afterwards.
    fn expand_env(&mut self) {
        for server in self.servers.values_mut() {
            if let TransportConfig::Stdio { env, .. } = &mut server.transport {
                for value in env.values_mut() {
                    if let Ok(expanded) = shellexpand::env(value) {
                        *value = expanded.into_owned();
                    }
                }
            }
        }
    }
}

// ============================================================================
// Agent registry (.agent.toml style)
// ============================================================================

fn default_max_iterations() -> u32 {
    10
}

fn default_llm_provider() -> String {
    "openai".to_string()
}

fn default_llm_backend() -> String {
    "default".to_string()
}

/// Configuration for one dispatchable agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_llm_provider")]
    pub llm_provider: String,
    #[serde(default = "default_llm_backend")]
    pub llm_backend: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Tool servers this agent may use. Empty means the session default.
    #[serde(default)]
    pub servers: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            llm_provider: default_llm_provider(),
            llm_backend: default_llm_backend(),
            max_iterations: default_max_iterations(),
            servers: Vec::new(),
        }
    }
}

/// Per-dispatch parameter tweaks, merged over the base [`AgentConfig`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentOverride {
    pub llm_provider: Option<String>,
    pub llm_backend: Option<String>,
    pub max_iterations: Option<u32>,
}

impl AgentConfig {
    /// Merge an override on top of this config.
    pub fn with_override(&self, ov: &AgentOverride) -> AgentConfig {
        AgentConfig {
            llm_provider: ov.llm_provider.clone().unwrap_or_else(|| self.llm_provider.clone()),
            llm_backend: ov.llm_backend.clone().unwrap_or_else(|| self.llm_backend.clone()),
            max_iterations: ov.max_iterations.unwrap_or(self.max_iterations),
            servers: self.servers.clone(),
        }
    }
}

fn default_max_concurrent_agents() -> usize {
    5
}

fn default_agent_timeout_secs() -> u64 {
    300
}

/// Sub-agent runner settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: usize,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: default_max_concurrent_agents(),
            agent_timeout_secs: default_agent_timeout_secs(),
        }
    }
}

impl RunnerConfig {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }
}

/// The agent registry plus runner settings (from a TOML file).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentRegistryConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
    /// Per-reference overrides keyed by agent name.
    #[serde(default)]
    pub overrides: HashMap<String, AgentOverride>,
}

impl AgentRegistryConfig {
    /// Load from a specific path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: AgentRegistryConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_server_registry() {
        let json = r#"{
            "mcpServers": {
                "kubernetes": {
                    "type": "stdio",
                    "command": "kubectl-mcp",
                    "args": ["--context", "prod"],
                    "allowed_tools": ["get_pods", "get_events"],
                    "masking": {"pattern_groups": ["kubernetes"]}
                },
                "metrics": {
                    "type": "http",
                    "url": "https://metrics.internal/mcp",
                    "bearer_token": "abc",
                    "tls_verify": false,
                    "timeout_secs": 20
                }
            }
        }"#;

        let config: McpConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.servers.len(), 2);

        let k8s = &config.servers["kubernetes"];
        assert!(matches!(k8s.transport, TransportConfig::Stdio { .. }));
        assert_eq!(k8s.allowed_tools.as_deref().unwrap().len(), 2);

        let metrics = &config.servers["metrics"];
        match &metrics.transport {
            TransportConfig::Http { url, tls_verify, timeout_secs, .. } => {
                assert_eq!(url, "https://metrics.internal/mcp");
                assert!(!tls_verify);
                assert_eq!(*timeout_secs, Some(20));
            }
            other => panic!("expected http transport, got {:?}", other),
        }
    }

    #[test]
    fn tls_verify_defaults_on() {
        let json = r#"{
            "mcpServers": {
                "m": {"type": "sse", "url": "https://x/mcp"}
            }
        }"#;
        let config: McpConfig = serde_json::from_str(json).unwrap();
        match &config.servers["m"].transport {
            TransportConfig::Sse { tls_verify, bearer_token, .. } => {
                assert!(*tls_verify);
                assert!(bearer_token.is_none());
            }
            other => panic!("expected sse transport, got {:?}", other),
        }
    }

    #[test]
    fn stdio_env_values_are_expanded() {
        std::env::set_var("TRIAGE_TEST_KUBECONFIG", "/tmp/kubeconfig");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"mcpServers": {{"k8s": {{"type": "stdio", "command": "kubectl-mcp",
                "env": {{"KUBECONFIG": "${{TRIAGE_TEST_KUBECONFIG}}"}}}}}}}}"#
        )
        .unwrap();

        let config = McpConfig::load_from_path(file.path()).unwrap();
        match &config.servers["k8s"].transport {
            TransportConfig::Stdio { env, .. } => {
                assert_eq!(env["KUBECONFIG"], "/tmp/kubeconfig");
            }
            other => panic!("expected stdio transport, got {:?}", other),
        }
    }

    #[test]
    fn parse_agent_registry() {
        let toml = r#"
            [runner]
            max_concurrent_agents = 3
            agent_timeout_secs = 120

            [agents.log-analyzer]
            llm_provider = "anthropic"
            max_iterations = 6
            servers = ["kubernetes"]

            [overrides.log-analyzer]
            max_iterations = 2
        "#;

        let config: AgentRegistryConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.runner.max_concurrent_agents, 3);
        assert_eq!(config.runner.agent_timeout(), Duration::from_secs(120));

        let base = &config.agents["log-analyzer"];
        assert_eq!(base.llm_provider, "anthropic");
        assert_eq!(base.llm_backend, "default");

        let merged = base.with_override(&config.overrides["log-analyzer"]);
        assert_eq!(merged.max_iterations, 2);
        assert_eq!(merged.llm_provider, "anthropic");
    }

    #[test]
    fn runner_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.max_concurrent_agents, 5);
        assert_eq!(config.agent_timeout(), Duration::from_secs(300));
    }
}
