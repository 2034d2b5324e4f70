//! Background health monitoring for tool servers.
//!
//! A single loop probes every configured server on a fixed interval using
//! a dedicated long-lived client, so probe traffic never competes with
//! session traffic for a transport. Failures surface as keyed warnings
//! through the external warnings service; recovery clears them.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::McpServerConfig;
use crate::services::{WarningCategory, WarningsService};
use crate::tools::ToolDefinition;
use super::client::McpClient;

/// Interval between probe rounds.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Budget for a single probe (list-tools or session recreation).
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Probe outcome for one server.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub server_id: String,
    pub healthy: bool,
    pub last_check: DateTime<Utc>,
    pub error_message: Option<String>,
    pub tool_count: usize,
}

struct MonitorTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic prober for the configured tool servers.
pub struct HealthMonitor {
    configs: HashMap<String, McpServerConfig>,
    warnings: Arc<dyn WarningsService>,
    check_interval: Duration,
    ping_timeout: Duration,
    client: StdMutex<Option<Arc<McpClient>>>,
    statuses: StdMutex<HashMap<String, HealthStatus>>,
    cached_tools: StdMutex<HashMap<String, Vec<ToolDefinition>>>,
    task: StdMutex<Option<MonitorTask>>,
}

impl HealthMonitor {
    pub fn new(
        configs: HashMap<String, McpServerConfig>,
        warnings: Arc<dyn WarningsService>,
    ) -> Self {
        Self {
            configs,
            warnings,
            check_interval: CHECK_INTERVAL,
            ping_timeout: PING_TIMEOUT,
            client: StdMutex::new(None),
            statuses: StdMutex::new(HashMap::new()),
            cached_tools: StdMutex::new(HashMap::new()),
            task: StdMutex::new(None),
        }
    }

    /// Shorten the probe cadence, for tests.
    pub fn with_intervals(mut self, check_interval: Duration, ping_timeout: Duration) -> Self {
        self.check_interval = check_interval;
        self.ping_timeout = ping_timeout;
        self
    }

    /// Start the probe loop. Idempotent: a second call while the loop is
    /// running does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().expect("health monitor task poisoned");
        if task.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let monitor = Arc::clone(self);
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            monitor.run(loop_cancel).await;
        });
        *task = Some(MonitorTask { cancel, handle });
        tracing::info!(server_count = self.configs.len(), "health monitor started");
    }

    /// Stop the loop, wait for it to exit, drop the dedicated client, and
    /// clear status and cache maps so a subsequent start begins fresh.
    pub async fn stop(&self) {
        let task = {
            let mut task = self.task.lock().expect("health monitor task poisoned");
            task.take()
        };
        let Some(task) = task else { return };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            tracing::warn!(error = %e, "health monitor loop did not exit cleanly");
        }

        if let Some(client) = self.client.lock().expect("health client poisoned").take() {
            client.close().await;
        }
        self.statuses.lock().expect("statuses poisoned").clear();
        self.cached_tools.lock().expect("cached tools poisoned").clear();
        tracing::info!("health monitor stopped");
    }

    async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.check_all().await;
        }
    }

    fn health_client(&self) -> Arc<McpClient> {
        let mut client = self.client.lock().expect("health client poisoned");
        client
            .get_or_insert_with(|| Arc::new(McpClient::new(self.configs.clone())))
            .clone()
    }

    async fn check_all(&self) {
        let client = self.health_client();
        for server_id in self.configs.keys() {
            self.check_server(&client, server_id).await;
        }
    }

    async fn check_server(&self, client: &McpClient, server_id: &str) {
        // Flush the cache first so the probe actually crosses the wire.
        client.invalidate_tool_cache(server_id);

        let probe = tokio::time::timeout(self.ping_timeout, client.list_tools(server_id)).await;
        let tools = match probe {
            Ok(Ok(tools)) => Ok(tools),
            other => {
                let first_error = probe_error(other);
                tracing::debug!(
                    server_id = %server_id,
                    error = %first_error,
                    "health probe failed, recreating session"
                );
                self.recheck_after_recreate(client, server_id).await
            }
        };

        match tools {
            Ok(tools) => {
                self.record_healthy(server_id, tools);
            }
            Err(message) => {
                self.record_unhealthy(server_id, message);
            }
        }
    }

    /// Second chance: tear the session down and probe once more, each step
    /// under a fresh ping budget.
    async fn recheck_after_recreate(
        &self,
        client: &McpClient,
        server_id: &str,
    ) -> Result<Vec<ToolDefinition>, String> {
        let recreated =
            tokio::time::timeout(self.ping_timeout, client.recreate_session(server_id)).await;
        if let Err(message) = flatten_probe(recreated) {
            return Err(message);
        }
        let probe = tokio::time::timeout(self.ping_timeout, client.list_tools(server_id)).await;
        match probe {
            Ok(Ok(tools)) => Ok(tools),
            other => Err(probe_error(other)),
        }
    }

    fn record_healthy(&self, server_id: &str, tools: Vec<ToolDefinition>) {
        let status = HealthStatus {
            server_id: server_id.to_string(),
            healthy: true,
            last_check: Utc::now(),
            error_message: None,
            tool_count: tools.len(),
        };
        self.statuses
            .lock()
            .expect("statuses poisoned")
            .insert(server_id.to_string(), status);
        self.cached_tools
            .lock()
            .expect("cached tools poisoned")
            .insert(server_id.to_string(), tools);
        self.warnings
            .clear_warning(WarningCategory::McpHealth, server_id);
    }

    fn record_unhealthy(&self, server_id: &str, message: String) {
        tracing::warn!(server_id = %server_id, error = %message, "MCP server unhealthy");
        let status = HealthStatus {
            server_id: server_id.to_string(),
            healthy: false,
            last_check: Utc::now(),
            error_message: Some(message.clone()),
            tool_count: 0,
        };
        self.statuses
            .lock()
            .expect("statuses poisoned")
            .insert(server_id.to_string(), status);
        self.warnings.add_warning(
            WarningCategory::McpHealth,
            &format!("MCP server '{server_id}' is unreachable"),
            &message,
            server_id,
        );
    }

    /// Snapshot of the latest probe outcome per server.
    pub fn get_statuses(&self) -> HashMap<String, HealthStatus> {
        self.statuses.lock().expect("statuses poisoned").clone()
    }

    /// Snapshot of the tool lists observed by the prober.
    pub fn get_cached_tools(&self) -> HashMap<String, Vec<ToolDefinition>> {
        self.cached_tools.lock().expect("cached tools poisoned").clone()
    }

    /// True only when at least one probe has run and every server passed
    /// its latest probe.
    pub fn is_healthy(&self) -> bool {
        let statuses = self.statuses.lock().expect("statuses poisoned");
        !statuses.is_empty() && statuses.values().all(|s| s.healthy)
    }
}

fn probe_error(
    probe: Result<Result<Vec<ToolDefinition>, super::McpError>, tokio::time::error::Elapsed>,
) -> String {
    match probe {
        Ok(Ok(_)) => unreachable!("probe_error called on a successful probe"),
        Ok(Err(e)) => e.to_string(),
        Err(_) => "health probe timed out".to_string(),
    }
}

fn flatten_probe(
    result: Result<Result<(), super::McpError>, tokio::time::error::Elapsed>,
) -> Result<(), String> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("session recreation timed out".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingWarnings {
        added: Mutex<Vec<(WarningCategory, String)>>,
        cleared: Mutex<Vec<(WarningCategory, String)>>,
    }

    impl WarningsService for RecordingWarnings {
        fn add_warning(&self, category: WarningCategory, _message: &str, _detail: &str, key: &str) {
            self.added.lock().unwrap().push((category, key.to_string()));
        }

        fn clear_warning(&self, category: WarningCategory, key: &str) {
            self.cleared.lock().unwrap().push((category, key.to_string()));
        }
    }

    fn unreachable_config() -> HashMap<String, McpServerConfig> {
        let mut configs = HashMap::new();
        configs.insert(
            "dead".to_string(),
            McpServerConfig {
                transport: TransportConfig::Stdio {
                    command: "/nonexistent/tool-server".to_string(),
                    args: Vec::new(),
                    env: Default::default(),
                },
                allowed_tools: None,
                masking: None,
            },
        );
        configs
    }

    #[tokio::test]
    async fn unreachable_server_reports_unhealthy_and_warns() {
        let warnings = Arc::new(RecordingWarnings::default());
        let monitor = HealthMonitor::new(unreachable_config(), warnings.clone());

        let client = monitor.health_client();
        monitor.check_server(&client, "dead").await;

        let statuses = monitor.get_statuses();
        assert!(!statuses["dead"].healthy);
        assert!(statuses["dead"].error_message.is_some());
        assert!(!monitor.is_healthy());

        let added = warnings.added.lock().unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0], (WarningCategory::McpHealth, "dead".to_string()));
    }

    #[tokio::test]
    async fn is_healthy_requires_at_least_one_status() {
        let warnings = Arc::new(RecordingWarnings::default());
        let monitor = HealthMonitor::new(HashMap::new(), warnings);
        // No probes yet: unknown is not healthy.
        assert!(!monitor.is_healthy());
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_clears_state() {
        let warnings = Arc::new(RecordingWarnings::default());
        let monitor = Arc::new(
            HealthMonitor::new(unreachable_config(), warnings)
                .with_intervals(Duration::from_millis(10), Duration::from_millis(50)),
        );

        monitor.start();
        monitor.start();
        // Give the loop a tick to record something.
        tokio::time::sleep(Duration::from_millis(100)).await;
        monitor.stop().await;

        assert!(monitor.get_statuses().is_empty());
        assert!(monitor.get_cached_tools().is_empty());

        // A fresh start after stop must work.
        monitor.start();
        monitor.stop().await;
    }
}
