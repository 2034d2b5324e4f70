//! Bounded concurrent sub-agent scheduling.
//!
//! The runner dispatches sub-agent tasks under a parent session, caps how
//! many may be active at once, and delivers results on a buffered channel
//! sized to that cap. Results arrive in completion order, not dispatch
//! order; callers correlate by the execution ID returned from
//! [`SubAgentRunner::dispatch`].
//!
//! Every sub-agent's cancellation token derives from the session-level
//! token captured at construction, never from a per-iteration caller
//! context, so sub-agents survive orchestrator iterations and die with
//! the session.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, AgentOverride, RunnerConfig};
use crate::services::{
    AgentFactory, ExecutionContext, NewAgentExecution, NewTimelineEvent, StageService,
    TimelineEventKind, TimelineService,
};

pub mod format;

pub use format::format_result_message;

/// Lifecycle state of a sub-agent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Active => "active",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::TimedOut => "timed out",
        };
        f.write_str(s)
    }
}

/// Terminal outcome of one sub-agent execution.
#[derive(Debug, Clone)]
pub struct SubAgentResult {
    pub execution_id: String,
    pub agent_name: String,
    pub task: String,
    pub status: ExecutionStatus,
    pub analysis: Option<String>,
    pub error_message: Option<String>,
}

/// Snapshot row returned by [`SubAgentRunner::list`].
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub agent_name: String,
    pub task: String,
    pub status: ExecutionStatus,
}

/// Errors raised by the runner's synchronous contract.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("agent '{0}' is not registered")]
    UnknownAgent(String),

    #[error("maximum concurrent sub-agents ({0}) exceeded")]
    MaxConcurrentAgentsExceeded(usize),

    #[error("execution '{0}' not found")]
    ExecutionNotFound(String),

    #[error("failed to create execution record: {0}")]
    CreateExecution(anyhow::Error),

    #[error("wait cancelled")]
    WaitCancelled,

    #[error("runner is shut down")]
    ShutDown,
}

struct ExecutionHandle {
    agent_name: String,
    task: String,
    status: ExecutionStatus,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

#[derive(Default)]
struct RunnerState {
    executions: HashMap<String, ExecutionHandle>,
    /// Slots reserved by dispatches that have passed the concurrency check
    /// but not yet registered their execution.
    reserved: usize,
}

/// Identity of the parent execution the runner dispatches under.
#[derive(Debug, Clone)]
pub struct RunnerScope {
    pub parent_execution_id: String,
    pub stage_id: String,
    pub session_id: String,
}

/// Bounded concurrent sub-agent scheduler.
pub struct SubAgentRunner {
    scope: RunnerScope,
    /// Session-level cancellation token; sub-agent tokens derive from it.
    session_cancel: CancellationToken,
    max_concurrent: usize,
    agent_timeout: Duration,
    agents: HashMap<String, AgentConfig>,
    overrides: HashMap<String, AgentOverride>,
    stage: Arc<dyn StageService>,
    timeline: Arc<dyn TimelineService>,
    factory: Arc<dyn AgentFactory>,
    state: StdMutex<RunnerState>,
    /// Dispatched-but-unconsumed results.
    pending: AtomicI64,
    next_agent_index: AtomicU64,
    results_tx: mpsc::Sender<SubAgentResult>,
    results_rx: AsyncMutex<mpsc::Receiver<SubAgentResult>>,
    /// Cancelled once by `cancel_all`; workers drop their results instead
    /// of publishing after this fires.
    shutdown: CancellationToken,
}

impl SubAgentRunner {
    /// Build a runner rooted in the session-level cancellation token.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scope: RunnerScope,
        session_cancel: CancellationToken,
        config: RunnerConfig,
        agents: HashMap<String, AgentConfig>,
        overrides: HashMap<String, AgentOverride>,
        stage: Arc<dyn StageService>,
        timeline: Arc<dyn TimelineService>,
        factory: Arc<dyn AgentFactory>,
    ) -> Arc<Self> {
        let capacity = config.max_concurrent_agents.max(1);
        let (results_tx, results_rx) = mpsc::channel(capacity);
        Arc::new(Self {
            scope,
            session_cancel,
            max_concurrent: capacity,
            agent_timeout: config.agent_timeout(),
            agents,
            overrides,
            stage,
            timeline,
            factory,
            state: StdMutex::new(RunnerState::default()),
            pending: AtomicI64::new(0),
            next_agent_index: AtomicU64::new(0),
            results_tx,
            results_rx: AsyncMutex::new(results_rx),
            shutdown: CancellationToken::new(),
        })
    }

    /// Dispatch a sub-agent. Reserves a concurrency slot, creates the
    /// child execution record, registers the execution, and spawns the
    /// worker. Returns the new execution ID immediately.
    pub async fn dispatch(
        self: &Arc<Self>,
        agent_name: &str,
        task: &str,
    ) -> Result<String, RunnerError> {
        let base = self
            .agents
            .get(agent_name)
            .ok_or_else(|| RunnerError::UnknownAgent(agent_name.to_string()))?;
        let config = match self.overrides.get(agent_name) {
            Some(ov) => base.with_override(ov),
            None => base.clone(),
        };

        // Slot reservation: the check and the increment happen under one
        // lock hold, so two racing dispatches cannot both pass the check.
        {
            let mut state = self.state.lock().expect("runner state poisoned");
            let active = state
                .executions
                .values()
                .filter(|e| e.status == ExecutionStatus::Active)
                .count();
            if active + state.reserved >= self.max_concurrent {
                return Err(RunnerError::MaxConcurrentAgentsExceeded(self.max_concurrent));
            }
            state.reserved += 1;
        }
        let reservation = ReservationGuard::new(&self.state);

        let agent_index = self.next_agent_index.fetch_add(1, Ordering::Relaxed);
        let execution_id = self
            .stage
            .create_agent_execution(NewAgentExecution {
                parent_execution_id: self.scope.parent_execution_id.clone(),
                stage_id: self.scope.stage_id.clone(),
                session_id: self.scope.session_id.clone(),
                agent_name: agent_name.to_string(),
                agent_index,
                llm_provider: config.llm_provider.clone(),
                llm_backend: config.llm_backend.clone(),
                task: task.to_string(),
            })
            .await
            .map_err(RunnerError::CreateExecution)?;

        let cancel = self.session_cancel.child_token();
        let (done_tx, done_rx) = watch::channel(false);

        // Registration and reservation release in a single lock hold.
        {
            let mut state = self.state.lock().expect("runner state poisoned");
            state.executions.insert(
                execution_id.clone(),
                ExecutionHandle {
                    agent_name: agent_name.to_string(),
                    task: task.to_string(),
                    status: ExecutionStatus::Active,
                    cancel: cancel.clone(),
                    done: done_rx,
                },
            );
            state.reserved -= 1;
        }
        reservation.disarm();

        self.pending.fetch_add(1, Ordering::SeqCst);
        self.record_task_assignment(&execution_id, agent_name, task).await;

        let ctx = ExecutionContext {
            execution_id: execution_id.clone(),
            session_id: self.scope.session_id.clone(),
            stage_id: self.scope.stage_id.clone(),
            agent_name: agent_name.to_string(),
            llm_provider: config.llm_provider.clone(),
            llm_backend: config.llm_backend.clone(),
            task: task.to_string(),
            server_ids: config.servers.clone(),
            max_iterations: config.max_iterations,
        };

        let runner = Arc::clone(self);
        let worker_id = execution_id.clone();
        tokio::spawn(async move {
            runner.run_execution(worker_id, ctx, cancel, done_tx).await;
        });

        tracing::info!(
            execution_id = %execution_id,
            agent = %agent_name,
            "sub-agent dispatched"
        );
        Ok(execution_id)
    }

    /// Append a task-assignment event to the parent execution's timeline.
    /// Timeline failures are logged, never fatal.
    async fn record_task_assignment(&self, execution_id: &str, agent_name: &str, task: &str) {
        let parent = &self.scope.parent_execution_id;
        let sequence = match self.timeline.max_sequence_number(parent).await {
            Ok(seq) => seq + 1,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read timeline sequence, skipping event");
                return;
            }
        };
        let event = NewTimelineEvent {
            execution_id: parent.clone(),
            sequence,
            kind: TimelineEventKind::TaskAssignment,
            summary: format!("dispatched sub-agent '{agent_name}'"),
            payload: serde_json::json!({
                "child_execution_id": execution_id,
                "agent_name": agent_name,
                "task": task,
            }),
        };
        if let Err(e) = self.timeline.create_timeline_event(event).await {
            tracing::warn!(error = %e, "failed to record task assignment event");
        }
    }

    async fn run_execution(
        self: Arc<Self>,
        execution_id: String,
        ctx: ExecutionContext,
        cancel: CancellationToken,
        done_tx: watch::Sender<bool>,
    ) {
        let (status, analysis, error_message) = self.execute_agent(&ctx, &cancel).await;

        {
            let mut state = self.state.lock().expect("runner state poisoned");
            if let Some(handle) = state.executions.get_mut(&execution_id) {
                handle.status = status;
            }
        }
        if let Err(e) = self
            .stage
            .update_agent_execution_status(&execution_id, status, error_message.clone())
            .await
        {
            tracing::warn!(execution_id = %execution_id, error = %e, "failed to persist execution status");
        }

        let result = SubAgentResult {
            execution_id: execution_id.clone(),
            agent_name: ctx.agent_name.clone(),
            task: ctx.task.clone(),
            status,
            analysis,
            error_message,
        };

        // Publish, unless a bulk shutdown is in progress. The buffer is
        // sized to the concurrency cap, so a full channel means the parent
        // stopped draining; blocking here is the intended back-pressure.
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                tracing::debug!(execution_id = %execution_id, "dropping sub-agent result during shutdown");
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
            sent = self.results_tx.send(result) => {
                if sent.is_err() {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        let _ = done_tx.send(true);
        tracing::info!(execution_id = %execution_id, status = %status, "sub-agent finished");
    }

    /// Run the agent and classify its terminal status: deadline expiry is
    /// `TimedOut`, any other cancellation is `Cancelled`, an agent error
    /// is `Failed`.
    async fn execute_agent(
        &self,
        ctx: &ExecutionContext,
        cancel: &CancellationToken,
    ) -> (ExecutionStatus, Option<String>, Option<String>) {
        let agent = match self.factory.create_agent(ctx).await {
            Ok(agent) => agent,
            Err(e) => {
                return (ExecutionStatus::Failed, None, Some(format!("failed to create agent: {e}")));
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                (ExecutionStatus::Cancelled, None, Some("execution cancelled".to_string()))
            }
            outcome = tokio::time::timeout(self.agent_timeout, agent.execute(ctx, &ctx.task)) => {
                match outcome {
                    Err(_elapsed) => (
                        ExecutionStatus::TimedOut,
                        None,
                        Some(format!("timed out after {:?}", self.agent_timeout)),
                    ),
                    Ok(Ok(result)) => (ExecutionStatus::Completed, Some(result.analysis), None),
                    Ok(Err(e)) => {
                        if cancel.is_cancelled() {
                            (ExecutionStatus::Cancelled, None, Some("execution cancelled".to_string()))
                        } else {
                            (ExecutionStatus::Failed, None, Some(e.to_string()))
                        }
                    }
                }
            }
        }
    }

    /// Non-blocking receive of the next completed result.
    pub fn try_get_next(&self) -> Option<SubAgentResult> {
        let mut rx = self.results_rx.try_lock().ok()?;
        match rx.try_recv() {
            Ok(result) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                Some(result)
            }
            Err(_) => None,
        }
    }

    /// Blocking receive of the next completed result. A cancellation while
    /// a result is buffered leaves the result in the channel for the next
    /// caller.
    pub async fn wait_for_next(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SubAgentResult, RunnerError> {
        let mut rx = self.results_rx.lock().await;
        // Biased toward cancellation: a caller whose context died while a
        // result sat in the buffer gets the cancellation error and the
        // result stays queued for the next caller.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RunnerError::WaitCancelled),
            received = rx.recv() => match received {
                Some(result) => {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    Ok(result)
                }
                None => Err(RunnerError::ShutDown),
            }
        }
    }

    /// True while any dispatched result has not been consumed.
    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    /// Request cancellation of one execution. Terminal executions report
    /// their status instead.
    pub fn cancel(&self, execution_id: &str) -> Result<String, RunnerError> {
        let state = self.state.lock().expect("runner state poisoned");
        let handle = state
            .executions
            .get(execution_id)
            .ok_or_else(|| RunnerError::ExecutionNotFound(execution_id.to_string()))?;
        if handle.status != ExecutionStatus::Active {
            return Ok(format!("already {}", handle.status));
        }
        handle.cancel.cancel();
        tracing::info!(execution_id = %execution_id, "sub-agent cancellation requested");
        Ok("cancellation requested".to_string())
    }

    /// Snapshot of every execution the runner has seen.
    pub fn list(&self) -> Vec<ExecutionSummary> {
        let state = self.state.lock().expect("runner state poisoned");
        state
            .executions
            .iter()
            .map(|(id, handle)| ExecutionSummary {
                execution_id: id.clone(),
                agent_name: handle.agent_name.clone(),
                task: handle.task.clone(),
                status: handle.status,
            })
            .collect()
    }

    /// Cancel every active execution and switch workers to drop-on-publish.
    /// Idempotent: the shutdown token only fires once.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
        let state = self.state.lock().expect("runner state poisoned");
        for (id, handle) in &state.executions {
            if handle.status == ExecutionStatus::Active {
                tracing::debug!(execution_id = %id, "cancelling sub-agent for shutdown");
                handle.cancel.cancel();
            }
        }
    }

    /// Wait until every dispatched worker has finished. Callers bound this
    /// with their own timeout.
    pub async fn wait_all(&self) {
        let receivers: Vec<watch::Receiver<bool>> = {
            let state = self.state.lock().expect("runner state poisoned");
            state.executions.values().map(|h| h.done.clone()).collect()
        };
        for mut done in receivers {
            // An error means the worker dropped its sender after sending,
            // which still counts as done.
            let _ = done.wait_for(|finished| *finished).await;
        }
    }
}

/// Decrements the reservation counter on drop unless disarmed. Covers the
/// window between slot reservation and execution registration.
struct ReservationGuard<'a> {
    state: &'a StdMutex<RunnerState>,
    armed: bool,
}

impl<'a> ReservationGuard<'a> {
    fn new(state: &'a StdMutex<RunnerState>) -> Self {
        Self { state, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.state.lock().expect("runner state poisoned");
            state.reserved = state.reserved.saturating_sub(1);
        }
    }
}
