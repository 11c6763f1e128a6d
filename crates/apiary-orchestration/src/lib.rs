#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **apiary-orchestration** – The orchestration engine tying the Apiary
//! control plane together.
//!
//! The [`Orchestrator`] owns component bring-up and tear-down ordering,
//! wires every component onto the shared event bus, runs the periodic
//! health/maintenance/metrics timers, and applies the agent error and
//! deadlock policies. External collaborators (memory store, terminal
//! backend, coordination, MCP) are injected at construction; there are no
//! globals.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use apiary_orchestration::{Orchestrator, collaborators::*};
//! use apiary_store_memory::InMemoryStore;
//! use apiary_types::OrchestratorConfig;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let orchestrator = Orchestrator::new(
//!     OrchestratorConfig::default(),
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(LoopbackTerminalBackend::new()),
//!     Arc::new(LoopbackCoordination),
//!     Arc::new(LoopbackMcpServer::new()),
//! );
//! orchestrator.initialize().await?;
//! // ... submit tasks, create agents ...
//! orchestrator.shutdown("done").await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use apiary_agents::AgentManager;
use apiary_bus::{EventBus, SwarmEvent};
use apiary_core::{retry_with_backoff, CircuitBreaker, CircuitBreakerConfig, RetryPolicy};
use apiary_dispatch::{DispatchConfig, TaskDispatcher};
use apiary_monitoring::{AlertEngine, MetricStore};
use apiary_sessions::{SessionManager, SnapshotMetrics};
use apiary_types::ports::{CoordinationBackend, McpServer, MemoryStore, TerminalBackend};
use apiary_types::{
    AgentId, AlertCondition, AlertLevel, AlertRule, OrchestratorConfig,
};

pub mod actions;
pub mod collaborators;
pub mod directory;

pub use actions::ManagerAlertActions;
pub use directory::ManagerDirectory;

/// Agent errors tolerated before an agent is terminated permanently.
const AGENT_ERROR_LIMIT: u32 = 3;

/// Delay before an errored agent is respawned.
const AGENT_RESPAWN_DELAY: Duration = Duration::from_secs(2);

/// Overall system health as seen by the health-check timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "status")]
pub enum SystemHealth {
    /// Every probe passing.
    Healthy,
    /// Probes failing repeatedly; the sentinel reason says why.
    Degraded {
        /// Why the system is degraded.
        reason: String,
    },
}

/// Orchestrator-level lifecycle state.
#[derive(Debug, Clone)]
pub struct OrchestratorState {
    /// Whether `initialize` completed.
    pub initialized: bool,
    /// Whether a shutdown is in progress or done.
    pub shutdown_in_progress: bool,
    /// When the orchestrator was constructed.
    pub start_time: DateTime<Utc>,
    /// Health as of the last check.
    pub health: SystemHealth,
}

/// Task counters maintained from bus events.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeMetrics {
    /// Tasks completed.
    pub completed_tasks: u64,
    /// Tasks terminally failed.
    pub failed_tasks: u64,
    /// Sum of task execution time.
    pub total_task_duration: Duration,
}

/// The orchestration engine.
pub struct Orchestrator {
    config: OrchestratorConfig,
    bus: EventBus,
    store: Arc<dyn MemoryStore>,
    terminal: Arc<dyn TerminalBackend>,
    coordination: Arc<dyn CoordinationBackend>,
    mcp: Arc<dyn McpServer>,
    manager: Arc<AgentManager>,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<TaskDispatcher>,
    alert_engine: Arc<AlertEngine>,
    metric_store: Arc<MetricStore>,
    state: std::sync::RwLock<OrchestratorState>,
    metrics: std::sync::Mutex<RuntimeMetrics>,
    agent_error_counts: DashMap<AgentId, u32>,
    health_breaker: CircuitBreaker,
    timers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("initialized", &self.state().initialized)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build an orchestrator over the injected collaborators. Nothing is
    /// started until [`Orchestrator::initialize`] runs.
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn MemoryStore>,
        terminal: Arc<dyn TerminalBackend>,
        coordination: Arc<dyn CoordinationBackend>,
        mcp: Arc<dyn McpServer>,
    ) -> Arc<Self> {
        let bus = EventBus::default();
        let manager = AgentManager::new(config.clone(), Arc::clone(&store), bus.clone());
        let dispatcher = TaskDispatcher::new(
            DispatchConfig {
                queue_size: config.task_queue_size,
                max_retries: config.task_max_retries,
            },
            Arc::new(ManagerDirectory::new(Arc::clone(&manager))),
            bus.clone(),
        );
        let alert_engine = Arc::new(AlertEngine::new(bus.clone()));
        let metric_store = Arc::new(MetricStore::new(
            Arc::clone(&alert_engine),
            config.metrics_retention,
        ));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&terminal),
            Arc::clone(&store),
        ));

        Arc::new(Self {
            bus,
            store,
            terminal,
            coordination,
            mcp,
            manager,
            sessions,
            dispatcher,
            alert_engine,
            metric_store,
            state: std::sync::RwLock::new(OrchestratorState {
                initialized: false,
                shutdown_in_progress: false,
                start_time: Utc::now(),
                health: SystemHealth::Healthy,
            }),
            metrics: std::sync::Mutex::new(RuntimeMetrics::default()),
            agent_error_counts: DashMap::new(),
            health_breaker: CircuitBreaker::new(
                "HealthCheck",
                CircuitBreakerConfig::new(3, Duration::from_secs(10), Duration::from_secs(30)),
            ),
            timers: std::sync::Mutex::new(Vec::new()),
            config,
        })
    }

    //─────────────────────────────
    //  Bring-up
    //─────────────────────────────

    /// Bring the control plane up: initialize collaborators in parallel
    /// with retry, start the MCP server, restore sessions, wire event
    /// handlers, start timers, and announce readiness. Any failure
    /// triggers an emergency shutdown before the error propagates.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        if self.state().initialized {
            return Ok(());
        }
        info!("initializing orchestrator");

        match self.initialize_inner().await {
            Ok(()) => {
                {
                    let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                    state.initialized = true;
                }
                self.bus.emit(SwarmEvent::SystemReady);
                info!("orchestrator ready");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "initialization failed, running emergency shutdown");
                self.emergency_shutdown().await;
                Err(err)
            }
        }
    }

    async fn initialize_inner(self: &Arc<Self>) -> Result<()> {
        let policy = RetryPolicy::initialization();

        let (terminal, memory, coordination) = tokio::join!(
            retry_with_backoff("terminal.initialize", &policy, || self.terminal.initialize()),
            retry_with_backoff("memory.initialize", &policy, || self.store.initialize()),
            retry_with_backoff("coordination.initialize", &policy, || {
                self.coordination.initialize()
            }),
        );
        terminal.context("terminal backend initialization")?;
        memory.context("memory store initialization")?;
        coordination.context("coordination backend initialization")?;

        self.mcp.start().await.context("starting MCP server")?;

        let restored = self
            .sessions
            .restore_sessions()
            .await
            .context("restoring sessions")?;
        debug!(restored, "session restore complete");

        // Event wiring.
        self.manager.attach();
        self.alert_engine
            .set_action_handler(Arc::new(ManagerAlertActions::new(Arc::clone(&self.manager))))
            .await;
        self.install_default_rules().await;
        let dispatcher_loop = self.dispatcher.attach();
        let event_loop = {
            let orchestrator = Arc::clone(self);
            tokio::spawn(async move { orchestrator.event_loop().await })
        };

        // Timers.
        self.manager.start_monitors();
        self.metric_store.start(self.config.metrics_interval).await;
        let health_timer = self.spawn_timer(self.config.health_check_interval, |o| async move {
            o.run_health_check().await;
        });
        let maintenance_timer = self.spawn_timer(self.config.maintenance_interval, |o| async move {
            o.run_maintenance().await;
        });
        let metrics_timer = self.spawn_timer(self.config.metrics_interval, |o| async move {
            o.collect_metrics().await;
        });

        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        timers.extend([
            dispatcher_loop,
            event_loop,
            health_timer,
            maintenance_timer,
            metrics_timer,
        ]);
        Ok(())
    }

    fn spawn_timer<F, Fut>(self: &Arc<Self>, interval: Duration, body: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                body(Arc::clone(&orchestrator)).await;
            }
        })
    }

    //─────────────────────────────
    //  Event wiring
    //─────────────────────────────

    async fn event_loop(self: Arc<Self>) {
        let mut rx = self.bus.subscribe();
        loop {
            match rx.recv().await {
                Ok(SwarmEvent::TaskCompleted { execution_time, .. }) => {
                    let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
                    metrics.completed_tasks += 1;
                    metrics.total_task_duration += execution_time;
                }
                Ok(SwarmEvent::TaskFailed { task_id, .. }) => {
                    {
                        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
                        metrics.failed_tasks += 1;
                    }
                    debug!(task_id = %task_id, "recording task failure metric");
                    self.metric_store
                        .record("task.failed", 1.0, Default::default())
                        .await;
                }
                Ok(SwarmEvent::AgentStatusChanged {
                    to: apiary_types::AgentStatus::Idle,
                    ..
                }) => {
                    // A slot opened up somewhere.
                    self.dispatcher.process_queue().await;
                }
                Ok(SwarmEvent::AgentError { agent_id, error }) => {
                    // Heartbeat timeouts are owned by the manager's
                    // watchdog; everything else hits the error policy.
                    if error != "heartbeat_timeout" {
                        self.handle_agent_error(agent_id).await;
                    }
                }
                Ok(SwarmEvent::SystemError { component, error }) => {
                    error!(component, error, "component error reported");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "orchestrator event loop lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Error policy: tolerate a couple of faults with a delayed respawn,
    /// then terminate the agent permanently.
    async fn handle_agent_error(self: &Arc<Self>, agent_id: AgentId) {
        let count = {
            let mut entry = self.agent_error_counts.entry(agent_id).or_insert(0);
            *entry += 1;
            *entry
        };
        if count < AGENT_ERROR_LIMIT {
            info!(agent_id = %agent_id, count, "agent error, scheduling respawn");
            let orchestrator = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(AGENT_RESPAWN_DELAY).await;
                if let Err(err) = orchestrator
                    .manager
                    .restart_agent(agent_id, "agent error recovery")
                    .await
                {
                    warn!(agent_id = %agent_id, error = %err, "error-policy respawn failed");
                }
            });
        } else {
            warn!(agent_id = %agent_id, count, "agent error limit reached, terminating permanently");
            if let Err(err) = self
                .manager
                .stop_agent(agent_id, "repeated agent errors")
                .await
            {
                warn!(agent_id = %agent_id, error = %err, "terminating errored agent failed");
            }
        }
    }

    async fn install_default_rules(&self) {
        let mapping: &[(&str, &str, AlertCondition)] = &[
            ("cpu", "system.cpu", AlertCondition::Gt),
            ("memory", "system.memory", AlertCondition::Gt),
            ("disk", "system.disk", AlertCondition::Gt),
            ("errorRate", "error.rate", AlertCondition::Gt),
            ("responseTime", "response.time", AlertCondition::Gt),
            ("queueDepth", "queue.depth", AlertCondition::Gt),
            ("agentHealth", "agent.health", AlertCondition::Lt),
            ("swarmUtilization", "swarm.utilization", AlertCondition::Gt),
        ];
        for (key, metric, condition) in mapping {
            if let Some(threshold) = self.config.alert_thresholds.get(*key) {
                self.alert_engine
                    .add_rule(AlertRule::new(
                        format!("{key} warning"),
                        *metric,
                        *condition,
                        threshold.warning,
                        AlertLevel::Warning,
                    ))
                    .await;
                self.alert_engine
                    .add_rule(AlertRule::new(
                        format!("{key} critical"),
                        *metric,
                        *condition,
                        threshold.critical,
                        AlertLevel::Critical,
                    ))
                    .await;
            }
        }
    }

    //─────────────────────────────
    //  Periodic work
    //─────────────────────────────

    /// Probe the collaborators through the health-check breaker. Repeated
    /// failures degrade status instead of erroring out.
    pub async fn run_health_check(self: &Arc<Self>) {
        let store = Arc::clone(&self.store);
        let result = self
            .health_breaker
            .call(move || async move {
                store
                    .get("health:probe")
                    .await
                    .context("memory store probe")?;
                Ok(())
            })
            .await;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match result {
            Ok(()) => state.health = SystemHealth::Healthy,
            Err(err) => {
                warn!(error = %err, "health check failed");
                state.health = SystemHealth::Degraded {
                    reason: "health checks failing".to_string(),
                };
            }
        }
    }

    /// Periodic maintenance: purge expired sessions and task history, let
    /// every sub-component clean house, and evaluate pool autoscaling.
    pub async fn run_maintenance(self: &Arc<Self>) {
        debug!("running maintenance pass");
        let sessions = self.sessions.cleanup_terminated(self.config.session_retention);
        let tasks = self
            .dispatcher
            .cleanup_history(self.config.task_history_retention);
        self.alert_engine.maintenance().await;
        if let Err(err) = self.store.maintenance().await {
            warn!(error = %err, "memory store maintenance failed");
        }
        if let Err(err) = self.terminal.maintenance().await {
            warn!(error = %err, "terminal maintenance failed");
        }
        if let Err(err) = self.coordination.maintenance().await {
            warn!(error = %err, "coordination maintenance failed");
        }
        self.manager.autoscale_pools().await;
        debug!(sessions, tasks, "maintenance pass complete");
    }

    /// Sample swarm-level gauges into the metric store and publish a
    /// metrics-update event.
    pub async fn collect_metrics(self: &Arc<Self>) {
        let agents = self.manager.list_agents();
        let active: Vec<_> = agents.iter().filter(|a| a.status.is_active()).collect();
        let queue_depth = self.dispatcher.queue_depth() as f64;
        let utilization = if active.is_empty() {
            0.0
        } else {
            active.iter().map(|a| a.workload).sum::<f64>() / active.len() as f64
        };
        let min_health = active
            .iter()
            .map(|a| a.health)
            .fold(f64::INFINITY, f64::min);

        self.metric_store
            .record("queue.depth", queue_depth, Default::default())
            .await;
        self.metric_store
            .record("swarm.utilization", utilization, Default::default())
            .await;
        if min_health.is_finite() {
            self.metric_store
                .record("agent.health", min_health, Default::default())
                .await;
        }

        let runtime = self.runtime_metrics();
        let stats = self.dispatcher.stats();
        let swarm_metrics = serde_json::json!({
            "activeAgents": active.len(),
            "queueDepth": queue_depth,
            "utilization": utilization,
            "completedTasks": runtime.completed_tasks,
            "failedTasks": runtime.failed_tasks,
            "inFlight": stats.in_flight,
        });
        self.bus.emit(SwarmEvent::SwarmMetricsUpdate {
            metrics: swarm_metrics.clone(),
        });

        // Durable monitoring snapshot alongside the in-memory series.
        let mut export = self.metric_store.export_snapshot().await;
        if let Some(document) = export.as_object_mut() {
            document.insert(
                "systemMetrics".to_string(),
                serde_json::json!({
                    "uptimeSeconds": (Utc::now() - self.state().start_time).num_seconds(),
                    "health": self.state().health,
                }),
            );
            document.insert("swarmMetrics".to_string(), swarm_metrics);
        }
        if let Err(err) = self.store.put("monitoring:export", export).await {
            warn!(error = %err, "failed to persist monitoring export");
        }
    }

    //─────────────────────────────
    //  Tear-down
    //─────────────────────────────

    /// Orderly shutdown: stop timers, persist sessions, drain critical
    /// tasks best-effort, terminate sessions, stop agents, and shut down
    /// collaborators concurrently within the configured bound.
    pub async fn shutdown(self: &Arc<Self>, reason: &str) -> Result<()> {
        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            if state.shutdown_in_progress {
                return Ok(());
            }
            state.shutdown_in_progress = true;
        }
        info!(reason, "shutting down orchestrator");

        self.abort_timers();
        self.metric_store.stop().await;

        if let Err(err) = self.sessions.persist_sessions(self.snapshot_metrics()).await {
            warn!(error = %err, "session persistence during shutdown failed");
        }

        self.drain_critical_tasks().await;
        self.sessions.terminate_all_sessions().await;
        self.manager.shutdown().await;

        let shutdowns = async {
            let results = join_all([
                self.terminal.shutdown(),
                self.store.shutdown(),
                self.coordination.shutdown(),
            ])
            .await;
            for result in results {
                if let Err(err) = result {
                    warn!(error = %err, "collaborator shutdown failed");
                }
            }
            if let Err(err) = self.mcp.stop().await {
                warn!(error = %err, "MCP stop failed");
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout, shutdowns)
            .await
            .is_err()
        {
            warn!("collaborator shutdown exceeded the configured bound");
        }

        self.bus.emit(SwarmEvent::SystemShutdown {
            reason: reason.to_string(),
        });
        info!("orchestrator shutdown complete");
        Ok(())
    }

    /// Best-effort wait for critical tasks to finish before teardown.
    async fn drain_critical_tasks(&self) {
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout / 2;
        loop {
            let critical = self.dispatcher.critical_tasks();
            if critical.is_empty() {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = critical.len(),
                    "abandoning critical task drain at deadline"
                );
                return;
            }
            debug!(remaining = critical.len(), "draining critical tasks");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Shut everything down concurrently, swallowing errors. Used when
    /// initialization fails partway.
    pub async fn emergency_shutdown(self: &Arc<Self>) {
        warn!("emergency shutdown");
        self.abort_timers();
        self.metric_store.stop().await;
        self.manager.shutdown().await;
        let _ = join_all([
            self.terminal.shutdown(),
            self.store.shutdown(),
            self.coordination.shutdown(),
        ])
        .await;
        let _ = self.mcp.stop().await;
    }

    fn abort_timers(&self) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        for timer in timers.drain(..) {
            timer.abort();
        }
    }

    //─────────────────────────────
    //  Accessors
    //─────────────────────────────

    /// The shared event bus.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The agent manager.
    pub fn manager(&self) -> &Arc<AgentManager> {
        &self.manager
    }

    /// The task dispatcher.
    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    /// The session manager.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// The alert engine.
    pub fn alert_engine(&self) -> &Arc<AlertEngine> {
        &self.alert_engine
    }

    /// The metric store.
    pub fn metric_store(&self) -> &Arc<MetricStore> {
        &self.metric_store
    }

    /// Current lifecycle state snapshot.
    pub fn state(&self) -> OrchestratorState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Current task counters.
    pub fn runtime_metrics(&self) -> RuntimeMetrics {
        *self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot_metrics(&self) -> SnapshotMetrics {
        let metrics = self.runtime_metrics();
        SnapshotMetrics {
            completed_tasks: metrics.completed_tasks,
            failed_tasks: metrics.failed_tasks,
            total_task_duration: metrics.total_task_duration,
        }
    }
}
