//! The agent manager: creation, supervision, and lifecycle.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use apiary_bus::{EventBus, SwarmEvent, Topic};
use apiary_types::ports::MemoryStore;
use apiary_types::template::TemplateOverride;
use apiary_types::{
    AgentErrorKind, AgentErrorRecord, AgentId, AgentPool, AgentRecord, AgentStatus, BoundedHistory,
    ErrorSeverity, HealthRecord, OrchestratorConfig, PoolId, ResourceUsage, SwarmId, TaskId,
    ERROR_HISTORY_CAPACITY, PERFORMANCE_HISTORY_CAPACITY, TASK_HISTORY_CAPACITY,
};

use crate::process::{ProcessExit, SupervisedProcess};
use crate::templates::TemplateRegistry;
use crate::{AgentManagerError, AgentResult, SwarmStats, MAX_RESTART_ATTEMPTS};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) total_created: u64,
    pub(crate) total_started: u64,
    pub(crate) total_stopped: u64,
    pub(crate) total_restarts: u64,
}

/// Owner of all agent records, process handles, and pools.
pub struct AgentManager {
    pub(crate) config: OrchestratorConfig,
    pub(crate) swarm_id: SwarmId,
    pub(crate) templates: Mutex<TemplateRegistry>,
    pub(crate) agents: DashMap<AgentId, AgentRecord>,
    pub(crate) processes: DashMap<AgentId, SupervisedProcess>,
    pub(crate) pools: DashMap<PoolId, AgentPool>,
    pub(crate) health: DashMap<AgentId, HealthRecord>,
    pub(crate) perf_history: DashMap<AgentId, BoundedHistory<Duration>>,
    pub(crate) restart_attempts: DashMap<AgentId, u32>,
    /// Agents with a restart scheduled or in flight. The watchdog keeps
    /// flagging a stale agent on every tick; only one recovery runs at a
    /// time.
    pub(crate) pending_restarts: DashMap<AgentId, ()>,
    instance_counters: DashMap<String, u32>,
    pub(crate) counters: Mutex<Counters>,
    started_at: Instant,
    pub(crate) store: Arc<dyn MemoryStore>,
    pub(crate) bus: EventBus,
    pub(crate) monitor_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for AgentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentManager")
            .field("agents", &self.agents.len())
            .field("pools", &self.pools.len())
            .finish_non_exhaustive()
    }
}

impl AgentManager {
    /// Create a manager with the built-in template registry.
    pub fn new(config: OrchestratorConfig, store: Arc<dyn MemoryStore>, bus: EventBus) -> Arc<Self> {
        let templates =
            TemplateRegistry::builtin(&config.agent_defaults, &config.environment_defaults);
        Arc::new(Self {
            swarm_id: SwarmId::new(),
            templates: Mutex::new(templates),
            agents: DashMap::new(),
            processes: DashMap::new(),
            pools: DashMap::new(),
            health: DashMap::new(),
            perf_history: DashMap::new(),
            restart_attempts: DashMap::new(),
            pending_restarts: DashMap::new(),
            instance_counters: DashMap::new(),
            counters: Mutex::new(Counters::default()),
            started_at: Instant::now(),
            store,
            bus,
            monitor_tasks: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Register bus handlers that keep agent records in sync with signals
    /// from agent processes.
    pub fn attach(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        self.bus.on(Topic::AgentHeartbeat, move |event| {
            if let SwarmEvent::AgentHeartbeat {
                agent_id,
                timestamp,
                ..
            } = event
            {
                manager.record_heartbeat(*agent_id, *timestamp);
            }
            Ok(())
        });

        let manager = Arc::clone(self);
        self.bus.on(Topic::ResourceUsage, move |event| {
            if let SwarmEvent::ResourceUsage { agent_id, usage } = event {
                manager.record_resource_usage(*agent_id, *usage);
            }
            Ok(())
        });
    }

    //─────────────────────────────
    //  Creation and lifecycle
    //─────────────────────────────

    /// Create an agent from a registered template plus overrides. The new
    /// agent starts in `initializing` and is persisted before the id is
    /// returned.
    #[instrument(skip(self, overrides))]
    pub async fn create_agent(
        &self,
        template_name: &str,
        overrides: &TemplateOverride,
    ) -> AgentResult<AgentId> {
        let active = self.active_count();
        if active >= self.config.max_agents {
            return Err(AgentManagerError::LimitExceeded {
                limit: self.config.max_agents,
            });
        }

        let template = {
            let registry = self.templates.lock().unwrap_or_else(|e| e.into_inner());
            registry
                .get(template_name)
                .cloned()
                .ok_or_else(|| AgentManagerError::TemplateNotFound(template_name.to_string()))?
        };
        let effective = template.merged(overrides);

        let instance = {
            let mut counter = self
                .instance_counters
                .entry(effective.agent_type.clone())
                .or_insert(0);
            *counter += 1;
            *counter
        };

        let record = AgentRecord {
            id: AgentId::new(),
            swarm_id: self.swarm_id,
            agent_type: effective.agent_type.clone(),
            instance,
            name: format!("{} {}", effective.name, instance),
            status: AgentStatus::Initializing,
            capabilities: effective.capabilities,
            config: effective.config,
            environment: effective.environment,
            startup_script: effective.startup_script,
            metrics: Default::default(),
            health: 1.0,
            workload: 0.0,
            last_heartbeat: Utc::now(),
            current_tasks: Vec::new(),
            task_history: BoundedHistory::new(TASK_HISTORY_CAPACITY),
            error_history: BoundedHistory::new(ERROR_HISTORY_CAPACITY),
            collaborators: Vec::new(),
            children: Vec::new(),
            created_at: Utc::now(),
        };
        let agent_id = record.id;

        self.persist_record(&record).await?;
        self.perf_history
            .insert(agent_id, BoundedHistory::new(PERFORMANCE_HISTORY_CAPACITY));
        self.agents.insert(agent_id, record);
        {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            counters.total_created += 1;
        }

        info!(agent_id = %agent_id, template = template_name, "agent created");
        Ok(agent_id)
    }

    /// Start an agent: spawn its process, watch for exit, and wait for the
    /// ready signal within the configured timeout.
    #[instrument(skip(self))]
    pub async fn start_agent(self: &Arc<Self>, agent_id: AgentId) -> AgentResult<()> {
        let record = self
            .agent(agent_id)
            .ok_or(AgentManagerError::AgentNotFound(agent_id))?;
        if !record.status.can_start() {
            return Err(AgentManagerError::InvalidTransition {
                id: agent_id,
                operation: "start",
                status: record.status,
            });
        }

        // Subscribe before spawning so a fast child's ready signal cannot
        // slip past the wait below.
        let mut ready_rx = self.bus.subscribe();

        let process = match SupervisedProcess::spawn(&record) {
            Ok(process) => process,
            Err(err) => {
                self.record_agent_error(
                    agent_id,
                    AgentErrorKind::StartupFailure,
                    format!("process spawn failed: {err}"),
                    json!({}),
                    ErrorSeverity::High,
                );
                self.set_status(agent_id, AgentStatus::Error);
                return Err(AgentManagerError::StartupFailed {
                    id: agent_id,
                    reason: err.to_string(),
                });
            }
        };

        // Exit watcher: lives for the whole process lifetime and routes the
        // terminal status back through the manager.
        {
            let manager = Arc::clone(self);
            let mut exit_rx = process.exit_receiver();
            tokio::spawn(async move {
                loop {
                    let exit = *exit_rx.borrow();
                    if let Some(exit) = exit {
                        manager.handle_process_exit(agent_id, exit).await;
                        return;
                    }
                    if exit_rx.changed().await.is_err() {
                        return;
                    }
                }
            });
        }
        self.processes.insert(agent_id, process);

        let ready = tokio::time::timeout(self.config.default_timeout, async {
            loop {
                match ready_rx.recv().await {
                    Ok(SwarmEvent::AgentReady { agent_id: id }) if id == agent_id => return Ok(()),
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        return Err(anyhow::anyhow!("event bus closed"))
                    }
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for agent:ready"))
        .and_then(|inner| inner);

        match ready {
            Ok(_) => {
                self.set_status(agent_id, AgentStatus::Idle);
                self.restart_attempts.remove(&agent_id);
                self.pending_restarts.remove(&agent_id);
                {
                    let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
                    counters.total_started += 1;
                }
                if let Some(record) = self.agent(agent_id) {
                    let _ = self.persist_record(&record).await;
                }
                info!(agent_id = %agent_id, "agent started");
                Ok(())
            }
            Err(err) => {
                if let Some((_, process)) = self.processes.remove(&agent_id) {
                    process.kill();
                }
                self.record_agent_error(
                    agent_id,
                    AgentErrorKind::StartupFailure,
                    format!("agent did not report ready: {err}"),
                    json!({ "timeout_ms": self.config.default_timeout.as_millis() as u64 }),
                    ErrorSeverity::High,
                );
                self.set_status(agent_id, AgentStatus::Error);
                Err(AgentManagerError::StartupFailed {
                    id: agent_id,
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Stop an agent gracefully, force-killing after the configured
    /// timeout. Idempotent once the agent is `offline` or `terminated`.
    #[instrument(skip(self))]
    pub async fn stop_agent(&self, agent_id: AgentId, reason: &str) -> AgentResult<()> {
        self.stop_agent_to(agent_id, reason, AgentStatus::Terminated)
            .await
    }

    pub(crate) async fn stop_agent_to(
        &self,
        agent_id: AgentId,
        reason: &str,
        target: AgentStatus,
    ) -> AgentResult<()> {
        let record = self
            .agent(agent_id)
            .ok_or(AgentManagerError::AgentNotFound(agent_id))?;
        if matches!(record.status, AgentStatus::Offline | AgentStatus::Terminated) {
            debug!(agent_id = %agent_id, "stop requested on inactive agent, nothing to do");
            return Ok(());
        }

        info!(agent_id = %agent_id, reason, "stopping agent");
        self.set_status(agent_id, AgentStatus::Terminating);

        if let Some((_, process)) = self.processes.remove(&agent_id) {
            process.terminate();
            if process.wait_exit(self.config.default_timeout).await.is_none() {
                warn!(agent_id = %agent_id, "graceful stop timed out, killing process");
                process.kill();
                let _ = process.wait_exit(Duration::from_secs(1)).await;
            }
        }

        self.set_status(agent_id, target);
        {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            counters.total_stopped += 1;
        }
        if let Some(record) = self.agent(agent_id) {
            let _ = self.persist_record(&record).await;
        }
        Ok(())
    }

    /// Restart an agent: stop it into `offline`, then start it again.
    #[instrument(skip(self))]
    pub async fn restart_agent(self: &Arc<Self>, agent_id: AgentId, reason: &str) -> AgentResult<()> {
        info!(agent_id = %agent_id, reason, "restarting agent");
        self.stop_agent_to(agent_id, reason, AgentStatus::Offline)
            .await?;
        {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            counters.total_restarts += 1;
        }
        self.start_agent(agent_id).await
    }

    /// Remove an agent entirely: stop it if active, drop every trace from
    /// the manager and pools, and delete its persisted entries.
    #[instrument(skip(self))]
    pub async fn remove_agent(&self, agent_id: AgentId) -> AgentResult<()> {
        let record = self
            .agent(agent_id)
            .ok_or(AgentManagerError::AgentNotFound(agent_id))?;
        if record.status.is_active() {
            self.stop_agent(agent_id, "agent removal").await?;
        }

        self.agents.remove(&agent_id);
        self.health.remove(&agent_id);
        self.perf_history.remove(&agent_id);
        self.restart_attempts.remove(&agent_id);
        self.pending_restarts.remove(&agent_id);
        self.remove_agent_from_pools(agent_id);

        for key in [
            format!("agent:{agent_id}"),
            format!("agent:{agent_id}:metrics"),
            format!("agent:{agent_id}:state"),
        ] {
            if let Err(err) = self.store.delete(&key).await {
                warn!(agent_id = %agent_id, key, error = %err, "failed to delete persisted entry");
            }
        }

        info!(agent_id = %agent_id, "agent removed");
        Ok(())
    }

    /// Stop monitors and every active agent.
    pub async fn shutdown(&self) {
        info!(agents = self.agents.len(), "shutting down agent manager");
        {
            let mut tasks = self.monitor_tasks.lock().unwrap_or_else(|e| e.into_inner());
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        let ids: Vec<AgentId> = self.agents.iter().map(|entry| *entry.key()).collect();
        for agent_id in ids {
            if let Err(err) = self.stop_agent(agent_id, "manager shutdown").await {
                warn!(agent_id = %agent_id, error = %err, "failed to stop agent during shutdown");
            }
        }
    }

    //─────────────────────────────
    //  Process exit handling
    //─────────────────────────────

    pub(crate) async fn handle_process_exit(self: &Arc<Self>, agent_id: AgentId, exit: ProcessExit) {
        self.processes.remove(&agent_id);
        let status = match self.agent(agent_id) {
            Some(record) => record.status,
            None => return,
        };
        // A stop in progress owns the transition, and an agent already in
        // error had its process reaped by the failure path; crashes are
        // everything else.
        if matches!(
            status,
            AgentStatus::Terminating
                | AgentStatus::Terminated
                | AgentStatus::Offline
                | AgentStatus::Error
        ) {
            return;
        }

        warn!(agent_id = %agent_id, code = ?exit.code, "agent process exited unexpectedly");
        self.record_agent_error(
            agent_id,
            AgentErrorKind::ProcessExit,
            "agent process exited unexpectedly".to_string(),
            json!({ "exit_code": exit.code }),
            ErrorSeverity::High,
        );
        self.set_status(agent_id, AgentStatus::Offline);
        self.bus.emit(SwarmEvent::AgentProcessExit {
            agent_id,
            code: exit.code,
        });

        if self.config.auto_restart {
            self.schedule_auto_restart(agent_id, "process exit");
        }
    }

    /// Schedule a restart with exponential backoff, bounded by
    /// [`MAX_RESTART_ATTEMPTS`]. At most one restart is pending per agent;
    /// repeat triggers for the same outage are absorbed here rather than
    /// consuming further attempts.
    pub(crate) fn schedule_auto_restart(self: &Arc<Self>, agent_id: AgentId, cause: &str) {
        if self.pending_restarts.insert(agent_id, ()).is_some() {
            debug!(agent_id = %agent_id, cause, "restart already pending, not scheduling another");
            return;
        }
        let attempt = {
            let mut entry = self.restart_attempts.entry(agent_id).or_insert(0);
            *entry += 1;
            *entry
        };
        if attempt > MAX_RESTART_ATTEMPTS {
            // The marker stays set so the agent is left down until an
            // operator restart succeeds and clears it.
            error!(agent_id = %agent_id, attempt, "restart attempts exhausted, leaving agent down");
            return;
        }
        let delay = Duration::from_secs(1) * 2u32.pow(attempt - 1);
        info!(agent_id = %agent_id, attempt, delay_s = delay.as_secs(), cause, "scheduling agent restart");
        let manager = Arc::clone(self);
        let cause = cause.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let result = manager.restart_agent(agent_id, &cause).await;
            manager.pending_restarts.remove(&agent_id);
            if let Err(err) = result {
                warn!(agent_id = %agent_id, error = %err, "auto-restart failed");
            }
        });
    }

    //─────────────────────────────
    //  Record mutation
    //─────────────────────────────

    /// Transition an agent's status, keeping workload/pool bookkeeping and
    /// emitting the status-changed event. Illegal transitions are dropped
    /// with a warning.
    pub(crate) fn set_status(&self, agent_id: AgentId, to: AgentStatus) {
        let from = {
            let mut record = match self.agents.get_mut(&agent_id) {
                Some(record) => record,
                None => return,
            };
            let from = record.status;
            if from == to {
                return;
            }
            if !from.can_transition_to(to) {
                warn!(agent_id = %agent_id, from = %from, to = %to, "illegal status transition dropped");
                return;
            }
            record.status = to;
            from
        };
        self.sync_pool_membership(agent_id, to);
        self.bus
            .emit(SwarmEvent::AgentStatusChanged { agent_id, from, to });
    }

    /// Append a fault to the agent's history and decrement its health by
    /// the severity weight.
    pub(crate) fn record_agent_error(
        &self,
        agent_id: AgentId,
        kind: AgentErrorKind,
        message: String,
        context: serde_json::Value,
        severity: ErrorSeverity,
    ) {
        if let Some(mut record) = self.agents.get_mut(&agent_id) {
            record.record_error(AgentErrorRecord {
                timestamp: Utc::now(),
                kind,
                message,
                context,
                severity,
            });
        }
    }

    pub(crate) fn record_heartbeat(&self, agent_id: AgentId, timestamp: chrono::DateTime<Utc>) {
        if let Some(mut record) = self.agents.get_mut(&agent_id) {
            record.last_heartbeat = timestamp;
            record.metrics.last_activity = Utc::now();
        }
    }

    pub(crate) fn record_resource_usage(&self, agent_id: AgentId, usage: ResourceUsage) {
        if let Some(mut record) = self.agents.get_mut(&agent_id) {
            record.metrics.resource_usage = usage;
        }
    }

    //─────────────────────────────
    //  Task bookkeeping (driven by the dispatcher)
    //─────────────────────────────

    /// Record a task assignment on an agent. Fails when the agent has no
    /// spare concurrency.
    pub fn assign_task(&self, agent_id: AgentId, task_id: TaskId) -> AgentResult<()> {
        let became_busy = {
            let mut record = self
                .agents
                .get_mut(&agent_id)
                .ok_or(AgentManagerError::AgentNotFound(agent_id))?;
            if !record.has_spare_capacity() {
                return Err(AgentManagerError::InvalidTransition {
                    id: agent_id,
                    operation: "accept a task",
                    status: record.status,
                });
            }
            record.current_tasks.push(task_id);
            record.refresh_workload();
            record.status == AgentStatus::Idle
        };
        if became_busy {
            self.set_status(agent_id, AgentStatus::Busy);
        } else {
            self.sync_pool_membership(agent_id, AgentStatus::Busy);
        }
        Ok(())
    }

    /// Record a task leaving an agent, successfully or not.
    pub fn finish_task(
        &self,
        agent_id: AgentId,
        task_id: TaskId,
        execution_time: Duration,
        failed: bool,
    ) {
        let became_idle = {
            let mut record = match self.agents.get_mut(&agent_id) {
                Some(record) => record,
                None => return,
            };
            record.current_tasks.retain(|t| *t != task_id);
            record.task_history.push(task_id);
            if failed {
                record.metrics.record_failure();
            } else {
                record.metrics.record_completion(execution_time);
            }
            record.refresh_workload();
            record.status == AgentStatus::Busy && record.current_tasks.is_empty()
        };
        if !failed {
            if let Some(mut history) = self.perf_history.get_mut(&agent_id) {
                history.push(execution_time);
            }
        }
        if became_idle {
            self.set_status(agent_id, AgentStatus::Idle);
        }
    }

    //─────────────────────────────
    //  Queries
    //─────────────────────────────

    /// Snapshot of one agent record.
    pub fn agent(&self, agent_id: AgentId) -> Option<AgentRecord> {
        self.agents.get(&agent_id).map(|r| r.clone())
    }

    /// Snapshots of every agent record.
    pub fn list_agents(&self) -> Vec<AgentRecord> {
        self.agents.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Agents able to accept one more task right now.
    pub fn candidates(&self) -> Vec<AgentRecord> {
        self.agents
            .iter()
            .filter(|entry| entry.value().has_spare_capacity())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Count of agents holding an active slot.
    pub fn active_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|entry| entry.value().status.is_active())
            .count()
    }

    /// Snapshot of a registered template.
    pub fn template(&self, agent_type: &str) -> Option<apiary_types::AgentTemplate> {
        let registry = self.templates.lock().unwrap_or_else(|e| e.into_inner());
        registry.get(agent_type).cloned()
    }

    /// Register or replace a template at runtime.
    pub fn register_template(&self, template: apiary_types::AgentTemplate) {
        let mut registry = self.templates.lock().unwrap_or_else(|e| e.into_inner());
        registry.insert(template);
    }

    /// Latest health record for an agent, if a check has run.
    pub fn health_record(&self, agent_id: AgentId) -> Option<HealthRecord> {
        self.health.get(&agent_id).map(|h| h.clone())
    }

    /// Aggregate population counters.
    pub fn swarm_stats(&self) -> SwarmStats {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        SwarmStats {
            active_agents: self.active_count(),
            total_created: counters.total_created,
            total_started: counters.total_started,
            total_stopped: counters.total_stopped,
            total_restarts: counters.total_restarts,
            uptime: self.started_at.elapsed(),
        }
    }

    //─────────────────────────────
    //  Persistence
    //─────────────────────────────

    pub(crate) async fn persist_record(&self, record: &AgentRecord) -> AgentResult<()> {
        let value = serde_json::to_value(record)
            .context("serializing agent record")
            .map_err(AgentManagerError::Other)?;
        self.store
            .put(&format!("agent:{}", record.id), value.clone())
            .await
            .with_context(|| format!("persisting agent {}", record.id))
            .map_err(AgentManagerError::Other)?;
        // Periodic state snapshot lives under its own key so restores can
        // pick the latest of either.
        self.store
            .put(&format!("agent:{}:state", record.id), value)
            .await
            .with_context(|| format!("persisting agent state {}", record.id))
            .map_err(AgentManagerError::Other)?;
        let metrics = serde_json::to_value(&record.metrics)
            .context("serializing agent metrics")
            .map_err(AgentManagerError::Other)?;
        self.store
            .put(&format!("agent:{}:metrics", record.id), metrics)
            .await
            .with_context(|| format!("persisting agent metrics {}", record.id))
            .map_err(AgentManagerError::Other)?;
        Ok(())
    }
}
