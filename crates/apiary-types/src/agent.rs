//! Runtime agent records and lifecycle state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capabilities::AgentCapabilities;
use crate::history::BoundedHistory;
use crate::template::{AgentEnvironment, AgentRuntimeConfig};
use crate::{AgentId, SwarmId, TaskId, ERROR_HISTORY_CAPACITY, TASK_HISTORY_CAPACITY};

/// Lifecycle state of a supervised agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Created but not yet started.
    Initializing,
    /// Running and accepting work.
    Idle,
    /// Running with at least one task in flight.
    Busy,
    /// Faulted; awaiting operator action or auto-restart.
    Error,
    /// Graceful shutdown in progress.
    Terminating,
    /// Shut down; terminal state.
    Terminated,
    /// Process gone without graceful shutdown; restartable.
    Offline,
}

impl AgentStatus {
    /// Stable lowercase spelling used in events and persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Offline => "offline",
        }
    }

    /// Whether no further transitions are allowed from this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Whether the agent counts against the active-agent cap.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::Idle | Self::Busy | Self::Error | Self::Terminating
        )
    }

    /// Whether `start` is legal from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Initializing | Self::Offline)
    }

    /// Legal successor states.
    pub fn valid_transitions(&self) -> &'static [AgentStatus] {
        match self {
            Self::Initializing => &[Self::Idle, Self::Error, Self::Terminating, Self::Offline],
            Self::Idle => &[Self::Busy, Self::Error, Self::Terminating, Self::Offline],
            Self::Busy => &[Self::Idle, Self::Error, Self::Terminating, Self::Offline],
            Self::Error => &[Self::Idle, Self::Terminating, Self::Offline, Self::Initializing],
            Self::Terminating => &[Self::Terminated, Self::Offline],
            Self::Terminated => &[],
            Self::Offline => &[Self::Initializing, Self::Idle, Self::Error, Self::Terminating],
        }
    }

    /// Whether a transition to `next` is legal.
    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a recorded agent fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Cosmetic or self-healed.
    Low,
    /// Degraded behaviour worth tracking.
    Medium,
    /// Failure requiring intervention.
    High,
    /// Failure endangering the agent's availability.
    Critical,
}

impl ErrorSeverity {
    /// Amount subtracted from the agent's health score on record.
    pub fn health_penalty(&self) -> f64 {
        match self {
            Self::Low => 0.01,
            Self::Medium => 0.05,
            Self::High => 0.1,
            Self::Critical => 0.2,
        }
    }
}

/// Classified agent fault kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    /// Heartbeats stopped arriving.
    HeartbeatTimeout,
    /// The child process exited unexpectedly.
    ProcessExit,
    /// The agent failed to report ready at startup.
    StartupFailure,
    /// A task the agent executed failed.
    TaskFailure,
    /// Composite health fell below the critical threshold.
    HealthCritical,
    /// Anything else.
    Other,
}

/// One entry in the agent's bounded error history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentErrorRecord {
    /// When the fault was recorded.
    pub timestamp: DateTime<Utc>,
    /// Fault classification.
    pub kind: AgentErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Free-form context (exit codes, task ids, ...).
    pub context: serde_json::Value,
    /// Severity used to decrement health.
    pub severity: ErrorSeverity,
}

/// Point-in-time resource consumption reported by an agent process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage as a fraction of one core.
    pub cpu_frac: f64,
    /// Resident memory in bytes.
    pub memory_bytes: u64,
    /// Disk footprint in bytes.
    pub disk_bytes: u64,
}

/// Counters and rolling figures maintained per agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    /// Tasks completed successfully.
    pub tasks_completed: u64,
    /// Tasks that failed.
    pub tasks_failed: u64,
    /// Sum of execution time across completed tasks.
    pub total_execution_time: Duration,
    /// Rolling average execution time.
    pub average_execution_time: Duration,
    /// Last reported resource usage.
    pub resource_usage: ResourceUsage,
    /// Last activity of any kind.
    pub last_activity: DateTime<Utc>,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self {
            tasks_completed: 0,
            tasks_failed: 0,
            total_execution_time: Duration::ZERO,
            average_execution_time: Duration::ZERO,
            resource_usage: ResourceUsage::default(),
            last_activity: Utc::now(),
        }
    }
}

impl AgentMetrics {
    /// Fold one completed-task execution time into the counters.
    pub fn record_completion(&mut self, execution_time: Duration) {
        self.tasks_completed += 1;
        self.total_execution_time += execution_time;
        self.average_execution_time = self.total_execution_time / self.tasks_completed as u32;
        self.last_activity = Utc::now();
    }

    /// Fold one failed task into the counters.
    pub fn record_failure(&mut self) {
        self.tasks_failed += 1;
        self.last_activity = Utc::now();
    }
}

/// The mutable runtime record of one agent, owned by the agent manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Unique agent id.
    pub id: AgentId,
    /// Swarm the agent belongs to.
    pub swarm_id: SwarmId,
    /// Template type the agent was created from.
    pub agent_type: String,
    /// Instance counter within the type.
    pub instance: u32,
    /// Display name (`<template name> <instance>`).
    pub name: String,
    /// Current lifecycle state.
    pub status: AgentStatus,
    /// Effective capabilities (template plus overrides).
    pub capabilities: AgentCapabilities,
    /// Effective runtime config.
    pub config: AgentRuntimeConfig,
    /// Effective process environment.
    pub environment: AgentEnvironment,
    /// Startup script handed to the runtime.
    pub startup_script: String,
    /// Rolling counters.
    pub metrics: AgentMetrics,
    /// Composite health in `[0, 1]`.
    pub health: f64,
    /// `current_tasks / max_concurrent_tasks`, in `[0, 1]`.
    pub workload: f64,
    /// Last heartbeat received.
    pub last_heartbeat: DateTime<Utc>,
    /// Tasks currently assigned or running on the agent.
    pub current_tasks: Vec<TaskId>,
    /// Recently finished tasks, bounded.
    pub task_history: BoundedHistory<TaskId>,
    /// Recently recorded faults, bounded.
    pub error_history: BoundedHistory<AgentErrorRecord>,
    /// Agents this one collaborates with.
    pub collaborators: Vec<AgentId>,
    /// Agents spawned by this one.
    pub children: Vec<AgentId>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl AgentRecord {
    /// Recompute `workload` from the current task list. Always in `[0, 1]`.
    pub fn refresh_workload(&mut self) {
        let max = self.capabilities.max_concurrent_tasks.max(1);
        self.workload = (self.current_tasks.len() as f64 / max as f64).clamp(0.0, 1.0);
    }

    /// Whether the agent can accept one more task right now.
    pub fn has_spare_capacity(&self) -> bool {
        matches!(self.status, AgentStatus::Idle | AgentStatus::Busy)
            && self.current_tasks.len() < self.capabilities.max_concurrent_tasks
    }

    /// Record a fault: append to the bounded history and decrement health
    /// by the severity weight, floored at zero.
    pub fn record_error(&mut self, record: AgentErrorRecord) {
        self.health = (self.health - record.severity.health_penalty()).max(0.0);
        self.error_history.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminated_has_no_successors() {
        assert!(AgentStatus::Terminated.valid_transitions().is_empty());
        assert!(!AgentStatus::Terminated.can_transition_to(AgentStatus::Idle));
    }

    #[test]
    fn only_initializing_and_offline_can_start() {
        assert!(AgentStatus::Initializing.can_start());
        assert!(AgentStatus::Offline.can_start());
        assert!(!AgentStatus::Idle.can_start());
        assert!(!AgentStatus::Terminated.can_start());
    }

    #[test]
    fn severity_penalties_match_policy() {
        assert_eq!(ErrorSeverity::Low.health_penalty(), 0.01);
        assert_eq!(ErrorSeverity::Medium.health_penalty(), 0.05);
        assert_eq!(ErrorSeverity::High.health_penalty(), 0.1);
        assert_eq!(ErrorSeverity::Critical.health_penalty(), 0.2);
    }

    #[test]
    fn completion_updates_rolling_average() {
        let mut m = AgentMetrics::default();
        m.record_completion(Duration::from_secs(2));
        m.record_completion(Duration::from_secs(4));
        assert_eq!(m.tasks_completed, 2);
        assert_eq!(m.average_execution_time, Duration::from_secs(3));
    }
}
