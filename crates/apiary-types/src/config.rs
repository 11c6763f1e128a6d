//! Control-plane configuration surface.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Resource limits used as denominators for resource health scoring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory budget in bytes.
    pub memory: u64,
    /// CPU budget as a fraction of one core.
    pub cpu: f64,
    /// Disk budget in bytes.
    pub disk: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: 512 * 1024 * 1024,
            cpu: 1.0,
            disk: 1024 * 1024 * 1024,
        }
    }
}

/// Defaults inherited by every template's runtime config.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentDefaults {
    /// Default autonomy level in `[0, 1]`.
    pub autonomy_level: f64,
    /// Whether learning is enabled by default.
    pub learning_enabled: bool,
    /// Whether adaptation is enabled by default.
    pub adaptation_enabled: bool,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            autonomy_level: 0.7,
            learning_enabled: true,
            adaptation_enabled: true,
        }
    }
}

/// Defaults inherited by every template's process environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDefaults {
    /// Executable that hosts agents.
    pub runtime: String,
    /// Default working directory.
    pub working_directory: PathBuf,
    /// Default scratch directory.
    pub temp_directory: PathBuf,
    /// Default log directory.
    pub log_directory: PathBuf,
}

impl Default for EnvironmentDefaults {
    fn default() -> Self {
        Self {
            runtime: "node".to_string(),
            working_directory: PathBuf::from("./work"),
            temp_directory: PathBuf::from("/tmp"),
            log_directory: PathBuf::from("./logs"),
        }
    }
}

/// Warning and critical thresholds for one monitored metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertThreshold {
    /// Value at which a warning alert fires.
    pub warning: f64,
    /// Value at which a critical alert fires.
    pub critical: f64,
}

/// Top-level configuration recognized by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Hard cap on active agents.
    pub max_agents: usize,
    /// Bound on agent startup and shutdown waits.
    pub default_timeout: Duration,
    /// Expected heartbeat cadence; timeout is three times this.
    pub heartbeat_interval: Duration,
    /// Health scoring cadence.
    pub health_check_interval: Duration,
    /// Restart agents on heartbeat timeout and critical health.
    pub auto_restart: bool,
    /// Denominators for the resource health component.
    pub resource_limits: ResourceLimits,
    /// Defaults inherited by templates.
    pub agent_defaults: AgentDefaults,
    /// Process environment defaults inherited by templates.
    pub environment_defaults: EnvironmentDefaults,
    /// Capacity of the task queue.
    pub task_queue_size: usize,
    /// Retry attempts per task before terminal failure.
    pub task_max_retries: u32,
    /// How long terminated sessions are kept before maintenance purges them.
    pub session_retention: Duration,
    /// How long finished tasks are kept before maintenance purges them.
    pub task_history_retention: Duration,
    /// Cadence of the maintenance timer.
    pub maintenance_interval: Duration,
    /// Cadence of the metrics collection timer.
    pub metrics_interval: Duration,
    /// Bound on total shutdown time.
    pub shutdown_timeout: Duration,
    /// Retention window for metric points.
    pub metrics_retention: Duration,
    /// Per-metric alert thresholds.
    pub alert_thresholds: HashMap<String, AlertThreshold>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut alert_thresholds = HashMap::new();
        alert_thresholds.insert("cpu".to_string(), AlertThreshold { warning: 0.7, critical: 0.9 });
        alert_thresholds.insert("memory".to_string(), AlertThreshold { warning: 0.8, critical: 0.95 });
        alert_thresholds.insert("disk".to_string(), AlertThreshold { warning: 0.8, critical: 0.95 });
        alert_thresholds.insert("errorRate".to_string(), AlertThreshold { warning: 0.05, critical: 0.2 });
        alert_thresholds.insert("responseTime".to_string(), AlertThreshold { warning: 2000.0, critical: 10000.0 });
        alert_thresholds.insert("queueDepth".to_string(), AlertThreshold { warning: 50.0, critical: 90.0 });
        alert_thresholds.insert("agentHealth".to_string(), AlertThreshold { warning: 0.5, critical: 0.3 });
        alert_thresholds.insert("swarmUtilization".to_string(), AlertThreshold { warning: 0.85, critical: 0.95 });

        Self {
            max_agents: 16,
            default_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            auto_restart: true,
            resource_limits: ResourceLimits::default(),
            agent_defaults: AgentDefaults::default(),
            environment_defaults: EnvironmentDefaults::default(),
            task_queue_size: 100,
            task_max_retries: 3,
            session_retention: Duration::from_secs(3600),
            task_history_retention: Duration::from_secs(24 * 3600),
            maintenance_interval: Duration::from_secs(300),
            metrics_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            metrics_retention: Duration::from_secs(3600),
            alert_thresholds,
        }
    }
}

impl OrchestratorConfig {
    /// Heartbeat timeout: three missed intervals.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}
