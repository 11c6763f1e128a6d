//! Composite health scoring and the heartbeat watchdog.
//!
//! Two timers run here: the health scorer on `health_check_interval`, and
//! the heartbeat watchdog on `heartbeat_interval`. Both operate on record
//! snapshots and write results back through the manager so the locking
//! discipline stays in one place.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use apiary_bus::SwarmEvent;
use apiary_types::{
    AgentErrorKind, AgentId, AgentRecord, AgentStatus, BoundedHistory, ErrorSeverity,
    HealthComponents, HealthIssue, HealthRecord, ResourceLimits,
};

use crate::manager::AgentManager;
use crate::CRITICAL_HEALTH_THRESHOLD;

/// Samples considered when scoring recent execution performance.
const RECENT_SAMPLE_WINDOW: usize = 10;

/// Responsiveness from heartbeat age relative to the expected cadence:
/// fresh within two intervals, stale within three, dead after.
pub fn responsiveness_score(heartbeat_age: Duration, interval: Duration) -> f64 {
    if heartbeat_age < interval * 2 {
        1.0
    } else if heartbeat_age < interval * 3 {
        0.5
    } else {
        0.0
    }
}

/// Performance from the last [`RECENT_SAMPLE_WINDOW`] execution samples:
/// the long-run average is the expectation, and recent slowdowns push the
/// score below one. No history scores a full one.
pub fn performance_score(record: &AgentRecord, samples: &BoundedHistory<Duration>) -> f64 {
    if samples.is_empty() {
        return 1.0;
    }
    let recent: Vec<Duration> = samples.last_n(RECENT_SAMPLE_WINDOW).copied().collect();
    let recent_avg = recent.iter().sum::<Duration>() / recent.len() as u32;
    if recent_avg.is_zero() {
        return 1.0;
    }
    let expected = record.metrics.average_execution_time;
    if expected.is_zero() {
        return 1.0;
    }
    (expected.as_secs_f64() / recent_avg.as_secs_f64()).clamp(0.0, 1.0)
}

/// Reliability from the completed/failed counters; no history scores a
/// full one.
pub fn reliability_score(record: &AgentRecord) -> f64 {
    let total = record.metrics.tasks_completed + record.metrics.tasks_failed;
    if total == 0 {
        return 1.0;
    }
    record.metrics.tasks_completed as f64 / total as f64
}

/// Resource headroom: mean of `1 - usage/limit` over memory, cpu, and
/// disk, clamped into `[0, 1]`.
pub fn resource_score(record: &AgentRecord, limits: &ResourceLimits) -> f64 {
    let usage = &record.metrics.resource_usage;
    let memory = 1.0 - usage.memory_bytes as f64 / limits.memory.max(1) as f64;
    let cpu = 1.0 - usage.cpu_frac / limits.cpu.max(f64::EPSILON);
    let disk = 1.0 - usage.disk_bytes as f64 / limits.disk.max(1) as f64;
    ((memory + cpu + disk) / 3.0).clamp(0.0, 1.0)
}

/// Issues derived from fixed component bands: below 0.3 is critical,
/// below 0.6 a warning.
pub fn derive_issues(components: &HealthComponents) -> Vec<HealthIssue> {
    let mut issues = Vec::new();
    let mut check = |name: &str, score: f64| {
        if score < 0.3 {
            issues.push(HealthIssue {
                component: name.to_string(),
                severity: "critical".to_string(),
                message: format!("{name} score critically low ({score:.2})"),
            });
        } else if score < 0.6 {
            issues.push(HealthIssue {
                component: name.to_string(),
                severity: "warning".to_string(),
                message: format!("{name} score degraded ({score:.2})"),
            });
        }
    };
    check("responsiveness", components.responsiveness);
    check("performance", components.performance);
    check("reliability", components.reliability);
    check("resource_usage", components.resource_usage);
    issues
}

impl AgentManager {
    /// Score every live agent and write the results back. Agents whose
    /// composite drops below the critical threshold get an auto-restart
    /// when enabled.
    pub async fn run_health_check(self: &Arc<Self>) {
        let snapshots: Vec<AgentRecord> = self
            .agents
            .iter()
            .filter(|entry| {
                !matches!(
                    entry.value().status,
                    AgentStatus::Terminated | AgentStatus::Terminating | AgentStatus::Offline
                )
            })
            .map(|entry| entry.value().clone())
            .collect();

        for record in snapshots {
            let agent_id = record.id;
            let heartbeat_age = (Utc::now() - record.last_heartbeat)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let samples = self
                .perf_history
                .get(&agent_id)
                .map(|h| h.clone())
                .unwrap_or_else(|| BoundedHistory::new(RECENT_SAMPLE_WINDOW));

            let components = HealthComponents {
                responsiveness: responsiveness_score(heartbeat_age, self.config.heartbeat_interval),
                performance: performance_score(&record, &samples),
                reliability: reliability_score(&record),
                resource_usage: resource_score(&record, &self.config.resource_limits),
            };
            let previous = self.health.get(&agent_id).map(|h| h.overall);
            let mut health = HealthRecord::from_components(components, previous);
            health.issues = derive_issues(&health.components);
            let overall = health.overall;

            debug!(agent_id = %agent_id, overall, "health check scored agent");
            if let Some(mut agent) = self.agents.get_mut(&agent_id) {
                agent.health = overall;
            }
            self.health.insert(agent_id, health);

            if overall < CRITICAL_HEALTH_THRESHOLD {
                warn!(agent_id = %agent_id, overall, "agent health critical");
                self.record_agent_error(
                    agent_id,
                    AgentErrorKind::HealthCritical,
                    format!("composite health {overall:.2} below critical threshold"),
                    json!({ "overall": overall }),
                    ErrorSeverity::Critical,
                );
                if self.config.auto_restart {
                    self.schedule_auto_restart(agent_id, "critical health");
                }
            }
        }
    }

    /// Move agents with a stale heartbeat into `error`, record the fault,
    /// and trigger auto-restart when enabled. Offline and terminated
    /// agents are exempt.
    pub async fn run_heartbeat_check(self: &Arc<Self>) {
        let timeout = self.config.heartbeat_timeout();
        let stale: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|entry| {
                let record = entry.value();
                // Only offline and terminated agents are exempt; they have
                // no heartbeat to miss.
                if matches!(record.status, AgentStatus::Offline | AgentStatus::Terminated) {
                    return false;
                }
                let age = (Utc::now() - record.last_heartbeat)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                age > timeout
            })
            .map(|entry| *entry.key())
            .collect();

        for agent_id in stale {
            warn!(agent_id = %agent_id, "agent heartbeat timed out");
            self.record_agent_error(
                agent_id,
                AgentErrorKind::HeartbeatTimeout,
                "no heartbeat within three intervals".to_string(),
                json!({ "timeout_ms": timeout.as_millis() as u64 }),
                ErrorSeverity::High,
            );
            self.set_status(agent_id, AgentStatus::Error);
            self.bus.emit(SwarmEvent::AgentError {
                agent_id,
                error: "heartbeat_timeout".to_string(),
            });
            if self.config.auto_restart {
                self.schedule_auto_restart(agent_id, "heartbeat timeout");
            }
        }
    }

    /// Start the health scorer and heartbeat watchdog timers.
    pub fn start_monitors(self: &Arc<Self>) {
        let mut tasks = self.monitor_tasks.lock().unwrap_or_else(|e| e.into_inner());
        if !tasks.is_empty() {
            return;
        }

        let manager = Arc::clone(self);
        let health_interval = self.config.health_check_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so fresh agents are not
            // scored before they settle.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.run_health_check().await;
            }
        }));

        let manager = Arc::clone(self);
        let heartbeat_interval = self.config.heartbeat_interval;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.run_heartbeat_check().await;
            }
        }));

        info!("agent health monitors started");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_types::ResourceUsage;

    #[test]
    fn responsiveness_bands() {
        let interval = Duration::from_secs(10);
        assert_eq!(responsiveness_score(Duration::from_secs(5), interval), 1.0);
        assert_eq!(responsiveness_score(Duration::from_secs(25), interval), 0.5);
        assert_eq!(responsiveness_score(Duration::from_secs(31), interval), 0.0);
    }

    fn record_with_counters(completed: u64, failed: u64) -> AgentRecord {
        use apiary_types::capabilities::AgentCapabilities;
        use apiary_types::template::{AgentEnvironment, AgentRuntimeConfig};
        use apiary_types::{AgentMetrics, SwarmId};
        let mut metrics = AgentMetrics::default();
        metrics.tasks_completed = completed;
        metrics.tasks_failed = failed;
        AgentRecord {
            id: AgentId::new(),
            swarm_id: SwarmId::new(),
            agent_type: "coder".to_string(),
            instance: 1,
            name: "Coder 1".to_string(),
            status: AgentStatus::Idle,
            capabilities: AgentCapabilities::default(),
            config: AgentRuntimeConfig::default(),
            environment: AgentEnvironment::default(),
            startup_script: "coder.js".to_string(),
            metrics,
            health: 1.0,
            workload: 0.0,
            last_heartbeat: Utc::now(),
            current_tasks: Vec::new(),
            task_history: BoundedHistory::new(50),
            error_history: BoundedHistory::new(50),
            collaborators: Vec::new(),
            children: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn reliability_from_counters() {
        assert_eq!(reliability_score(&record_with_counters(0, 0)), 1.0);
        assert_eq!(reliability_score(&record_with_counters(3, 1)), 0.75);
        assert_eq!(reliability_score(&record_with_counters(0, 4)), 0.0);
    }

    #[test]
    fn performance_full_score_without_history() {
        let record = record_with_counters(0, 0);
        let samples = BoundedHistory::new(10);
        assert_eq!(performance_score(&record, &samples), 1.0);
    }

    #[test]
    fn performance_penalizes_recent_slowdown() {
        let mut record = record_with_counters(10, 0);
        record.metrics.average_execution_time = Duration::from_secs(2);
        let mut samples = BoundedHistory::new(100);
        for _ in 0..10 {
            samples.push(Duration::from_secs(4));
        }
        let score = performance_score(&record, &samples);
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn resource_score_uses_limit_denominators() {
        let mut record = record_with_counters(0, 0);
        let limits = ResourceLimits {
            memory: 100,
            cpu: 1.0,
            disk: 100,
        };
        record.metrics.resource_usage = ResourceUsage {
            cpu_frac: 0.5,
            memory_bytes: 50,
            disk_bytes: 50,
        };
        assert!((resource_score(&record, &limits) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn issues_follow_severity_bands() {
        let components = HealthComponents {
            responsiveness: 0.1,
            performance: 0.5,
            reliability: 0.9,
            resource_usage: 0.9,
        };
        let issues = derive_issues(&components);
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].severity, "critical");
        assert_eq!(issues[1].severity, "warning");
    }
}
