//! Task records and lifecycle state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, TaskId, MAX_TASK_DESCRIPTION_LEN};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in the queue.
    Queued,
    /// Handed to an agent but not yet started.
    Assigned,
    /// Executing on its assigned agent.
    Running,
    /// Finished successfully; terminal.
    Completed,
    /// Exhausted retries or failed terminally.
    Failed,
    /// Cancelled before completion; terminal.
    Cancelled,
}

impl TaskStatus {
    /// Stable lowercase spelling used in events and persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether no further transitions are allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal successor states. Retried tasks go back to `Queued` from
    /// `Running`/`Assigned` before the terminal failure is recorded.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Queued => &[Self::Assigned, Self::Cancelled, Self::Failed],
            Self::Assigned => &[Self::Running, Self::Queued, Self::Cancelled, Self::Failed],
            Self::Running => &[Self::Completed, Self::Failed, Self::Queued, Self::Cancelled],
            Self::Completed | Self::Failed | Self::Cancelled => &[],
        }
    }

    /// Whether a transition to `next` is legal.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed unit of work submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task id.
    pub id: TaskId,
    /// Task type key (`code-generation`, `analysis`, ...).
    pub task_type: String,
    /// Human-readable description; also used for requirement inference.
    pub description: String,
    /// Scheduling priority in `[0, 100]`, higher first.
    pub priority: u8,
    /// Tasks that must complete before this one is dispatched.
    pub dependencies: Vec<TaskId>,
    /// Capability labels an agent must satisfy.
    pub required_capabilities: Vec<String>,
    /// Capability labels that improve the match score.
    pub preferred_capabilities: Vec<String>,
    /// Languages the work involves.
    pub languages: Vec<String>,
    /// Frameworks the work involves.
    pub frameworks: Vec<String>,
    /// Free-form metadata (`critical`, `complexity`, ...).
    pub metadata: HashMap<String, serde_json::Value>,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Agent the task is assigned to, if any.
    pub assigned_agent: Option<AgentId>,
    /// Submission timestamp.
    pub created_at: DateTime<Utc>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Retries performed so far.
    pub retry_count: u32,
    /// Terminal error message, if failed.
    pub error: Option<String>,
    /// Result payload, if completed.
    pub output: Option<serde_json::Value>,
    /// Metrics the executing agent reported at completion, if any.
    pub execution_metrics: Option<serde_json::Value>,
}

impl Task {
    /// Build a new queued task with the given type, description, and
    /// priority; everything else starts empty.
    pub fn new(task_type: impl Into<String>, description: impl Into<String>, priority: u8) -> Self {
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            description: description.into(),
            priority,
            dependencies: Vec::new(),
            required_capabilities: Vec::new(),
            preferred_capabilities: Vec::new(),
            languages: Vec::new(),
            frameworks: Vec::new(),
            metadata: HashMap::new(),
            status: TaskStatus::Queued,
            assigned_agent: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            error: None,
            output: None,
            execution_metrics: None,
        }
    }

    /// Validate the structural submission rules: non-empty type and
    /// description, bounded description length, priority within range.
    pub fn validate(&self) -> Result<(), String> {
        if self.task_type.trim().is_empty() {
            return Err("task type cannot be empty".to_string());
        }
        if self.description.trim().is_empty() {
            return Err("task description cannot be empty".to_string());
        }
        if self.description.len() > MAX_TASK_DESCRIPTION_LEN {
            return Err(format!(
                "task description too long: {} > {}",
                self.description.len(),
                MAX_TASK_DESCRIPTION_LEN
            ));
        }
        if self.priority > 100 {
            return Err(format!("priority {} outside [0, 100]", self.priority));
        }
        Ok(())
    }

    /// Whether the task is flagged critical for shutdown draining.
    pub fn is_critical(&self) -> bool {
        self.priority >= 90
            || self
                .metadata
                .get("critical")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_successors() {
        for s in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled] {
            assert!(s.is_terminal());
            assert!(s.valid_transitions().is_empty());
        }
    }

    #[test]
    fn running_may_requeue_for_retry() {
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Queued));
    }

    #[test]
    fn validation_rejects_out_of_range_priority() {
        let mut t = Task::new("analysis", "inspect logs", 50);
        assert!(t.validate().is_ok());
        t.priority = 101;
        assert!(t.validate().is_err());
    }

    #[test]
    fn validation_rejects_blank_fields() {
        let t = Task::new("", "x", 1);
        assert!(t.validate().is_err());
        let t = Task::new("x", "  ", 1);
        assert!(t.validate().is_err());
    }

    #[test]
    fn critical_flag_from_priority_or_metadata() {
        let mut t = Task::new("a", "b", 95);
        assert!(t.is_critical());
        t.priority = 10;
        assert!(!t.is_critical());
        t.metadata
            .insert("critical".to_string(), serde_json::Value::Bool(true));
        assert!(t.is_critical());
    }
}
