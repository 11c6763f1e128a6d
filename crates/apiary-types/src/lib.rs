#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **apiary-types** – Shared primitive data structures for the Apiary
//! control plane.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing
//! cycles. It carries the agent/task/session data model, the configuration
//! surface, and the traits for external collaborators (terminal backend,
//! memory store, coordination, MCP). It intentionally performs no I/O.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

//─────────────────────────────
//  Validation constants
//─────────────────────────────

/// Maximum allowed size for task descriptions to prevent memory exhaustion.
pub const MAX_TASK_DESCRIPTION_LEN: usize = 4096;

/// Maximum allowed size for agent names to prevent memory exhaustion.
pub const MAX_AGENT_NAME_LEN: usize = 256;

/// Capacity of per-agent error history ring buffers.
pub const ERROR_HISTORY_CAPACITY: usize = 50;

/// Capacity of per-agent task history ring buffers.
pub const TASK_HISTORY_CAPACITY: usize = 50;

/// Capacity of per-agent execution-time sample buffers.
pub const PERFORMANCE_HISTORY_CAPACITY: usize = 100;

/// Capacity of the alert history buffer.
pub const ALERT_HISTORY_CAPACITY: usize = 1000;

pub mod agent;
pub mod alert;
pub mod capabilities;
pub mod config;
pub mod health;
pub mod history;
pub mod metric;
pub mod pool;
pub mod ports;
pub mod session;
pub mod task;
pub mod template;

pub use agent::{
    AgentErrorKind, AgentErrorRecord, AgentMetrics, AgentRecord, AgentStatus, ErrorSeverity,
    ResourceUsage,
};
pub use alert::{Alert, AlertAction, AlertCondition, AlertLevel, AlertRule};
pub use capabilities::{AgentCapabilities, CapabilitiesOverride};
pub use config::{
    AgentDefaults, AlertThreshold, EnvironmentDefaults, OrchestratorConfig, ResourceLimits,
};
pub use health::{HealthComponents, HealthIssue, HealthRecord, HealthTrend};
pub use history::BoundedHistory;
pub use metric::{MetricAggregations, MetricPoint, MetricSeries};
pub use pool::{AgentPool, PoolConfig};
pub use session::{Session, SessionProfile, SessionStatus};
pub use task::{Task, TaskStatus};
pub use template::{AgentEnvironment, AgentRuntimeConfig, AgentTemplate, TemplateOverride};

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id! {
    /// Unique identifier of a supervised agent.
    AgentId
}

uuid_id! {
    /// Identifier of the swarm an agent belongs to.
    SwarmId
}

uuid_id! {
    /// Unique identifier of a task.
    TaskId
}

uuid_id! {
    /// Unique identifier of a session binding.
    SessionId
}

uuid_id! {
    /// Unique identifier of an agent pool.
    PoolId
}

uuid_id! {
    /// Identifier of a terminal allocated by the terminal backend.
    TerminalId
}

uuid_id! {
    /// Identifier of a memory bank allocated by the memory store.
    MemoryBankId
}
