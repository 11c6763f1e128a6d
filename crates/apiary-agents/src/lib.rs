#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **apiary-agents** – Agent lifecycle management for the Apiary control
//! plane.
//!
//! The [`AgentManager`] is the sole owner of agent records and their child
//! process handles. It creates agents from built-in templates, supervises
//! their OS processes, groups them into autoscaling pools, and runs the
//! periodic health scoring and heartbeat watchdog that feed restart
//! decisions.
//!
//! Everything downstream observes agents through events on the bus or
//! through cloned snapshots; nothing else holds a mutable reference to an
//! agent record.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use apiary_types::{AgentId, AgentStatus, PoolId};

pub mod health;
pub mod manager;
pub mod pool;
pub mod process;
pub mod templates;

pub use manager::AgentManager;
pub use process::{ProcessExit, SupervisedProcess};
pub use templates::TemplateRegistry;

/// Restart attempts allowed per agent before giving up on auto-restart.
pub const MAX_RESTART_ATTEMPTS: u32 = 3;

/// Composite health below which an auto-restart is scheduled.
pub const CRITICAL_HEALTH_THRESHOLD: f64 = 0.3;

/// Aggregate counters over the whole agent population.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmStats {
    /// Agents currently counting against the active cap.
    pub active_agents: usize,
    /// Agents created since startup.
    pub total_created: u64,
    /// Successful starts since startup.
    pub total_started: u64,
    /// Stops since startup.
    pub total_stopped: u64,
    /// Restarts since startup, auto and manual.
    pub total_restarts: u64,
    /// Manager uptime.
    pub uptime: Duration,
}

/// Errors surfaced by agent lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum AgentManagerError {
    /// The active-agent cap is reached.
    #[error("active agent limit reached ({limit})")]
    LimitExceeded {
        /// The configured cap.
        limit: usize,
    },
    /// No template is registered under the requested name.
    #[error("unknown agent template '{0}'")]
    TemplateNotFound(String),
    /// The agent id is unknown.
    #[error("agent {0} not found")]
    AgentNotFound(AgentId),
    /// The pool id is unknown.
    #[error("pool {0} not found")]
    PoolNotFound(PoolId),
    /// The operation is illegal in the agent's current state.
    #[error("agent {id} cannot {operation} from status '{status}'")]
    InvalidTransition {
        /// The agent.
        id: AgentId,
        /// The attempted operation.
        operation: &'static str,
        /// The state it was attempted from.
        status: AgentStatus,
    },
    /// A pool scaling target fell outside the configured bounds.
    #[error("target size {target} outside pool bounds [{min}, {max}]")]
    InvalidPoolSize {
        /// Requested size.
        target: usize,
        /// Pool minimum.
        min: usize,
        /// Pool maximum.
        max: usize,
    },
    /// The agent process failed to start or report ready in time.
    #[error("agent {id} failed to start: {reason}")]
    StartupFailed {
        /// The agent.
        id: AgentId,
        /// What went wrong.
        reason: String,
    },
    /// Anything else, with component/operation context attached.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result alias for manager operations.
pub type AgentResult<T> = std::result::Result<T, AgentManagerError>;
