//! Agent templates and creation-time overrides.
//!
//! A template is the immutable blueprint an agent is created from. Overrides
//! are field-by-field deltas; merging never mutates the template itself.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::capabilities::{AgentCapabilities, CapabilitiesOverride};

/// Immutable blueprint for creating agents of a given type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTemplate {
    /// Type key the template is registered under (`coder`, `tester`, ...).
    pub agent_type: String,
    /// Human-readable base name; instances append a counter.
    pub name: String,
    /// Default capabilities copied onto every created agent.
    pub capabilities: AgentCapabilities,
    /// Default runtime behaviour knobs.
    pub config: AgentRuntimeConfig,
    /// Default process environment.
    pub environment: AgentEnvironment,
    /// Script handed to the runtime executable at spawn.
    pub startup_script: String,
}

/// Behaviour knobs inherited from defaults and tunable per agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRuntimeConfig {
    /// How independently the agent acts, in `[0, 1]`.
    pub autonomy_level: f64,
    /// Whether the agent records outcomes for self-tuning.
    pub learning_enabled: bool,
    /// Whether the agent adapts strategy from feedback.
    pub adaptation_enabled: bool,
    /// Interval between heartbeats the agent is expected to send.
    pub heartbeat_interval: std::time::Duration,
    /// Free-form extra settings forwarded to the process.
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for AgentRuntimeConfig {
    fn default() -> Self {
        Self {
            autonomy_level: 0.7,
            learning_enabled: true,
            adaptation_enabled: true,
            heartbeat_interval: std::time::Duration::from_secs(10),
            extra: HashMap::new(),
        }
    }
}

/// Process environment an agent is spawned with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEnvironment {
    /// Executable that hosts the agent (`node`, `deno`, a shell, ...).
    pub runtime: String,
    /// Working directory of the spawned process.
    pub working_directory: PathBuf,
    /// Scratch directory for temporary files.
    pub temp_directory: PathBuf,
    /// Directory the process writes its logs to.
    pub log_directory: PathBuf,
    /// Additional environment variables.
    pub variables: HashMap<String, String>,
}

impl Default for AgentEnvironment {
    fn default() -> Self {
        Self {
            runtime: "node".to_string(),
            working_directory: PathBuf::from("./work"),
            temp_directory: PathBuf::from("/tmp"),
            log_directory: PathBuf::from("./logs"),
            variables: HashMap::new(),
        }
    }
}

/// Creation-time delta applied on top of a template.
///
/// Every field is optional; unspecified fields keep the template default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateOverride {
    /// Replacement display name.
    pub name: Option<String>,
    /// Capability-level delta.
    pub capabilities: Option<CapabilitiesOverride>,
    /// Replacement runtime config.
    pub config: Option<AgentRuntimeConfig>,
    /// Replacement process environment.
    pub environment: Option<AgentEnvironment>,
    /// Replacement startup script.
    pub startup_script: Option<String>,
}

impl AgentTemplate {
    /// Merge `overrides` onto the template, yielding the effective blueprint
    /// for one agent instance.
    pub fn merged(&self, overrides: &TemplateOverride) -> AgentTemplate {
        AgentTemplate {
            agent_type: self.agent_type.clone(),
            name: overrides.name.clone().unwrap_or_else(|| self.name.clone()),
            capabilities: match &overrides.capabilities {
                Some(delta) => delta.apply(&self.capabilities),
                None => self.capabilities.clone(),
            },
            config: overrides
                .config
                .clone()
                .unwrap_or_else(|| self.config.clone()),
            environment: overrides
                .environment
                .clone()
                .unwrap_or_else(|| self.environment.clone()),
            startup_script: overrides
                .startup_script
                .clone()
                .unwrap_or_else(|| self.startup_script.clone()),
        }
    }
}
