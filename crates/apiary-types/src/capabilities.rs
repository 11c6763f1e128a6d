//! Agent capability declarations.
//!
//! Capabilities combine boolean skill flags, tagged string sets, numeric
//! caps, and quality scalars. They are copied from a template at agent
//! creation and consulted by the matcher at dispatch time.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What an agent can do, and how well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    /// Can produce new code.
    pub code_generation: bool,
    /// Can review existing code.
    pub code_review: bool,
    /// Can write and run tests.
    pub testing: bool,
    /// Can author documentation.
    pub documentation: bool,
    /// Can perform open-ended research.
    pub research: bool,
    /// Can perform data/code analysis.
    pub analysis: bool,
    /// Can search the web.
    pub web_search: bool,
    /// Can call external APIs.
    pub api_integration: bool,
    /// Can read and write the file system.
    pub file_system: bool,
    /// Can drive a terminal.
    pub terminal_access: bool,

    /// Programming languages the agent handles.
    pub languages: BTreeSet<String>,
    /// Frameworks the agent handles.
    pub frameworks: BTreeSet<String>,
    /// Problem domains the agent handles.
    pub domains: BTreeSet<String>,
    /// Named tools the agent may invoke.
    pub tools: BTreeSet<String>,

    /// Maximum tasks the agent executes concurrently.
    pub max_concurrent_tasks: usize,
    /// Maximum memory budget in bytes.
    pub max_memory_usage: u64,
    /// Maximum wall-clock time per task.
    pub max_execution_time: Duration,

    /// Historical reliability in `[0, 1]`.
    pub reliability: f64,
    /// Relative speed in `[0, 1]`.
    pub speed: f64,
    /// Relative output quality in `[0, 1]`.
    pub quality: f64,
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        Self {
            code_generation: false,
            code_review: false,
            testing: false,
            documentation: false,
            research: false,
            analysis: false,
            web_search: false,
            api_integration: false,
            file_system: true,
            terminal_access: true,
            languages: BTreeSet::new(),
            frameworks: BTreeSet::new(),
            domains: BTreeSet::new(),
            tools: BTreeSet::new(),
            max_concurrent_tasks: 3,
            max_memory_usage: 512 * 1024 * 1024,
            max_execution_time: Duration::from_secs(300),
            reliability: 0.8,
            speed: 0.5,
            quality: 0.8,
        }
    }
}

impl AgentCapabilities {
    /// Whether the named boolean flag is set.
    ///
    /// Labels use the wire spelling (`code-generation`, `web-search`, ...).
    /// Unknown labels report `false`.
    pub fn has_flag(&self, label: &str) -> bool {
        match label {
            "code-generation" | "codeGeneration" => self.code_generation,
            "code-review" | "codeReview" => self.code_review,
            "testing" => self.testing,
            "documentation" => self.documentation,
            "research" => self.research,
            "analysis" => self.analysis,
            "web-search" | "webSearch" => self.web_search,
            "api-integration" | "apiIntegration" => self.api_integration,
            "file-system" | "fileSystem" => self.file_system,
            "terminal-access" | "terminalAccess" => self.terminal_access,
            _ => false,
        }
    }

    /// Whether a label matches any capability surface: boolean flag,
    /// language, framework, domain, or tool.
    pub fn matches_label(&self, label: &str) -> bool {
        self.has_flag(label)
            || self.languages.contains(label)
            || self.frameworks.contains(label)
            || self.domains.contains(label)
            || self.tools.contains(label)
    }

    /// Count of boolean flags that are set.
    pub fn flag_count(&self) -> usize {
        [
            self.code_generation,
            self.code_review,
            self.testing,
            self.documentation,
            self.research,
            self.analysis,
            self.web_search,
            self.api_integration,
            self.file_system,
            self.terminal_access,
        ]
        .iter()
        .filter(|f| **f)
        .count()
    }

    /// Total breadth across flags and tag sets, used for complexity tiering.
    pub fn breadth(&self) -> usize {
        self.flag_count()
            + self.languages.len()
            + self.frameworks.len()
            + self.domains.len()
            + self.tools.len()
    }
}

/// Per-field delta applied on top of a template's capabilities.
///
/// `None` fields preserve the template value; `Some` fields replace it
/// wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilitiesOverride {
    /// Replacement for [`AgentCapabilities::code_generation`].
    pub code_generation: Option<bool>,
    /// Replacement for [`AgentCapabilities::code_review`].
    pub code_review: Option<bool>,
    /// Replacement for [`AgentCapabilities::testing`].
    pub testing: Option<bool>,
    /// Replacement for [`AgentCapabilities::documentation`].
    pub documentation: Option<bool>,
    /// Replacement for [`AgentCapabilities::research`].
    pub research: Option<bool>,
    /// Replacement for [`AgentCapabilities::analysis`].
    pub analysis: Option<bool>,
    /// Replacement for [`AgentCapabilities::web_search`].
    pub web_search: Option<bool>,
    /// Replacement for [`AgentCapabilities::api_integration`].
    pub api_integration: Option<bool>,
    /// Replacement for [`AgentCapabilities::file_system`].
    pub file_system: Option<bool>,
    /// Replacement for [`AgentCapabilities::terminal_access`].
    pub terminal_access: Option<bool>,
    /// Replacement language set.
    pub languages: Option<BTreeSet<String>>,
    /// Replacement framework set.
    pub frameworks: Option<BTreeSet<String>>,
    /// Replacement domain set.
    pub domains: Option<BTreeSet<String>>,
    /// Replacement tool set.
    pub tools: Option<BTreeSet<String>>,
    /// Replacement concurrency cap.
    pub max_concurrent_tasks: Option<usize>,
    /// Replacement memory cap in bytes.
    pub max_memory_usage: Option<u64>,
    /// Replacement execution-time cap.
    pub max_execution_time: Option<Duration>,
    /// Replacement reliability scalar.
    pub reliability: Option<f64>,
    /// Replacement speed scalar.
    pub speed: Option<f64>,
    /// Replacement quality scalar.
    pub quality: Option<f64>,
}

impl CapabilitiesOverride {
    /// Apply the delta to `base`, returning the merged capabilities.
    pub fn apply(&self, base: &AgentCapabilities) -> AgentCapabilities {
        let mut merged = base.clone();
        if let Some(v) = self.code_generation {
            merged.code_generation = v;
        }
        if let Some(v) = self.code_review {
            merged.code_review = v;
        }
        if let Some(v) = self.testing {
            merged.testing = v;
        }
        if let Some(v) = self.documentation {
            merged.documentation = v;
        }
        if let Some(v) = self.research {
            merged.research = v;
        }
        if let Some(v) = self.analysis {
            merged.analysis = v;
        }
        if let Some(v) = self.web_search {
            merged.web_search = v;
        }
        if let Some(v) = self.api_integration {
            merged.api_integration = v;
        }
        if let Some(v) = self.file_system {
            merged.file_system = v;
        }
        if let Some(v) = self.terminal_access {
            merged.terminal_access = v;
        }
        if let Some(ref v) = self.languages {
            merged.languages = v.clone();
        }
        if let Some(ref v) = self.frameworks {
            merged.frameworks = v.clone();
        }
        if let Some(ref v) = self.domains {
            merged.domains = v.clone();
        }
        if let Some(ref v) = self.tools {
            merged.tools = v.clone();
        }
        if let Some(v) = self.max_concurrent_tasks {
            merged.max_concurrent_tasks = v;
        }
        if let Some(v) = self.max_memory_usage {
            merged.max_memory_usage = v;
        }
        if let Some(v) = self.max_execution_time {
            merged.max_execution_time = v;
        }
        if let Some(v) = self.reliability {
            merged.reliability = v.clamp(0.0, 1.0);
        }
        if let Some(v) = self.speed {
            merged.speed = v.clamp(0.0, 1.0);
        }
        if let Some(v) = self.quality {
            merged.quality = v.clamp(0.0, 1.0);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_replaces_only_specified_fields() {
        let base = AgentCapabilities {
            code_generation: true,
            languages: ["rust".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let delta = CapabilitiesOverride {
            testing: Some(true),
            max_concurrent_tasks: Some(8),
            ..Default::default()
        };
        let merged = delta.apply(&base);
        assert!(merged.code_generation);
        assert!(merged.testing);
        assert_eq!(merged.max_concurrent_tasks, 8);
        assert!(merged.languages.contains("rust"));
    }

    #[test]
    fn quality_scalars_are_clamped_on_merge() {
        let delta = CapabilitiesOverride {
            reliability: Some(1.5),
            speed: Some(-0.2),
            ..Default::default()
        };
        let merged = delta.apply(&AgentCapabilities::default());
        assert_eq!(merged.reliability, 1.0);
        assert_eq!(merged.speed, 0.0);
    }

    #[test]
    fn label_matching_covers_flags_and_sets() {
        let caps = AgentCapabilities {
            code_generation: true,
            languages: ["typescript".to_string()].into_iter().collect(),
            frameworks: ["react".to_string()].into_iter().collect(),
            ..Default::default()
        };
        assert!(caps.matches_label("code-generation"));
        assert!(caps.matches_label("typescript"));
        assert!(caps.matches_label("react"));
        assert!(!caps.matches_label("kubernetes"));
    }
}
