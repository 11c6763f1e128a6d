//! Built-in agent templates.
//!
//! The manager ships one template per supported agent type. Templates are
//! design defaults; creation-time overrides replace individual fields and
//! preserve the rest. Some types intentionally share identical bodies
//! (`coder` and `developer`); they stay registered as distinct names.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use apiary_types::capabilities::AgentCapabilities;
use apiary_types::config::{AgentDefaults, EnvironmentDefaults};
use apiary_types::template::{AgentEnvironment, AgentRuntimeConfig, AgentTemplate};

/// Registry of templates keyed by agent type.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: HashMap<String, AgentTemplate>,
}

impl TemplateRegistry {
    /// Build the registry of built-in templates, inheriting the configured
    /// agent and environment defaults.
    pub fn builtin(agent_defaults: &AgentDefaults, env_defaults: &EnvironmentDefaults) -> Self {
        let base_config = AgentRuntimeConfig {
            autonomy_level: agent_defaults.autonomy_level,
            learning_enabled: agent_defaults.learning_enabled,
            adaptation_enabled: agent_defaults.adaptation_enabled,
            ..Default::default()
        };
        let base_env = AgentEnvironment {
            runtime: env_defaults.runtime.clone(),
            working_directory: env_defaults.working_directory.clone(),
            temp_directory: env_defaults.temp_directory.clone(),
            log_directory: env_defaults.log_directory.clone(),
            variables: HashMap::new(),
        };

        let make = |agent_type: &str, name: &str, caps: AgentCapabilities| AgentTemplate {
            agent_type: agent_type.to_string(),
            name: name.to_string(),
            capabilities: caps,
            config: base_config.clone(),
            environment: base_env.clone(),
            startup_script: format!("agents/{agent_type}.js"),
        };

        let coder_caps = AgentCapabilities {
            code_generation: true,
            code_review: true,
            testing: true,
            languages: strings(&["typescript", "javascript", "python", "rust"]),
            frameworks: strings(&["react", "node", "express"]),
            domains: strings(&["backend-development", "web-development"]),
            tools: strings(&["git", "editor", "compiler"]),
            max_concurrent_tasks: 3,
            reliability: 0.85,
            speed: 0.6,
            quality: 0.85,
            ..Default::default()
        };

        let mut templates = HashMap::new();
        let mut register = |t: AgentTemplate| {
            templates.insert(t.agent_type.clone(), t);
        };

        register(make(
            "researcher",
            "Researcher Agent",
            AgentCapabilities {
                research: true,
                analysis: true,
                web_search: true,
                documentation: true,
                domains: strings(&["research", "analysis"]),
                tools: strings(&["browser", "notes"]),
                max_concurrent_tasks: 5,
                max_execution_time: Duration::from_secs(600),
                reliability: 0.9,
                speed: 0.5,
                quality: 0.9,
                ..Default::default()
            },
        ));
        register(make("coder", "Coder Agent", coder_caps.clone()));
        register(make(
            "analyst",
            "Analyst Agent",
            AgentCapabilities {
                analysis: true,
                research: true,
                documentation: true,
                languages: strings(&["python", "sql"]),
                frameworks: strings(&["pandas"]),
                domains: strings(&["data-engineering", "analysis"]),
                tools: strings(&["notebook", "profiler"]),
                max_concurrent_tasks: 4,
                reliability: 0.88,
                speed: 0.55,
                quality: 0.9,
                ..Default::default()
            },
        ));
        register(make(
            "requirements-engineer",
            "Requirements Engineer Agent",
            AgentCapabilities {
                research: true,
                analysis: true,
                documentation: true,
                domains: strings(&["requirements", "specification"]),
                tools: strings(&["editor", "tracker"]),
                max_concurrent_tasks: 3,
                reliability: 0.9,
                speed: 0.5,
                quality: 0.92,
                ..Default::default()
            },
        ));
        register(make(
            "design-architect",
            "Design Architect Agent",
            AgentCapabilities {
                analysis: true,
                documentation: true,
                code_review: true,
                domains: strings(&["architecture", "design"]),
                tools: strings(&["diagrams", "editor"]),
                max_concurrent_tasks: 2,
                reliability: 0.92,
                speed: 0.45,
                quality: 0.95,
                ..Default::default()
            },
        ));
        register(make(
            "task-planner",
            "Task Planner Agent",
            AgentCapabilities {
                analysis: true,
                documentation: true,
                domains: strings(&["planning", "coordination"]),
                tools: strings(&["tracker", "scheduler"]),
                max_concurrent_tasks: 6,
                reliability: 0.9,
                speed: 0.7,
                quality: 0.85,
                ..Default::default()
            },
        ));
        // Kept as a distinct type with the same body as `coder`.
        register(make("developer", "Developer Agent", coder_caps));
        register(make(
            "system-architect",
            "System Architect Agent",
            AgentCapabilities {
                analysis: true,
                code_review: true,
                documentation: true,
                domains: strings(&["architecture", "distributed-systems"]),
                tools: strings(&["diagrams", "editor", "profiler"]),
                max_concurrent_tasks: 2,
                reliability: 0.93,
                speed: 0.4,
                quality: 0.95,
                ..Default::default()
            },
        ));
        register(make(
            "tester",
            "Tester Agent",
            AgentCapabilities {
                testing: true,
                code_review: true,
                analysis: true,
                languages: strings(&["typescript", "python"]),
                frameworks: strings(&["jest", "pytest"]),
                domains: strings(&["quality-assurance"]),
                tools: strings(&["test-runner", "coverage"]),
                max_concurrent_tasks: 4,
                reliability: 0.9,
                speed: 0.65,
                quality: 0.9,
                ..Default::default()
            },
        ));
        register(make(
            "reviewer",
            "Reviewer Agent",
            AgentCapabilities {
                code_review: true,
                analysis: true,
                documentation: true,
                languages: strings(&["typescript", "python", "rust"]),
                domains: strings(&["quality-assurance", "code-review"]),
                tools: strings(&["diff-viewer", "linter"]),
                max_concurrent_tasks: 4,
                reliability: 0.92,
                speed: 0.6,
                quality: 0.93,
                ..Default::default()
            },
        ));
        register(make(
            "steering-author",
            "Steering Author Agent",
            AgentCapabilities {
                documentation: true,
                analysis: true,
                research: true,
                domains: strings(&["documentation", "governance"]),
                tools: strings(&["editor"]),
                max_concurrent_tasks: 3,
                reliability: 0.9,
                speed: 0.5,
                quality: 0.9,
                ..Default::default()
            },
        ));

        Self { templates }
    }

    /// Look up a template by type.
    pub fn get(&self, agent_type: &str) -> Option<&AgentTemplate> {
        self.templates.get(agent_type)
    }

    /// Register or replace a template.
    pub fn insert(&mut self, template: AgentTemplate) {
        self.templates.insert(template.agent_type.clone(), template);
    }

    /// Registered template type names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.templates.keys().cloned().collect();
        names.sort();
        names
    }
}

fn strings(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TemplateRegistry {
        TemplateRegistry::builtin(&AgentDefaults::default(), &EnvironmentDefaults::default())
    }

    #[test]
    fn all_builtin_types_are_registered() {
        let reg = registry();
        for name in [
            "researcher",
            "coder",
            "analyst",
            "requirements-engineer",
            "design-architect",
            "task-planner",
            "developer",
            "system-architect",
            "tester",
            "reviewer",
            "steering-author",
        ] {
            assert!(reg.get(name).is_some(), "missing template: {name}");
        }
        assert_eq!(reg.type_names().len(), 11);
    }

    #[test]
    fn coder_and_developer_share_capability_bodies() {
        let reg = registry();
        let coder = reg.get("coder").unwrap();
        let developer = reg.get("developer").unwrap();
        assert_eq!(coder.capabilities, developer.capabilities);
        assert_ne!(coder.agent_type, developer.agent_type);
    }

    #[test]
    fn templates_inherit_configured_defaults() {
        let defaults = AgentDefaults {
            autonomy_level: 0.3,
            learning_enabled: false,
            adaptation_enabled: false,
        };
        let reg = TemplateRegistry::builtin(&defaults, &EnvironmentDefaults::default());
        let t = reg.get("coder").unwrap();
        assert_eq!(t.config.autonomy_level, 0.3);
        assert!(!t.config.learning_enabled);
    }

    #[test]
    fn unknown_type_is_absent() {
        assert!(registry().get("warlock").is_none());
    }
}
