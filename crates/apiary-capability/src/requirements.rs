//! Task requirement extraction and inference.

use apiary_types::Task;

/// Normalized requirements derived from a task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskRequirements {
    /// Labels an agent must satisfy.
    pub required: Vec<String>,
    /// Labels that improve the score without being mandatory.
    pub preferred: Vec<String>,
    /// Languages the work involves.
    pub languages: Vec<String>,
    /// Frameworks the work involves.
    pub frameworks: Vec<String>,
    /// Complexity tier in `[1, 4]`.
    pub complexity: u8,
}

const DEVELOPMENT_KEYWORDS: &[&str] = &[
    "implement", "build", "code", "develop", "create", "refactor", "fix", "program",
];
const TESTING_KEYWORDS: &[&str] = &["test", "verify", "validate", "qa", "coverage"];
const ANALYSIS_KEYWORDS: &[&str] = &["analyze", "analyse", "inspect", "profile", "measure", "audit"];
const RESEARCH_KEYWORDS: &[&str] = &["research", "investigate", "explore", "survey", "study"];

impl TaskRequirements {
    /// Build requirements from a task's explicit fields, falling back to
    /// keyword inference over the description when none are given.
    pub fn from_task(task: &Task) -> Self {
        let mut required = task.required_capabilities.clone();
        if required.is_empty() {
            required = Self::infer_from_description(&task.description, &task.task_type);
        }
        Self {
            required,
            preferred: task.preferred_capabilities.clone(),
            languages: task.languages.clone(),
            frameworks: task.frameworks.clone(),
            complexity: Self::complexity_tier(task),
        }
    }

    fn infer_from_description(description: &str, task_type: &str) -> Vec<String> {
        let haystack = format!("{} {}", task_type, description).to_lowercase();
        let mut inferred = Vec::new();
        if DEVELOPMENT_KEYWORDS.iter().any(|k| haystack.contains(k)) {
            inferred.push("code-generation".to_string());
        }
        if TESTING_KEYWORDS.iter().any(|k| haystack.contains(k)) {
            inferred.push("testing".to_string());
        }
        if ANALYSIS_KEYWORDS.iter().any(|k| haystack.contains(k)) {
            inferred.push("analysis".to_string());
        }
        if RESEARCH_KEYWORDS.iter().any(|k| haystack.contains(k)) {
            inferred.push("research".to_string());
        }
        inferred
    }

    /// Complexity tier of the task in `[1, 4]`: an explicit
    /// `metadata.complexity` wins, otherwise cheap heuristics over the
    /// description and the requirement count.
    fn complexity_tier(task: &Task) -> u8 {
        if let Some(tier) = task
            .metadata
            .get("complexity")
            .and_then(|v| v.as_u64())
        {
            return tier.clamp(1, 4) as u8;
        }
        let text = task.description.to_lowercase();
        if text.contains("architecture") || text.contains("distributed") || text.contains("system-wide")
        {
            return 4;
        }
        if text.contains("complex") || text.contains("multi") {
            return 3;
        }
        if text.contains("simple") || text.contains("trivial") {
            return 1;
        }
        let breadth = task.required_capabilities.len() + task.languages.len() + task.frameworks.len();
        match breadth {
            0..=1 => 2,
            2..=4 => 3,
            _ => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_types::Task;

    #[test]
    fn explicit_requirements_win_over_inference() {
        let mut task = Task::new("code-generation", "implement the parser", 50);
        task.required_capabilities = vec!["testing".to_string()];
        let req = TaskRequirements::from_task(&task);
        assert_eq!(req.required, vec!["testing".to_string()]);
    }

    #[test]
    fn development_keywords_infer_code_generation() {
        let task = Task::new("work", "implement a REST endpoint", 50);
        let req = TaskRequirements::from_task(&task);
        assert!(req.required.contains(&"code-generation".to_string()));
    }

    #[test]
    fn multiple_keyword_families_all_infer() {
        let task = Task::new("work", "implement and test the migration", 50);
        let req = TaskRequirements::from_task(&task);
        assert!(req.required.contains(&"code-generation".to_string()));
        assert!(req.required.contains(&"testing".to_string()));
    }

    #[test]
    fn explicit_complexity_metadata_wins() {
        let mut task = Task::new("work", "anything", 50);
        task.metadata
            .insert("complexity".to_string(), serde_json::json!(4));
        assert_eq!(TaskRequirements::from_task(&task).complexity, 4);
    }

    #[test]
    fn architecture_keyword_raises_complexity() {
        let task = Task::new("work", "redesign the architecture of the ingest path", 50);
        assert_eq!(TaskRequirements::from_task(&task).complexity, 4);
    }

    #[test]
    fn simple_keyword_lowers_complexity() {
        let task = Task::new("work", "a simple rename", 50);
        assert_eq!(TaskRequirements::from_task(&task).complexity, 1);
    }
}
