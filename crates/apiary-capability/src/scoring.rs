//! Weighted agent scoring and deterministic ranking.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::debug;

use apiary_types::{AgentCapabilities, AgentId, AgentRecord, Task};

use crate::requirements::TaskRequirements;

const WEIGHT_REQUIRED_HIT: f64 = 20.0;
const WEIGHT_REQUIRED_MISS: f64 = -5.0;
const WEIGHT_PREFERRED_HIT: f64 = 10.0;
const WEIGHT_LANGUAGE_OVERLAP: f64 = 15.0;
const WEIGHT_FRAMEWORK_OVERLAP: f64 = 15.0;
const WEIGHT_DOMAIN_OVERLAP: f64 = 10.0;
const WEIGHT_HEALTH: f64 = 10.0;
const WEIGHT_WORKLOAD: f64 = 10.0;
const WEIGHT_RELIABILITY: f64 = 10.0;
const WEIGHT_COMPLEXITY_MAX: f64 = 10.0;

/// Fixed concept vocabulary for labels that are not a direct capability
/// surface. A required label maps to tokens; any token matching the agent
/// counts the label as satisfied.
static CONCEPT_TOKENS: Lazy<HashMap<&'static str, &'static [&'static str]>> = Lazy::new(|| {
    let mut map: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
    map.insert(
        "web-development",
        &["react", "vue", "angular", "svelte", "html", "css", "javascript", "typescript"],
    );
    map.insert(
        "backend-development",
        &["node", "express", "django", "flask", "spring", "rust", "go", "java", "python"],
    );
    map.insert(
        "data-engineering",
        &["sql", "spark", "pandas", "etl", "airflow", "python"],
    );
    map.insert(
        "machine-learning",
        &["pytorch", "tensorflow", "sklearn", "ml", "python"],
    );
    map.insert(
        "devops",
        &["docker", "kubernetes", "terraform", "ci", "cd", "ansible"],
    );
    map.insert(
        "mobile-development",
        &["swift", "kotlin", "react-native", "flutter", "ios", "android"],
    );
    map.insert(
        "quality-assurance",
        &["testing", "jest", "pytest", "selenium", "coverage"],
    );
    map
});

/// Qualitative band a score falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchReason {
    /// Score of at least 90.
    Excellent,
    /// Score of at least 75.
    Good,
    /// Score of at least 50.
    Partial,
    /// Everything below.
    Poor,
}

impl MatchReason {
    fn for_score(score: f64) -> Self {
        if score >= 90.0 {
            Self::Excellent
        } else if score >= 75.0 {
            Self::Good
        } else if score >= 50.0 {
            Self::Partial
        } else {
            Self::Poor
        }
    }

    /// Short explanation string for operators.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent capability match",
            Self::Good => "good capability match",
            Self::Partial => "partial capability match",
            Self::Poor => "poor capability match",
        }
    }
}

/// One entry of a ranking produced by the matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedMatch {
    /// The scored agent.
    pub agent_id: AgentId,
    /// Normalized score in `[0, 100]`.
    pub score: f64,
    /// `matched / (matched + missing)` penalized by required misses.
    pub confidence: f64,
    /// Qualitative band of the score.
    pub reason: MatchReason,
    /// Labels the agent satisfied.
    pub matched: Vec<String>,
    /// Required labels the agent did not satisfy.
    pub missing: Vec<String>,
}

impl RankedMatch {
    /// Whether every required label was satisfied.
    pub fn meets_requirements(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Stateless scorer ranking agents against task requirements.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilityMatcher;

impl CapabilityMatcher {
    /// Create a matcher.
    pub fn new() -> Self {
        Self
    }

    /// Score `agents` against `task` and return the best `k` matches,
    /// deterministically ordered. Never fails; an empty candidate set
    /// yields an empty ranking.
    pub fn find_best_agents(&self, task: &Task, agents: &[AgentRecord], k: usize) -> Vec<RankedMatch> {
        let requirements = TaskRequirements::from_task(task);
        let mut ranked: Vec<(RankedMatch, f64, f64)> = agents
            .iter()
            .map(|agent| {
                let m = self.score_agent(&requirements, agent);
                (m, agent.capabilities.reliability, agent.workload)
            })
            .collect();

        // Score desc, then confidence desc, reliability desc, workload asc,
        // id lexicographic asc. Total order keeps dispatch reproducible.
        ranked.sort_by(|(a, a_rel, a_load), (b, b_rel, b_load)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.confidence
                        .partial_cmp(&a.confidence)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(b_rel.partial_cmp(a_rel).unwrap_or(std::cmp::Ordering::Equal))
                .then(a_load.partial_cmp(b_load).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.agent_id.0.cmp(&b.agent_id.0))
        });

        debug!(
            task_id = %task.id,
            candidates = agents.len(),
            "ranked agents for task"
        );

        ranked.into_iter().take(k).map(|(m, _, _)| m).collect()
    }

    fn score_agent(&self, req: &TaskRequirements, agent: &AgentRecord) -> RankedMatch {
        let caps = &agent.capabilities;
        let mut raw = 0.0;
        let mut max = 0.0;
        let mut matched = Vec::new();
        let mut missing = Vec::new();

        for label in &req.required {
            max += WEIGHT_REQUIRED_HIT;
            if label_matches(caps, label) {
                raw += WEIGHT_REQUIRED_HIT;
                matched.push(label.clone());
            } else {
                raw += WEIGHT_REQUIRED_MISS;
                missing.push(label.clone());
            }
        }

        for label in &req.preferred {
            max += WEIGHT_PREFERRED_HIT;
            if label_matches(caps, label) {
                raw += WEIGHT_PREFERRED_HIT;
                matched.push(label.clone());
            }
        }

        if !req.languages.is_empty() {
            max += WEIGHT_LANGUAGE_OVERLAP;
            if req.languages.iter().any(|l| caps.languages.contains(l)) {
                raw += WEIGHT_LANGUAGE_OVERLAP;
            }
        }
        if !req.frameworks.is_empty() {
            max += WEIGHT_FRAMEWORK_OVERLAP;
            if req.frameworks.iter().any(|f| caps.frameworks.contains(f)) {
                raw += WEIGHT_FRAMEWORK_OVERLAP;
            }
        }
        // Domain overlap is scored against the requirement labels since
        // tasks carry domains inside their labels.
        let domain_overlap = req
            .required
            .iter()
            .chain(req.preferred.iter())
            .any(|l| caps.domains.contains(l));
        if domain_overlap {
            raw += WEIGHT_DOMAIN_OVERLAP;
        }
        max += WEIGHT_DOMAIN_OVERLAP;

        max += WEIGHT_HEALTH + WEIGHT_WORKLOAD + WEIGHT_RELIABILITY;
        raw += agent.health * WEIGHT_HEALTH;
        raw += (1.0 - agent.workload) * WEIGHT_WORKLOAD;
        raw += caps.reliability * WEIGHT_RELIABILITY;

        max += WEIGHT_COMPLEXITY_MAX;
        raw += complexity_alignment(agent_complexity_level(caps), req.complexity);

        let score = if max > 0.0 {
            (raw / max * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };

        let labelled = matched.len() + missing.len();
        let base_confidence = if labelled == 0 {
            1.0
        } else {
            matched.len() as f64 / labelled as f64
        };
        let confidence = (base_confidence - 0.15 * missing.len() as f64).clamp(0.0, 1.0);

        RankedMatch {
            agent_id: agent.id,
            score,
            confidence,
            reason: MatchReason::for_score(score),
            matched,
            missing,
        }
    }
}

/// Direct capability surface check with semantic concept fallback.
fn label_matches(caps: &AgentCapabilities, label: &str) -> bool {
    if caps.matches_label(label) {
        return true;
    }
    if let Some(tokens) = CONCEPT_TOKENS.get(label) {
        return tokens.iter().any(|t| caps.matches_label(t));
    }
    false
}

/// Agent complexity level in `[1, 4]` from capability breadth and
/// reliability.
fn agent_complexity_level(caps: &AgentCapabilities) -> u8 {
    let breadth = caps.breadth();
    let base = match breadth {
        0..=4 => 1,
        5..=9 => 2,
        10..=15 => 3,
        _ => 4,
    };
    if caps.reliability >= 0.9 && base < 4 {
        base + 1
    } else {
        base
    }
}

/// Alignment bonus for the distance between agent level and task tier.
fn complexity_alignment(agent_level: u8, task_tier: u8) -> f64 {
    match agent_level.abs_diff(task_tier) {
        0 => 10.0,
        1 => 7.0,
        2 => 4.0,
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_types::{
        AgentMetrics, AgentRecord, AgentStatus, BoundedHistory, SwarmId, TaskId,
    };
    use apiary_types::template::{AgentEnvironment, AgentRuntimeConfig};
    use chrono::Utc;

    fn agent_with(caps: AgentCapabilities) -> AgentRecord {
        AgentRecord {
            id: AgentId::new(),
            swarm_id: SwarmId::new(),
            agent_type: "coder".to_string(),
            instance: 1,
            name: "Coder 1".to_string(),
            status: AgentStatus::Idle,
            capabilities: caps,
            config: AgentRuntimeConfig::default(),
            environment: AgentEnvironment::default(),
            startup_script: "coder.js".to_string(),
            metrics: AgentMetrics::default(),
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

    fn coder_caps() -> AgentCapabilities {
        AgentCapabilities {
            code_generation: true,
            testing: true,
            languages: ["typescript".to_string(), "rust".to_string()]
                .into_iter()
                .collect(),
            frameworks: ["react".to_string()].into_iter().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_candidate_set_yields_empty_ranking() {
        let matcher = CapabilityMatcher::new();
        let task = Task::new("code-generation", "implement a feature", 50);
        assert!(matcher.find_best_agents(&task, &[], 3).is_empty());
    }

    #[test]
    fn capable_agent_outranks_incapable_one() {
        let matcher = CapabilityMatcher::new();
        let coder = agent_with(coder_caps());
        let analyst = agent_with(AgentCapabilities {
            analysis: true,
            ..Default::default()
        });
        let mut task = Task::new("code-generation", "implement a feature", 50);
        task.required_capabilities = vec!["code-generation".to_string()];

        let ranked = matcher.find_best_agents(&task, &[analyst.clone(), coder.clone()], 2);
        assert_eq!(ranked[0].agent_id, coder.id);
        assert!(ranked[0].meets_requirements());
        assert!(!ranked[1].meets_requirements());
        assert_eq!(ranked[1].missing, vec!["code-generation".to_string()]);
    }

    #[test]
    fn language_overlap_raises_score() {
        let matcher = CapabilityMatcher::new();
        let coder = agent_with(coder_caps());
        let mut with_lang = Task::new("code-generation", "implement a feature", 50);
        with_lang.required_capabilities = vec!["code-generation".to_string()];
        with_lang.languages = vec!["typescript".to_string()];
        let mut without_lang = with_lang.clone();
        without_lang.languages = vec!["cobol".to_string()];

        let hit = &matcher.find_best_agents(&with_lang, std::slice::from_ref(&coder), 1)[0];
        let miss = &matcher.find_best_agents(&without_lang, std::slice::from_ref(&coder), 1)[0];
        assert!(hit.score > miss.score);
    }

    #[test]
    fn concept_fallback_accepts_indirect_label() {
        let matcher = CapabilityMatcher::new();
        let coder = agent_with(coder_caps());
        let mut task = Task::new("work", "ship the dashboard", 50);
        task.required_capabilities = vec!["web-development".to_string()];
        let ranked = matcher.find_best_agents(&task, std::slice::from_ref(&coder), 1);
        assert!(ranked[0].meets_requirements());
    }

    #[test]
    fn workload_breaks_ties_before_id() {
        let matcher = CapabilityMatcher::new();
        let mut busy = agent_with(coder_caps());
        busy.workload = 0.5;
        let idle = agent_with(coder_caps());
        let mut task = Task::new("code-generation", "implement a feature", 50);
        task.required_capabilities = vec!["code-generation".to_string()];

        let ranked = matcher.find_best_agents(&task, &[busy.clone(), idle.clone()], 2);
        assert_eq!(ranked[0].agent_id, idle.id);
    }

    #[test]
    fn ranking_is_deterministic_for_identical_agents() {
        let matcher = CapabilityMatcher::new();
        let a = agent_with(coder_caps());
        let b = agent_with(coder_caps());
        let task = Task::new("code-generation", "implement a feature", 50);

        let first = matcher.find_best_agents(&task, &[a.clone(), b.clone()], 2);
        let second = matcher.find_best_agents(&task, &[b, a], 2);
        assert_eq!(first[0].agent_id, second[0].agent_id);
        assert_eq!(first[1].agent_id, second[1].agent_id);
    }

    #[test]
    fn confidence_penalized_by_required_misses() {
        let matcher = CapabilityMatcher::new();
        let analyst = agent_with(AgentCapabilities {
            analysis: true,
            ..Default::default()
        });
        let mut task = Task::new("work", "do things", 50);
        task.required_capabilities = vec!["code-generation".to_string(), "analysis".to_string()];
        let ranked = matcher.find_best_agents(&task, std::slice::from_ref(&analyst), 1);
        let m = &ranked[0];
        assert_eq!(m.matched.len(), 1);
        assert_eq!(m.missing.len(), 1);
        assert!(m.confidence < 0.5);
    }

    #[test]
    fn score_band_maps_to_reason() {
        assert_eq!(MatchReason::for_score(95.0), MatchReason::Excellent);
        assert_eq!(MatchReason::for_score(80.0), MatchReason::Good);
        assert_eq!(MatchReason::for_score(60.0), MatchReason::Partial);
        assert_eq!(MatchReason::for_score(10.0), MatchReason::Poor);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn scores_and_confidence_stay_in_range(
                health in 0.0f64..=1.0,
                workload in 0.0f64..=1.0,
                reliability in 0.0f64..=1.0,
                required in proptest::collection::vec("[a-z-]{3,20}", 0..6),
                priority in 0u8..=100,
            ) {
                let matcher = CapabilityMatcher::new();
                let mut agent = agent_with(coder_caps());
                agent.health = health;
                agent.workload = workload;
                agent.capabilities.reliability = reliability;

                let mut task = Task::new("work", "do the work", priority);
                task.required_capabilities = required;

                let ranked = matcher.find_best_agents(&task, std::slice::from_ref(&agent), 1);
                prop_assert_eq!(ranked.len(), 1);
                let m = &ranked[0];
                prop_assert!((0.0..=100.0).contains(&m.score));
                prop_assert!((0.0..=1.0).contains(&m.confidence));
            }
        }
    }
}
