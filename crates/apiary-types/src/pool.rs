//! Agent pools with autoscale bounds.

use serde::{Deserialize, Serialize};

use crate::template::AgentTemplate;
use crate::{AgentId, PoolId};

/// Autoscale configuration supplied at pool creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Lower bound on pool size; eagerly filled at creation.
    pub min_size: usize,
    /// Upper bound on pool size.
    pub max_size: usize,
    /// Whether utilization-driven scaling is enabled.
    pub auto_scale: bool,
    /// Utilization above which the pool grows.
    pub scale_up_threshold: f64,
    /// Utilization below which the pool shrinks.
    pub scale_down_threshold: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 4,
            auto_scale: true,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
        }
    }
}

/// A named set of homogeneous agents created from one template.
///
/// Pools reference agents by id only; the agent manager owns the records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPool {
    /// Unique pool id.
    pub id: PoolId,
    /// Pool name.
    pub name: String,
    /// Template type the pool spawns from.
    pub agent_type: String,
    /// Effective template snapshot taken at creation.
    pub template: AgentTemplate,
    /// Autoscale bounds and thresholds.
    pub config: PoolConfig,
    /// Members currently free for work.
    pub available_agents: Vec<AgentId>,
    /// Members currently executing work.
    pub busy_agents: Vec<AgentId>,
}

impl AgentPool {
    /// Total member count. Always `available + busy`.
    pub fn current_size(&self) -> usize {
        self.available_agents.len() + self.busy_agents.len()
    }

    /// Fraction of members that are busy, in `[0, 1]`.
    pub fn utilization(&self) -> f64 {
        let size = self.current_size();
        if size == 0 {
            return 0.0;
        }
        self.busy_agents.len() as f64 / size as f64
    }

    /// Move a member to the busy list if present among the available.
    pub fn mark_busy(&mut self, agent: AgentId) {
        if let Some(pos) = self.available_agents.iter().position(|a| *a == agent) {
            self.available_agents.remove(pos);
            self.busy_agents.push(agent);
        }
    }

    /// Move a member back to the available list if present among the busy.
    pub fn mark_available(&mut self, agent: AgentId) {
        if let Some(pos) = self.busy_agents.iter().position(|a| *a == agent) {
            self.busy_agents.remove(pos);
            self.available_agents.push(agent);
        }
    }

    /// Remove a member from both lists. Returns whether it was present.
    pub fn remove_member(&mut self, agent: AgentId) -> bool {
        let before = self.current_size();
        self.available_agents.retain(|a| *a != agent);
        self.busy_agents.retain(|a| *a != agent);
        self.current_size() != before
    }

    /// Whether the agent is a member of this pool.
    pub fn contains(&self, agent: AgentId) -> bool {
        self.available_agents.contains(&agent) || self.busy_agents.contains(&agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::AgentCapabilities;
    use crate::template::{AgentEnvironment, AgentRuntimeConfig};

    fn pool() -> AgentPool {
        AgentPool {
            id: PoolId::new(),
            name: "coders".to_string(),
            agent_type: "coder".to_string(),
            template: AgentTemplate {
                agent_type: "coder".to_string(),
                name: "Coder".to_string(),
                capabilities: AgentCapabilities::default(),
                config: AgentRuntimeConfig::default(),
                environment: AgentEnvironment::default(),
                startup_script: "coder.js".to_string(),
            },
            config: PoolConfig::default(),
            available_agents: Vec::new(),
            busy_agents: Vec::new(),
        }
    }

    #[test]
    fn size_is_sum_of_both_lists() {
        let mut p = pool();
        let a = AgentId::new();
        let b = AgentId::new();
        p.available_agents.push(a);
        p.busy_agents.push(b);
        assert_eq!(p.current_size(), 2);
        assert_eq!(p.utilization(), 0.5);
    }

    #[test]
    fn busy_and_available_transitions_preserve_size() {
        let mut p = pool();
        let a = AgentId::new();
        p.available_agents.push(a);
        p.mark_busy(a);
        assert_eq!(p.current_size(), 1);
        assert_eq!(p.busy_agents.len(), 1);
        p.mark_available(a);
        assert_eq!(p.current_size(), 1);
        assert_eq!(p.available_agents.len(), 1);
    }

    #[test]
    fn remove_member_clears_both_lists() {
        let mut p = pool();
        let a = AgentId::new();
        p.busy_agents.push(a);
        assert!(p.remove_member(a));
        assert!(!p.remove_member(a));
        assert_eq!(p.current_size(), 0);
    }
}
