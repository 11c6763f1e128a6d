//! Agent pools and autoscaling.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use apiary_bus::SwarmEvent;
use apiary_types::template::TemplateOverride;
use apiary_types::{AgentId, AgentPool, AgentStatus, PoolConfig, PoolId};

use crate::manager::AgentManager;
use crate::{AgentManagerError, AgentResult};

impl AgentManager {
    /// Create a pool from a registered template and eagerly bring up
    /// `min_size` members. Member failures leave a smaller but reportable
    /// pool rather than failing the whole operation.
    #[instrument(skip(self, config))]
    pub async fn create_agent_pool(
        self: &Arc<Self>,
        name: &str,
        template_name: &str,
        config: PoolConfig,
    ) -> AgentResult<PoolId> {
        let template = {
            let registry = self.templates.lock().unwrap_or_else(|e| e.into_inner());
            registry
                .get(template_name)
                .cloned()
                .ok_or_else(|| AgentManagerError::TemplateNotFound(template_name.to_string()))?
        };

        let mut pool = AgentPool {
            id: PoolId::new(),
            name: name.to_string(),
            agent_type: template.agent_type.clone(),
            template,
            config,
            available_agents: Vec::new(),
            busy_agents: Vec::new(),
        };

        for i in 0..pool.config.min_size {
            match self.spawn_pool_member(template_name).await {
                Ok(agent_id) => pool.available_agents.push(agent_id),
                Err(err) => {
                    warn!(
                        pool = name,
                        member = i,
                        error = %err,
                        "pool member failed to come up, continuing with partial pool"
                    );
                }
            }
        }

        let pool_id = pool.id;
        info!(
            pool = name,
            pool_id = %pool_id,
            size = pool.current_size(),
            "agent pool created"
        );
        self.bus.emit(SwarmEvent::PoolCreated {
            pool: Box::new(pool.clone()),
        });
        self.pools.insert(pool_id, pool);
        Ok(pool_id)
    }

    /// Scale a pool to `target` members. Targets outside
    /// `[min_size, max_size]` are rejected without mutating the pool.
    /// Scale-down only retires members from the available list.
    #[instrument(skip(self))]
    pub async fn scale_pool(self: &Arc<Self>, pool_id: PoolId, target: usize) -> AgentResult<()> {
        let (from_size, template_type, min, max) = {
            let pool = self
                .pools
                .get(&pool_id)
                .ok_or(AgentManagerError::PoolNotFound(pool_id))?;
            (
                pool.current_size(),
                pool.agent_type.clone(),
                pool.config.min_size,
                pool.config.max_size,
            )
        };
        if target < min || target > max {
            return Err(AgentManagerError::InvalidPoolSize { target, min, max });
        }
        if target == from_size {
            return Ok(());
        }

        if target > from_size {
            for _ in from_size..target {
                let agent_id = self.spawn_pool_member(&template_type).await?;
                if let Some(mut pool) = self.pools.get_mut(&pool_id) {
                    pool.available_agents.push(agent_id);
                }
            }
        } else {
            let mut to_retire = Vec::new();
            {
                let mut pool = self
                    .pools
                    .get_mut(&pool_id)
                    .ok_or(AgentManagerError::PoolNotFound(pool_id))?;
                while pool.current_size() > target {
                    match pool.available_agents.pop() {
                        Some(agent_id) => to_retire.push(agent_id),
                        // Busy members are never retired by scaling.
                        None => break,
                    }
                }
            }
            for agent_id in to_retire {
                if let Err(err) = self.remove_agent(agent_id).await {
                    warn!(agent_id = %agent_id, error = %err, "failed to retire pool member");
                }
            }
        }

        let to_size = self
            .pools
            .get(&pool_id)
            .map(|p| p.current_size())
            .unwrap_or(target);
        info!(pool_id = %pool_id, from_size, to_size, "pool scaled");
        self.bus.emit(SwarmEvent::PoolScaled {
            pool_id,
            from_size,
            to_size,
        });
        Ok(())
    }

    /// Evaluate every autoscaling pool against its utilization thresholds
    /// and scale by one member where warranted.
    pub async fn autoscale_pools(self: &Arc<Self>) {
        let decisions: Vec<(PoolId, usize)> = self
            .pools
            .iter()
            .filter_map(|entry| {
                let pool = entry.value();
                if !pool.config.auto_scale {
                    return None;
                }
                let size = pool.current_size();
                let utilization = pool.utilization();
                if utilization >= pool.config.scale_up_threshold && size < pool.config.max_size {
                    Some((pool.id, size + 1))
                } else if utilization <= pool.config.scale_down_threshold
                    && size > pool.config.min_size
                {
                    Some((pool.id, size - 1))
                } else {
                    None
                }
            })
            .collect();

        for (pool_id, target) in decisions {
            debug!(pool_id = %pool_id, target, "autoscaling pool");
            if let Err(err) = self.scale_pool(pool_id, target).await {
                warn!(pool_id = %pool_id, error = %err, "autoscale failed");
            }
        }
    }

    /// Grow the pool owning an agent of `agent_type` by one, if any such
    /// autoscaling pool has headroom. Used by alert-driven scale actions.
    pub async fn scale_up_pool_for_type(self: &Arc<Self>, agent_type: &str) -> AgentResult<()> {
        let decision = self.pools.iter().find_map(|entry| {
            let pool = entry.value();
            if pool.agent_type == agent_type && pool.current_size() < pool.config.max_size {
                Some((pool.id, pool.current_size() + 1))
            } else {
                None
            }
        });
        match decision {
            Some((pool_id, target)) => self.scale_pool(pool_id, target).await,
            None => Ok(()),
        }
    }

    /// Snapshot of one pool.
    pub fn pool(&self, pool_id: PoolId) -> Option<AgentPool> {
        self.pools.get(&pool_id).map(|p| p.clone())
    }

    /// Snapshots of every pool.
    pub fn list_pools(&self) -> Vec<AgentPool> {
        self.pools.iter().map(|entry| entry.value().clone()).collect()
    }

    async fn spawn_pool_member(self: &Arc<Self>, template_name: &str) -> AgentResult<AgentId> {
        let agent_id = self
            .create_agent(template_name, &TemplateOverride::default())
            .await?;
        self.start_agent(agent_id).await?;
        Ok(agent_id)
    }

    /// Keep pool availability lists in sync with an agent status change.
    pub(crate) fn sync_pool_membership(&self, agent_id: AgentId, to: AgentStatus) {
        for mut entry in self.pools.iter_mut() {
            if !entry.value().contains(agent_id) {
                continue;
            }
            match to {
                AgentStatus::Busy => entry.value_mut().mark_busy(agent_id),
                AgentStatus::Idle => entry.value_mut().mark_available(agent_id),
                _ => {}
            }
        }
    }

    /// Drop an agent from every pool's membership lists.
    pub(crate) fn remove_agent_from_pools(&self, agent_id: AgentId) {
        for mut entry in self.pools.iter_mut() {
            entry.value_mut().remove_member(agent_id);
        }
    }
}
