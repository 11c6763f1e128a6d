//! Adapter exposing the agent manager to the dispatcher.

use std::sync::Arc;
use std::time::Duration;

use apiary_agents::AgentManager;
use apiary_dispatch::AgentDirectory;
use apiary_types::{AgentId, AgentRecord, TaskId};

/// [`AgentDirectory`] backed by the agent manager.
pub struct ManagerDirectory {
    manager: Arc<AgentManager>,
}

impl ManagerDirectory {
    /// Wrap a manager.
    pub fn new(manager: Arc<AgentManager>) -> Self {
        Self { manager }
    }
}

impl AgentDirectory for ManagerDirectory {
    fn candidates(&self) -> Vec<AgentRecord> {
        self.manager.candidates()
    }

    fn assign(&self, agent_id: AgentId, task_id: TaskId) -> anyhow::Result<()> {
        self.manager
            .assign_task(agent_id, task_id)
            .map_err(anyhow::Error::new)
    }

    fn release(&self, agent_id: AgentId, task_id: TaskId, execution_time: Duration, failed: bool) {
        self.manager
            .finish_task(agent_id, task_id, execution_time, failed);
    }
}
