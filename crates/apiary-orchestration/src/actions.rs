//! Alert actions wired to the agent manager.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use apiary_agents::AgentManager;
use apiary_monitoring::AlertActionHandler;
use apiary_types::Alert;

/// Executes scale and restart alert actions against the agent manager.
/// Email and webhook delivery are out of scope here and only logged.
pub struct ManagerAlertActions {
    manager: Arc<AgentManager>,
}

impl ManagerAlertActions {
    /// Wrap a manager.
    pub fn new(manager: Arc<AgentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl AlertActionHandler for ManagerAlertActions {
    async fn email(&self, alert: &Alert, recipients: &[String]) -> Result<()> {
        info!(
            metric = %alert.metric,
            recipients = recipients.len(),
            "alert email requested (no transport configured)"
        );
        Ok(())
    }

    async fn webhook(&self, alert: &Alert, url: &str) -> Result<()> {
        info!(metric = %alert.metric, url, "alert webhook requested (no transport configured)");
        Ok(())
    }

    async fn auto_scale(&self, alert: &Alert) -> Result<()> {
        info!(metric = %alert.metric, "alert-driven autoscale evaluation");
        self.manager.autoscale_pools().await;
        Ok(())
    }

    async fn restart(&self, alert: &Alert) -> Result<()> {
        // Without an agent id on the alert, restart the least healthy
        // agent; that is the one most likely behind the firing metric.
        let victim = self
            .manager
            .list_agents()
            .into_iter()
            .filter(|a| a.status.is_active())
            .min_by(|a, b| {
                a.health
                    .partial_cmp(&b.health)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        match victim {
            Some(agent) => {
                info!(agent_id = %agent.id, metric = %alert.metric, "alert-driven agent restart");
                if let Err(err) = self
                    .manager
                    .restart_agent(agent.id, "alert action")
                    .await
                {
                    warn!(agent_id = %agent.id, error = %err, "alert-driven restart failed");
                }
            }
            None => warn!(metric = %alert.metric, "restart action with no active agents"),
        }
        Ok(())
    }
}
