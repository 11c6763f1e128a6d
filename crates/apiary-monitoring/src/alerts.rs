//! Rule evaluation and alert lifecycle.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use apiary_bus::{EventBus, SwarmEvent};
use apiary_types::{Alert, AlertAction, AlertRule, ALERT_HISTORY_CAPACITY};

/// Consecutive failing points required to resolve an active alert.
pub const RESOLUTION_MISS_STREAK: u32 = 5;

/// How long resolved alerts stay in history before purging.
const RESOLVED_RETENTION_HOURS: i64 = 24;

/// Side-effect executor for alert actions that reach outside the engine.
///
/// `log` is handled inline; the remaining actions are delegated so the
/// orchestrator can wire them to the agent manager and real transports.
#[async_trait]
pub trait AlertActionHandler: Send + Sync {
    /// Deliver the alert by email.
    async fn email(&self, alert: &Alert, recipients: &[String]) -> Result<()>;

    /// POST the alert to a webhook.
    async fn webhook(&self, alert: &Alert, url: &str) -> Result<()>;

    /// Request a pool scale-up for the affected metric.
    async fn auto_scale(&self, alert: &Alert) -> Result<()>;

    /// Request an agent restart for the affected metric.
    async fn restart(&self, alert: &Alert) -> Result<()>;
}

/// Action handler that does nothing. Used until the orchestrator wires the
/// real one.
#[derive(Debug, Default)]
pub struct NoopAlertActions;

#[async_trait]
impl AlertActionHandler for NoopAlertActions {
    async fn email(&self, _alert: &Alert, _recipients: &[String]) -> Result<()> {
        Ok(())
    }
    async fn webhook(&self, _alert: &Alert, _url: &str) -> Result<()> {
        Ok(())
    }
    async fn auto_scale(&self, _alert: &Alert) -> Result<()> {
        Ok(())
    }
    async fn restart(&self, _alert: &Alert) -> Result<()> {
        Ok(())
    }
}

struct EngineState {
    rules: HashMap<Uuid, AlertRule>,
    /// Unresolved alert per rule id. A rule cannot double-fire while its
    /// alert is unresolved.
    active: HashMap<Uuid, Alert>,
    /// Full alert history, bounded.
    history: VecDeque<Alert>,
    /// Consecutive points per rule that failed the condition.
    miss_streak: HashMap<Uuid, u32>,
}

/// Evaluates alert rules against the metric stream.
pub struct AlertEngine {
    state: RwLock<EngineState>,
    actions: RwLock<Arc<dyn AlertActionHandler>>,
    bus: EventBus,
}

impl std::fmt::Debug for AlertEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertEngine").finish_non_exhaustive()
    }
}

impl AlertEngine {
    /// Create an engine publishing alert lifecycle events on `bus`.
    pub fn new(bus: EventBus) -> Self {
        Self {
            state: RwLock::new(EngineState {
                rules: HashMap::new(),
                active: HashMap::new(),
                history: VecDeque::new(),
                miss_streak: HashMap::new(),
            }),
            actions: RwLock::new(Arc::new(NoopAlertActions)),
            bus,
        }
    }

    /// Install the side-effect executor for non-log actions.
    pub async fn set_action_handler(&self, handler: Arc<dyn AlertActionHandler>) {
        *self.actions.write().await = handler;
    }

    /// Register a rule. Replaces any rule with the same id.
    pub async fn add_rule(&self, rule: AlertRule) {
        let mut state = self.state.write().await;
        debug!(rule = %rule.name, metric = %rule.metric, "alert rule registered");
        state.rules.insert(rule.id, rule);
    }

    /// Remove a rule and any unresolved alert it owns.
    pub async fn remove_rule(&self, rule_id: Uuid) {
        let mut state = self.state.write().await;
        state.rules.remove(&rule_id);
        state.active.remove(&rule_id);
        state.miss_streak.remove(&rule_id);
    }

    /// Enable or disable a rule in place.
    pub async fn set_rule_enabled(&self, rule_id: Uuid, enabled: bool) {
        let mut state = self.state.write().await;
        if let Some(rule) = state.rules.get_mut(&rule_id) {
            rule.enabled = enabled;
        }
    }

    /// Feed one point into the engine. Fires and resolves alerts as the
    /// rule conditions dictate.
    pub async fn evaluate(&self, metric: &str, value: f64) {
        let mut fired: Vec<(Alert, Vec<AlertAction>)> = Vec::new();
        let mut resolved: Vec<Alert> = Vec::new();

        {
            let mut state = self.state.write().await;
            let matching: Vec<Uuid> = state
                .rules
                .values()
                .filter(|r| r.enabled && r.metric == metric)
                .map(|r| r.id)
                .collect();

            for rule_id in matching {
                let rule = match state.rules.get(&rule_id) {
                    Some(r) => r.clone(),
                    None => continue,
                };
                if rule.condition.holds(value, rule.threshold) {
                    state.miss_streak.insert(rule_id, 0);
                    if !state.active.contains_key(&rule_id) {
                        let alert = Alert {
                            id: Uuid::new_v4(),
                            rule_id,
                            level: rule.severity,
                            metric: metric.to_string(),
                            value,
                            threshold: rule.threshold,
                            timestamp: Utc::now(),
                            acknowledged: false,
                            resolved: false,
                            resolved_at: None,
                            resolution_reason: None,
                            escalation_level: 0,
                        };
                        state.active.insert(rule_id, alert.clone());
                        if state.history.len() == ALERT_HISTORY_CAPACITY {
                            state.history.pop_front();
                        }
                        state.history.push_back(alert.clone());
                        fired.push((alert, rule.actions.clone()));
                    } else if let Some(active) = state.active.get_mut(&rule_id) {
                        // Sustained pressure bumps escalation but does not
                        // double-fire.
                        active.escalation_level += 1;
                        active.value = value;
                    }
                } else {
                    let streak = state.miss_streak.entry(rule_id).or_insert(0);
                    *streak += 1;
                    if *streak >= RESOLUTION_MISS_STREAK {
                        if let Some(mut alert) = state.active.remove(&rule_id) {
                            alert.resolved = true;
                            alert.resolved_at = Some(Utc::now());
                            alert.resolution_reason = Some("condition_resolved".to_string());
                            // Keep the history entry in sync with the
                            // resolved copy.
                            if let Some(entry) =
                                state.history.iter_mut().find(|a| a.id == alert.id)
                            {
                                *entry = alert.clone();
                            }
                            resolved.push(alert);
                        }
                        state.miss_streak.insert(rule_id, 0);
                    }
                }
            }
        }

        for (alert, actions) in fired {
            info!(
                metric = %alert.metric,
                value = alert.value,
                level = alert.level.as_str(),
                "alert fired"
            );
            self.bus.emit(SwarmEvent::AlertCreated {
                alert: Box::new(alert.clone()),
            });
            self.execute_actions(&alert, &actions).await;
        }

        for alert in resolved {
            info!(metric = %alert.metric, "alert resolved");
            self.bus.emit(SwarmEvent::AlertResolved {
                alert: Box::new(alert),
                reason: "condition_resolved".to_string(),
            });
        }
    }

    async fn execute_actions(&self, alert: &Alert, actions: &[AlertAction]) {
        let handler = self.actions.read().await.clone();
        for action in actions {
            let result = match action {
                AlertAction::Log => {
                    warn!(
                        metric = %alert.metric,
                        value = alert.value,
                        threshold = alert.threshold,
                        level = alert.level.as_str(),
                        "alert condition met"
                    );
                    Ok(())
                }
                AlertAction::Email { recipients } => handler.email(alert, recipients).await,
                AlertAction::Webhook { url } => handler.webhook(alert, url).await,
                AlertAction::AutoScale => handler.auto_scale(alert).await,
                AlertAction::Restart => handler.restart(alert).await,
            };
            if let Err(err) = result {
                warn!(action = ?action, error = %err, "alert action failed");
            }
        }
    }

    /// Mark an alert acknowledged by an operator.
    pub async fn acknowledge(&self, alert_id: Uuid, acknowledged_by: &str) -> bool {
        let mut acknowledged = None;
        {
            let mut state = self.state.write().await;
            for alert in state.active.values_mut() {
                if alert.id == alert_id {
                    alert.acknowledged = true;
                    acknowledged = Some(alert.clone());
                    break;
                }
            }
            if let Some(ref alert) = acknowledged {
                if let Some(entry) = state.history.iter_mut().find(|a| a.id == alert.id) {
                    entry.acknowledged = true;
                }
            }
        }
        if let Some(alert) = acknowledged {
            self.bus.emit(SwarmEvent::AlertAcknowledged {
                alert: Box::new(alert),
                acknowledged_by: acknowledged_by.to_string(),
            });
            true
        } else {
            false
        }
    }

    /// Unresolved alerts.
    pub async fn active_alerts(&self) -> Vec<Alert> {
        self.state.read().await.active.values().cloned().collect()
    }

    /// Full alert history, oldest first.
    pub async fn alert_history(&self) -> Vec<Alert> {
        self.state.read().await.history.iter().cloned().collect()
    }

    /// Drop resolved alerts older than the retention window. The history
    /// cap is enforced at insert time.
    pub async fn maintenance(&self) {
        let cutoff = Utc::now() - ChronoDuration::hours(RESOLVED_RETENTION_HOURS);
        let mut state = self.state.write().await;
        state
            .history
            .retain(|a| !a.resolved || a.resolved_at.map(|t| t >= cutoff).unwrap_or(true));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_types::{AlertCondition, AlertLevel};

    fn engine() -> AlertEngine {
        AlertEngine::new(EventBus::new(64))
    }

    fn cpu_rule() -> AlertRule {
        AlertRule::new("high cpu", "system.cpu", AlertCondition::Gt, 0.9, AlertLevel::Critical)
    }

    #[tokio::test]
    async fn rule_fires_once_while_unresolved() {
        let e = engine();
        e.add_rule(cpu_rule()).await;
        e.evaluate("system.cpu", 0.95).await;
        e.evaluate("system.cpu", 0.97).await;
        let active = e.active_alerts().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].escalation_level, 1);
        assert_eq!(e.alert_history().await.len(), 1);
    }

    #[tokio::test]
    async fn alert_resolves_after_five_misses() {
        let e = engine();
        e.add_rule(cpu_rule()).await;
        e.evaluate("system.cpu", 0.95).await;
        assert_eq!(e.active_alerts().await.len(), 1);

        for _ in 0..4 {
            e.evaluate("system.cpu", 0.5).await;
        }
        assert_eq!(e.active_alerts().await.len(), 1);

        e.evaluate("system.cpu", 0.5).await;
        assert!(e.active_alerts().await.is_empty());

        let history = e.alert_history().await;
        assert!(history[0].resolved);
        assert_eq!(
            history[0].resolution_reason.as_deref(),
            Some("condition_resolved")
        );
    }

    #[tokio::test]
    async fn passing_point_resets_miss_streak() {
        let e = engine();
        e.add_rule(cpu_rule()).await;
        e.evaluate("system.cpu", 0.95).await;
        for _ in 0..4 {
            e.evaluate("system.cpu", 0.5).await;
        }
        // Condition holds again; the streak starts over.
        e.evaluate("system.cpu", 0.95).await;
        for _ in 0..4 {
            e.evaluate("system.cpu", 0.5).await;
        }
        assert_eq!(e.active_alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn disabled_rule_does_not_fire() {
        let e = engine();
        let rule = cpu_rule();
        let rule_id = rule.id;
        e.add_rule(rule).await;
        e.set_rule_enabled(rule_id, false).await;
        e.evaluate("system.cpu", 0.99).await;
        assert!(e.active_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn unrelated_metric_is_ignored() {
        let e = engine();
        e.add_rule(cpu_rule()).await;
        e.evaluate("system.memory", 0.99).await;
        assert!(e.active_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn fire_emits_alert_created_event() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let e = AlertEngine::new(bus);
        e.add_rule(cpu_rule()).await;
        e.evaluate("system.cpu", 0.95).await;
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, SwarmEvent::AlertCreated { .. }));
    }

    #[tokio::test]
    async fn acknowledge_marks_alert() {
        let e = engine();
        e.add_rule(cpu_rule()).await;
        e.evaluate("system.cpu", 0.95).await;
        let alert_id = e.active_alerts().await[0].id;
        assert!(e.acknowledge(alert_id, "operator").await);
        assert!(e.active_alerts().await[0].acknowledged);
        assert!(!e.acknowledge(Uuid::new_v4(), "operator").await);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let e = engine();
        // One rule per synthetic metric so each point fires a fresh alert.
        for i in 0..(ALERT_HISTORY_CAPACITY + 10) {
            let metric = format!("m{i}");
            e.add_rule(AlertRule::new(
                format!("rule {i}"),
                metric.clone(),
                AlertCondition::Gt,
                0.0,
                AlertLevel::Info,
            ))
            .await;
            e.evaluate(&metric, 1.0).await;
        }
        assert_eq!(e.alert_history().await.len(), ALERT_HISTORY_CAPACITY);
    }
}
