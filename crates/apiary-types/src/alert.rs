//! Alert rules and materialized alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Comparison applied between a metric value and a rule threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertCondition {
    /// Value strictly greater than threshold.
    Gt,
    /// Value greater than or equal to threshold.
    Gte,
    /// Value strictly less than threshold.
    Lt,
    /// Value less than or equal to threshold.
    Lte,
    /// Value equal to threshold (bitwise float equality).
    Eq,
}

impl AlertCondition {
    /// Evaluate the comparison.
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Gte => value >= threshold,
            Self::Lt => value < threshold,
            Self::Lte => value <= threshold,
            Self::Eq => value == threshold,
        }
    }
}

/// Alert severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Informational.
    Info,
    /// Degraded but operational.
    Warning,
    /// Requires action.
    Critical,
}

impl AlertLevel {
    /// Stable lowercase spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// Side effect executed when a rule fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum AlertAction {
    /// Emit a structured log line.
    Log,
    /// Send an email to the configured recipients.
    Email {
        /// Recipient addresses.
        recipients: Vec<String>,
    },
    /// POST the alert to a webhook.
    Webhook {
        /// Target URL.
        url: String,
    },
    /// Ask the agent manager to scale the affected pool.
    AutoScale,
    /// Ask the agent manager to restart the affected agent.
    Restart,
}

/// A rule evaluated against every inbound point of its metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    /// Unique rule id.
    pub id: Uuid,
    /// Human-readable rule name.
    pub name: String,
    /// Metric the rule watches.
    pub metric: String,
    /// Comparison applied.
    pub condition: AlertCondition,
    /// Threshold compared against.
    pub threshold: f64,
    /// How long the condition must hold before firing.
    pub duration: std::time::Duration,
    /// Severity of alerts the rule raises.
    pub severity: AlertLevel,
    /// Actions executed on fire, in order; disabled actions are skipped.
    pub actions: Vec<AlertAction>,
    /// Whether the rule participates in evaluation.
    pub enabled: bool,
}

impl AlertRule {
    /// Convenience constructor with a single log action.
    pub fn new(
        name: impl Into<String>,
        metric: impl Into<String>,
        condition: AlertCondition,
        threshold: f64,
        severity: AlertLevel,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            metric: metric.into(),
            condition,
            threshold,
            duration: std::time::Duration::ZERO,
            severity,
            actions: vec![AlertAction::Log],
            enabled: true,
        }
    }
}

/// A materialized instance of a rule firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Unique alert id.
    pub id: Uuid,
    /// Rule that fired.
    pub rule_id: Uuid,
    /// Severity inherited from the rule.
    pub level: AlertLevel,
    /// Metric that triggered the alert.
    pub metric: String,
    /// Value that triggered the alert.
    pub value: f64,
    /// Rule threshold at fire time.
    pub threshold: f64,
    /// When the alert fired.
    pub timestamp: DateTime<Utc>,
    /// Whether an operator acknowledged the alert.
    pub acknowledged: bool,
    /// Whether the alert has resolved.
    pub resolved: bool,
    /// When the alert resolved, if it did.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Why the alert resolved (`condition_resolved`, ...).
    pub resolution_reason: Option<String>,
    /// Escalation counter bumped by repeated firing pressure.
    pub escalation_level: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditions_evaluate_correctly() {
        assert!(AlertCondition::Gt.holds(2.0, 1.0));
        assert!(!AlertCondition::Gt.holds(1.0, 1.0));
        assert!(AlertCondition::Gte.holds(1.0, 1.0));
        assert!(AlertCondition::Lt.holds(0.5, 1.0));
        assert!(AlertCondition::Lte.holds(1.0, 1.0));
        assert!(AlertCondition::Eq.holds(1.0, 1.0));
    }

    #[test]
    fn levels_order_by_severity() {
        assert!(AlertLevel::Info < AlertLevel::Warning);
        assert!(AlertLevel::Warning < AlertLevel::Critical);
    }
}
