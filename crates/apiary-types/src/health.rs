//! Composite agent health records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The four component scores a health check produces, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthComponents {
    /// Heartbeat freshness.
    pub responsiveness: f64,
    /// Execution time relative to expectation.
    pub performance: f64,
    /// Completed versus failed task ratio.
    pub reliability: f64,
    /// Headroom under the configured resource limits.
    pub resource_usage: f64,
}

impl HealthComponents {
    /// Mean of the four components.
    pub fn overall(&self) -> f64 {
        (self.responsiveness + self.performance + self.reliability + self.resource_usage) / 4.0
    }

    /// Clamp every component into `[0, 1]`.
    pub fn clamped(self) -> Self {
        Self {
            responsiveness: self.responsiveness.clamp(0.0, 1.0),
            performance: self.performance.clamp(0.0, 1.0),
            reliability: self.reliability.clamp(0.0, 1.0),
            resource_usage: self.resource_usage.clamp(0.0, 1.0),
        }
    }
}

impl Default for HealthComponents {
    fn default() -> Self {
        Self {
            responsiveness: 1.0,
            performance: 1.0,
            reliability: 1.0,
            resource_usage: 1.0,
        }
    }
}

/// Direction the composite score is moving between checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthTrend {
    /// Score rising.
    Improving,
    /// Score roughly flat.
    Stable,
    /// Score falling.
    Degrading,
}

/// A problem surfaced by a health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthIssue {
    /// Component the issue was derived from.
    pub component: String,
    /// Severity band label (`warning` or `critical`).
    pub severity: String,
    /// Human-readable description.
    pub message: String,
}

/// Result of one composite health check for one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    /// Mean of the component scores.
    pub overall: f64,
    /// The component scores.
    pub components: HealthComponents,
    /// Issues generated from component bands.
    pub issues: Vec<HealthIssue>,
    /// When the check ran.
    pub last_check: DateTime<Utc>,
    /// Direction relative to the previous check.
    pub trend: HealthTrend,
}

impl HealthRecord {
    /// Build a record from component scores, clamping and deriving the
    /// overall mean and trend against `previous_overall`.
    pub fn from_components(components: HealthComponents, previous_overall: Option<f64>) -> Self {
        let components = components.clamped();
        let overall = components.overall();
        let trend = match previous_overall {
            Some(prev) if overall > prev + 0.05 => HealthTrend::Improving,
            Some(prev) if overall < prev - 0.05 => HealthTrend::Degrading,
            _ => HealthTrend::Stable,
        };
        Self {
            overall,
            components,
            issues: Vec::new(),
            last_check: Utc::now(),
            trend,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_is_mean_of_components() {
        let c = HealthComponents {
            responsiveness: 1.0,
            performance: 0.5,
            reliability: 0.5,
            resource_usage: 1.0,
        };
        assert!((c.overall() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn components_are_clamped() {
        let c = HealthComponents {
            responsiveness: 1.7,
            performance: -0.3,
            reliability: 0.5,
            resource_usage: 0.5,
        }
        .clamped();
        assert_eq!(c.responsiveness, 1.0);
        assert_eq!(c.performance, 0.0);
    }

    #[test]
    fn trend_tracks_previous_overall() {
        let c = HealthComponents::default();
        let r = HealthRecord::from_components(c, Some(0.5));
        assert_eq!(r.trend, HealthTrend::Improving);
        let r = HealthRecord::from_components(c, Some(1.0));
        assert_eq!(r.trend, HealthTrend::Stable);
    }
}
