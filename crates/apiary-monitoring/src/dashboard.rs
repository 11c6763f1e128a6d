//! Read-only dashboard views over stored series.

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use apiary_types::{MetricAggregations, MetricPoint};

use crate::metrics::MetricStore;

/// One panel referencing a set of metric names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardPanel {
    /// Panel title.
    pub title: String,
    /// Metric names the panel charts.
    pub metrics: Vec<String>,
}

/// A named collection of panels over a shared time range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dashboard {
    /// Unique dashboard id.
    pub id: Uuid,
    /// Dashboard name.
    pub name: String,
    /// Panels, in display order.
    pub panels: Vec<DashboardPanel>,
    /// How far back the dashboard looks.
    pub range: Duration,
}

impl Dashboard {
    /// Create a dashboard over the given range.
    pub fn new(name: impl Into<String>, range: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            panels: Vec::new(),
            range,
        }
    }

    /// Append a panel.
    pub fn with_panel(mut self, title: impl Into<String>, metrics: Vec<String>) -> Self {
        self.panels.push(DashboardPanel {
            title: title.into(),
            metrics,
        });
        self
    }

    /// Materialize the dashboard against the store: for every panel metric,
    /// the points intersecting the range plus the series aggregations. This
    /// is a pure read; nothing feeds back into the engine.
    pub async fn data(&self, store: &MetricStore) -> DashboardData {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.range)
                .unwrap_or_else(|_| chrono::Duration::seconds(3600));
        let mut panels = Vec::with_capacity(self.panels.len());
        for panel in &self.panels {
            let mut series = Vec::new();
            for name in &panel.metrics {
                if let Some(s) = store.series(name).await {
                    let points: Vec<MetricPoint> = s
                        .points
                        .iter()
                        .filter(|p| p.timestamp >= cutoff)
                        .cloned()
                        .collect();
                    series.push(PanelSeries {
                        name: name.clone(),
                        points,
                        aggregations: s.aggregations,
                    });
                }
            }
            panels.push(PanelData {
                title: panel.title.clone(),
                series,
            });
        }
        DashboardData {
            dashboard_id: self.id,
            name: self.name.clone(),
            panels,
        }
    }
}

/// Range-intersected view of one series inside a panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelSeries {
    /// Series name.
    pub name: String,
    /// Points within the dashboard range.
    pub points: Vec<MetricPoint>,
    /// Aggregations over the whole series lifetime.
    pub aggregations: MetricAggregations,
}

/// Materialized data for one panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelData {
    /// Panel title.
    pub title: String,
    /// Series the panel charts.
    pub series: Vec<PanelSeries>,
}

/// Materialized data for one dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardData {
    /// Source dashboard id.
    pub dashboard_id: Uuid,
    /// Dashboard name.
    pub name: String,
    /// Panel payloads, in display order.
    pub panels: Vec<PanelData>,
}
