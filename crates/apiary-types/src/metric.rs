//! Time-series metric primitives.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One recorded measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    /// When the measurement was taken.
    pub timestamp: DateTime<Utc>,
    /// Measured value.
    pub value: f64,
    /// Dimension tags.
    pub tags: HashMap<String, String>,
}

impl MetricPoint {
    /// Point stamped now with no tags.
    pub fn now(value: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            value,
            tags: HashMap::new(),
        }
    }
}

/// Incrementally maintained aggregations over a series.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricAggregations {
    /// Smallest observed value.
    pub min: f64,
    /// Largest observed value.
    pub max: f64,
    /// Running mean (`sum / count`).
    pub avg: f64,
    /// Sum of all observed values.
    pub sum: f64,
    /// Number of observed values.
    pub count: u64,
}

impl Default for MetricAggregations {
    fn default() -> Self {
        Self {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            avg: 0.0,
            sum: 0.0,
            count: 0,
        }
    }
}

impl MetricAggregations {
    /// Fold one value into the aggregations.
    pub fn observe(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
        self.avg = self.sum / self.count as f64;
    }
}

/// A named series: retained points plus running aggregations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSeries {
    /// Series name.
    pub name: String,
    /// Retained points, oldest first.
    pub points: Vec<MetricPoint>,
    /// Running aggregations over every point ever observed.
    pub aggregations: MetricAggregations,
    /// When the series last received a point.
    pub last_updated: DateTime<Utc>,
}

impl MetricSeries {
    /// New empty series.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            points: Vec::new(),
            aggregations: MetricAggregations::default(),
            last_updated: Utc::now(),
        }
    }

    /// Append a point and update aggregations.
    pub fn push(&mut self, point: MetricPoint) {
        self.aggregations.observe(point.value);
        self.last_updated = point.timestamp;
        self.points.push(point);
    }

    /// Drop points older than `cutoff`. Returns whether the series is now
    /// empty of points.
    pub fn evict_before(&mut self, cutoff: DateTime<Utc>) -> bool {
        self.points.retain(|p| p.timestamp >= cutoff);
        self.points.is_empty()
    }
}
