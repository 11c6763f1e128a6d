//! Buffered time-series ingest with retention.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use apiary_types::{MetricPoint, MetricSeries};

use crate::alerts::AlertEngine;

/// Metric names delivered to the alert engine synchronously, bypassing the
/// buffer.
pub const CRITICAL_METRICS: &[&str] = &[
    "system.cpu",
    "system.memory",
    "system.disk",
    "agent.health",
    "task.failed",
    "error.count",
];

struct StoreState {
    series: HashMap<String, MetricSeries>,
}

/// Append-only time-series store feeding the alert engine.
pub struct MetricStore {
    state: Arc<RwLock<StoreState>>,
    buffer: Arc<Mutex<Vec<(String, MetricPoint)>>>,
    engine: Arc<AlertEngine>,
    retention: Duration,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MetricStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricStore")
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl MetricStore {
    /// Create a store that keeps points for `retention` and evaluates
    /// every point against `engine`.
    pub fn new(engine: Arc<AlertEngine>, retention: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState {
                series: HashMap::new(),
            })),
            buffer: Arc::new(Mutex::new(Vec::new())),
            engine,
            retention,
            flush_task: Mutex::new(None),
        }
    }

    /// Record one measurement. Critical metrics are written through and
    /// evaluated immediately; everything else waits for the next flush.
    pub async fn record(&self, name: &str, value: f64, tags: HashMap<String, String>) {
        let point = MetricPoint {
            timestamp: Utc::now(),
            value,
            tags,
        };
        if CRITICAL_METRICS.contains(&name) {
            self.append_point(name, point).await;
            self.engine.evaluate(name, value).await;
        } else {
            self.buffer.lock().await.push((name.to_string(), point));
        }
    }

    async fn append_point(&self, name: &str, point: MetricPoint) {
        let mut state = self.state.write().await;
        state
            .series
            .entry(name.to_string())
            .or_insert_with(|| MetricSeries::new(name))
            .push(point);
    }

    /// Drain the buffer into the series map, evaluating each point.
    /// Flushing an empty buffer is a no-op.
    pub async fn flush(&self) {
        let drained: Vec<(String, MetricPoint)> = {
            let mut buffer = self.buffer.lock().await;
            std::mem::take(&mut *buffer)
        };
        if drained.is_empty() {
            return;
        }
        debug!(points = drained.len(), "flushing metric buffer");
        for (name, point) in drained {
            let value = point.value;
            self.append_point(&name, point).await;
            self.engine.evaluate(&name, value).await;
        }
    }

    /// Drop points older than the retention window and garbage-collect
    /// series left empty.
    pub async fn evict_expired(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention)
                .unwrap_or_else(|_| chrono::Duration::seconds(3600));
        let mut state = self.state.write().await;
        state.series.retain(|_, series| !series.evict_before(cutoff));
    }

    /// Start the periodic flush/retention task.
    pub async fn start(self: &Arc<Self>, flush_interval: Duration) {
        let mut slot = self.flush_task.lock().await;
        if slot.is_some() {
            return;
        }
        let store = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("metric store flush loop started");
            loop {
                ticker.tick().await;
                store.flush().await;
                store.evict_expired().await;
            }
        });
        *slot = Some(handle);
    }

    /// Stop the periodic task, flushing once more.
    pub async fn stop(&self) {
        if let Some(handle) = self.flush_task.lock().await.take() {
            handle.abort();
        }
        self.flush().await;
    }

    /// Snapshot of one series.
    pub async fn series(&self, name: &str) -> Option<MetricSeries> {
        self.state.read().await.series.get(name).cloned()
    }

    /// Names of all live series.
    pub async fn series_names(&self) -> Vec<String> {
        self.state.read().await.series.keys().cloned().collect()
    }

    /// Snapshot of every series, for export and dashboards.
    pub async fn all_series(&self) -> HashMap<String, MetricSeries> {
        self.state.read().await.series.clone()
    }

    /// Export document for persistence under `monitoring:export`.
    pub async fn export_snapshot(&self) -> serde_json::Value {
        let series = self.all_series().await;
        let active_alerts = self.engine.active_alerts().await;
        match serde_json::to_value(&series) {
            Ok(time_series) => serde_json::json!({
                "timestamp": Utc::now(),
                "timeSeries": time_series,
                "activeAlerts": active_alerts,
            }),
            Err(err) => {
                error!(error = %err, "failed to serialize metric snapshot");
                serde_json::json!({ "timestamp": Utc::now() })
            }
        }
    }
}
