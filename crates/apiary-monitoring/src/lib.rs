#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **apiary-monitoring** – Real-time metric ingest, alerting, and
//! dashboards for the Apiary control plane.
//!
//! Three pieces live here:
//!
//! - [`MetricStore`]: append-only time-series store. Points are buffered
//!   and flushed on a cadence; a fixed set of critical metric names
//!   bypasses the buffer and is evaluated synchronously.
//! - [`AlertEngine`]: evaluates enabled rules against every inbound point,
//!   opens alerts, executes actions, and resolves alerts after five
//!   consecutive points that fail the rule condition.
//! - [`Dashboard`]: read-only panel views over the stored series. Queries
//!   have no feedback effect on the engine.

pub mod alerts;
pub mod dashboard;
pub mod metrics;

pub use alerts::{AlertActionHandler, AlertEngine, NoopAlertActions, RESOLUTION_MISS_STREAK};
pub use dashboard::{Dashboard, DashboardData, DashboardPanel, PanelData, PanelSeries};
pub use metrics::{MetricStore, CRITICAL_METRICS};
