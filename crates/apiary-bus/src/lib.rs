#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **apiary-bus** – Typed in-process event bus for the Apiary control
//! plane.
//!
//! Every lifecycle signal between components travels through this bus as a
//! [`SwarmEvent`] variant. The bus offers two consumption styles:
//!
//! - **Broadcast subscription** ([`EventBus::subscribe`]): a Tokio
//!   broadcast receiver carrying copies of every event. Slow subscribers
//!   may lag and miss events.
//! - **Registered handlers** ([`EventBus::on`]): synchronous callbacks
//!   invoked in registration order on the emitting task. Handlers must not
//!   block; long work must be re-dispatched. A handler error is caught,
//!   surfaced as a [`SwarmEvent::SystemError`], and does not abort the
//!   remaining handlers for the same event.
//!
//! The bus keeps per-topic emission counters and supports bounded waits
//! for a specific topic or predicate. It is injected explicitly wherever
//! it is needed; there is no global instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, warn};

use apiary_types::{
    AgentId, AgentPool, AgentStatus, Alert, PoolId, ResourceUsage, Task, TaskId,
};

/// Default depth of the broadcast ring buffer.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

//─────────────────────────────
//  Topics
//─────────────────────────────

/// Topic a [`SwarmEvent`] is published under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// `agent:ready`
    AgentReady,
    /// `agent:heartbeat`
    AgentHeartbeat,
    /// `agent:error`
    AgentError,
    /// `agent:status-changed`
    AgentStatusChanged,
    /// `agent:process-exit`
    AgentProcessExit,
    /// `task:created`
    TaskCreated,
    /// `task:assigned`
    TaskAssigned,
    /// `task:started`
    TaskStarted,
    /// `task:completed`
    TaskCompleted,
    /// `task:failed`
    TaskFailed,
    /// `task:cancelled`
    TaskCancelled,
    /// `resource:usage`
    ResourceUsage,
    /// `swarm:metrics-update`
    SwarmMetricsUpdate,
    /// `pool:created`
    PoolCreated,
    /// `pool:scaled`
    PoolScaled,
    /// `alert:created`
    AlertCreated,
    /// `alert:resolved`
    AlertResolved,
    /// `alert:acknowledged`
    AlertAcknowledged,
    /// `system:ready`
    SystemReady,
    /// `system:shutdown`
    SystemShutdown,
    /// `system:error`
    SystemError,
    /// `deadlock:detected`
    DeadlockDetected,
}

impl Topic {
    /// Wire spelling of the topic.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentReady => "agent:ready",
            Self::AgentHeartbeat => "agent:heartbeat",
            Self::AgentError => "agent:error",
            Self::AgentStatusChanged => "agent:status-changed",
            Self::AgentProcessExit => "agent:process-exit",
            Self::TaskCreated => "task:created",
            Self::TaskAssigned => "task:assigned",
            Self::TaskStarted => "task:started",
            Self::TaskCompleted => "task:completed",
            Self::TaskFailed => "task:failed",
            Self::TaskCancelled => "task:cancelled",
            Self::ResourceUsage => "resource:usage",
            Self::SwarmMetricsUpdate => "swarm:metrics-update",
            Self::PoolCreated => "pool:created",
            Self::PoolScaled => "pool:scaled",
            Self::AlertCreated => "alert:created",
            Self::AlertResolved => "alert:resolved",
            Self::AlertAcknowledged => "alert:acknowledged",
            Self::SystemReady => "system:ready",
            Self::SystemShutdown => "system:shutdown",
            Self::SystemError => "system:error",
            Self::DeadlockDetected => "deadlock:detected",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

//─────────────────────────────
//  Events
//─────────────────────────────

/// One agent participating in a reported deadlock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadlockedAgent {
    /// The agent's id.
    pub agent_id: AgentId,
    /// The agent's scheduling priority; the lowest loses its tasks.
    pub priority: u8,
}

/// Typed event enumeration carried by the bus. Payload shapes are
/// contracts shared with agent processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum SwarmEvent {
    /// An agent process finished startup and accepts work.
    AgentReady {
        /// The agent that became ready.
        agent_id: AgentId,
    },
    /// Periodic liveness signal from an agent process.
    AgentHeartbeat {
        /// The reporting agent.
        agent_id: AgentId,
        /// When the heartbeat was produced.
        timestamp: DateTime<Utc>,
        /// Free-form metrics attached by the agent.
        metrics: serde_json::Value,
    },
    /// An agent reported or suffered a fault.
    AgentError {
        /// The faulting agent.
        agent_id: AgentId,
        /// Fault description.
        error: String,
    },
    /// An agent moved between lifecycle states.
    AgentStatusChanged {
        /// The agent that changed state.
        agent_id: AgentId,
        /// Previous state.
        from: AgentStatus,
        /// New state.
        to: AgentStatus,
    },
    /// An agent's child process exited.
    AgentProcessExit {
        /// The agent whose process exited.
        agent_id: AgentId,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
    },
    /// A task entered the queue.
    TaskCreated {
        /// The submitted task.
        task: Box<Task>,
    },
    /// A task was handed to an agent.
    TaskAssigned {
        /// The assigned task.
        task_id: TaskId,
        /// The receiving agent.
        agent_id: AgentId,
    },
    /// An agent began executing a task.
    TaskStarted {
        /// The started task.
        task_id: TaskId,
        /// The executing agent.
        agent_id: AgentId,
    },
    /// A task finished successfully.
    TaskCompleted {
        /// The completed task.
        task_id: TaskId,
        /// The executing agent.
        agent_id: AgentId,
        /// Result payload.
        result: serde_json::Value,
        /// Wall-clock execution time.
        execution_time: Duration,
        /// Per-task metrics the agent chose to report, if any.
        metrics: Option<serde_json::Value>,
    },
    /// A task failed on its agent.
    TaskFailed {
        /// The failed task.
        task_id: TaskId,
        /// Failure description.
        error: String,
    },
    /// A task was cancelled before completion.
    TaskCancelled {
        /// The cancelled task.
        task_id: TaskId,
        /// Cancellation reason.
        reason: String,
    },
    /// Periodic resource report from an agent process.
    ResourceUsage {
        /// The reporting agent.
        agent_id: AgentId,
        /// Reported usage.
        usage: ResourceUsage,
    },
    /// Aggregated swarm-level metrics snapshot.
    SwarmMetricsUpdate {
        /// Snapshot payload.
        metrics: serde_json::Value,
    },
    /// A pool was created.
    PoolCreated {
        /// Snapshot of the new pool.
        pool: Box<AgentPool>,
    },
    /// A pool changed size.
    PoolScaled {
        /// The scaled pool.
        pool_id: PoolId,
        /// Size before scaling.
        from_size: usize,
        /// Size after scaling.
        to_size: usize,
    },
    /// An alert rule fired.
    AlertCreated {
        /// The materialized alert.
        alert: Box<Alert>,
    },
    /// An active alert resolved.
    AlertResolved {
        /// The resolved alert.
        alert: Box<Alert>,
        /// Resolution reason.
        reason: String,
    },
    /// An operator acknowledged an alert.
    AlertAcknowledged {
        /// The acknowledged alert.
        alert: Box<Alert>,
        /// Who acknowledged it.
        acknowledged_by: String,
    },
    /// The orchestrator finished initialization.
    SystemReady,
    /// The orchestrator is shutting down.
    SystemShutdown {
        /// Shutdown reason.
        reason: String,
    },
    /// A component-level fault.
    SystemError {
        /// The faulting component.
        component: String,
        /// Fault description.
        error: String,
    },
    /// A deadlock among agents and resources was reported.
    DeadlockDetected {
        /// Agents participating in the cycle.
        agents: Vec<DeadlockedAgent>,
        /// Resources involved.
        resources: Vec<String>,
    },
}

impl SwarmEvent {
    /// Topic this event is published under.
    pub fn topic(&self) -> Topic {
        match self {
            Self::AgentReady { .. } => Topic::AgentReady,
            Self::AgentHeartbeat { .. } => Topic::AgentHeartbeat,
            Self::AgentError { .. } => Topic::AgentError,
            Self::AgentStatusChanged { .. } => Topic::AgentStatusChanged,
            Self::AgentProcessExit { .. } => Topic::AgentProcessExit,
            Self::TaskCreated { .. } => Topic::TaskCreated,
            Self::TaskAssigned { .. } => Topic::TaskAssigned,
            Self::TaskStarted { .. } => Topic::TaskStarted,
            Self::TaskCompleted { .. } => Topic::TaskCompleted,
            Self::TaskFailed { .. } => Topic::TaskFailed,
            Self::TaskCancelled { .. } => Topic::TaskCancelled,
            Self::ResourceUsage { .. } => Topic::ResourceUsage,
            Self::SwarmMetricsUpdate { .. } => Topic::SwarmMetricsUpdate,
            Self::PoolCreated { .. } => Topic::PoolCreated,
            Self::PoolScaled { .. } => Topic::PoolScaled,
            Self::AlertCreated { .. } => Topic::AlertCreated,
            Self::AlertResolved { .. } => Topic::AlertResolved,
            Self::AlertAcknowledged { .. } => Topic::AlertAcknowledged,
            Self::SystemReady => Topic::SystemReady,
            Self::SystemShutdown { .. } => Topic::SystemShutdown,
            Self::SystemError { .. } => Topic::SystemError,
            Self::DeadlockDetected { .. } => Topic::DeadlockDetected,
        }
    }
}

//─────────────────────────────
//  Bus
//─────────────────────────────

/// Per-topic emission bookkeeping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TopicStats {
    /// Events emitted on the topic so far.
    pub count: u64,
    /// Timestamp of the most recent emission.
    pub last_emitted: DateTime<Utc>,
}

/// Error returned by bounded waits.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The timeout elapsed before a matching event arrived.
    #[error("timed out after {0:?} waiting for event")]
    Elapsed(Duration),
    /// The bus was dropped while waiting.
    #[error("event bus closed while waiting")]
    Closed,
}

/// Identifier of a registered handler, used to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&SwarmEvent) -> anyhow::Result<()> + Send + Sync>;

struct HandlerEntry {
    id: HandlerId,
    once: bool,
    handler: Handler,
}

/// In-process typed event bus.
///
/// Cheap to clone; all clones share the same channel, handlers, and
/// counters.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    tx: broadcast::Sender<SwarmEvent>,
    handlers: Mutex<HashMap<Topic, Vec<HandlerEntry>>>,
    stats: DashMap<Topic, TopicStats>,
    next_handler_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.inner.tx.receiver_count())
            .field("topics_seen", &self.inner.stats.len())
            .finish()
    }
}

impl EventBus {
    /// Create a bus with the given broadcast ring-buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                tx,
                handlers: Mutex::new(HashMap::new()),
                stats: DashMap::new(),
                next_handler_id: AtomicU64::new(1),
            }),
        }
    }

    /// Publish an event: bump the topic counter, run registered handlers in
    /// registration order, then broadcast to subscribers. Lagging
    /// subscribers may miss events; that is not an error.
    pub fn emit(&self, event: SwarmEvent) {
        let topic = event.topic();
        {
            let mut entry = self.inner.stats.entry(topic).or_insert(TopicStats {
                count: 0,
                last_emitted: Utc::now(),
            });
            entry.count += 1;
            entry.last_emitted = Utc::now();
        }

        self.run_handlers(topic, &event);

        let _ = self.inner.tx.send(event);
    }

    fn run_handlers(&self, topic: Topic, event: &SwarmEvent) {
        // Clone the handler list out of the lock so a handler may register
        // or unregister without deadlocking.
        let handlers: Vec<(HandlerId, bool, Handler)> = {
            let registry = self
                .inner
                .handlers
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            registry
                .get(&topic)
                .map(|entries| {
                    entries
                        .iter()
                        .map(|e| (e.id, e.once, Arc::clone(&e.handler)))
                        .collect()
                })
                .unwrap_or_default()
        };

        for (id, once, handler) in handlers {
            if let Err(err) = handler(event) {
                error!(topic = %topic, error = %err, "event handler failed");
                // Surface the failure without recursing into failing
                // system-error handlers.
                if topic != Topic::SystemError {
                    self.emit(SwarmEvent::SystemError {
                        component: "event-bus".to_string(),
                        error: format!("handler on '{topic}' failed: {err}"),
                    });
                }
            }
            if once {
                self.off(topic, id);
            }
        }
    }

    /// Subscribe to the live broadcast stream of every event.
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.inner.tx.subscribe()
    }

    /// Register a handler invoked for every event on `topic`, in
    /// registration order. Returns an id usable with [`EventBus::off`].
    pub fn on<F>(&self, topic: Topic, handler: F) -> HandlerId
    where
        F: Fn(&SwarmEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(topic, false, Arc::new(handler))
    }

    /// Register a handler that fires at most once, then unregisters itself.
    pub fn once<F>(&self, topic: Topic, handler: F) -> HandlerId
    where
        F: Fn(&SwarmEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(topic, true, Arc::new(handler))
    }

    /// Register a handler invoked only for events on `topic` that satisfy
    /// `predicate`.
    pub fn on_filtered<P, F>(&self, topic: Topic, predicate: P, handler: F) -> HandlerId
    where
        P: Fn(&SwarmEvent) -> bool + Send + Sync + 'static,
        F: Fn(&SwarmEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(
            topic,
            false,
            Arc::new(move |event: &SwarmEvent| {
                if predicate(event) {
                    handler(event)
                } else {
                    Ok(())
                }
            }),
        )
    }

    fn register(&self, topic: Topic, once: bool, handler: Handler) -> HandlerId {
        let id = HandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed));
        let mut registry = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        registry
            .entry(topic)
            .or_default()
            .push(HandlerEntry { id, once, handler });
        id
    }

    /// Unregister a handler. Unknown ids are ignored.
    pub fn off(&self, topic: Topic, id: HandlerId) {
        let mut registry = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(entries) = registry.get_mut(&topic) {
            entries.retain(|e| e.id != id);
        }
    }

    /// Wait until an event arrives on `topic`, bounded by `timeout`.
    pub async fn wait_for(&self, topic: Topic, timeout: Duration) -> Result<SwarmEvent, WaitError> {
        self.wait_for_matching(timeout, move |event| event.topic() == topic)
            .await
    }

    /// Wait until an event satisfying `predicate` arrives, bounded by
    /// `timeout`.
    pub async fn wait_for_matching<P>(
        &self,
        timeout: Duration,
        predicate: P,
    ) -> Result<SwarmEvent, WaitError>
    where
        P: Fn(&SwarmEvent) -> bool,
    {
        let mut rx = self.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(WaitError::Elapsed(timeout));
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(event)) if predicate(&event) => return Ok(event),
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                    warn!(missed, "wait_for subscriber lagged, events dropped");
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(WaitError::Closed),
                Err(_) => return Err(WaitError::Elapsed(timeout)),
            }
        }
    }

    /// Emission stats for a topic, if anything was ever published on it.
    pub fn topic_stats(&self, topic: Topic) -> Option<TopicStats> {
        self.inner.stats.get(&topic).map(|s| *s)
    }

    /// Number of live broadcast subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }
}
