#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **apiary-dispatch** – Priority task queue and dispatcher.
//!
//! Tasks enter a capacity-bounded priority queue and are handed to agents
//! through the capability matcher. The dispatcher drives the queue
//! whenever a task is submitted or an agent frees up, retries failed
//! tasks with exponential backoff, and resolves reported deadlocks by
//! cancelling the lowest-priority agent's tasks.
//!
//! Agent state lives in the agent manager; the dispatcher reaches it
//! through the [`AgentDirectory`] trait so the two crates stay decoupled.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use apiary_bus::{EventBus, SwarmEvent};
use apiary_capability::CapabilityMatcher;
use apiary_core::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
use apiary_types::{AgentId, AgentRecord, Task, TaskId, TaskStatus};

/// Reason recorded on tasks cancelled by deadlock resolution.
pub const DEADLOCK_CANCEL_REASON: &str = "Agent termination";

/// Ceiling on retry backoff delays.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Agent state the dispatcher needs from the agent manager.
pub trait AgentDirectory: Send + Sync {
    /// Agents able to accept one more task right now.
    fn candidates(&self) -> Vec<AgentRecord>;

    /// Record a task assignment on an agent.
    fn assign(&self, agent_id: AgentId, task_id: TaskId) -> anyhow::Result<()>;

    /// Record a task leaving an agent, successfully or not.
    fn release(&self, agent_id: AgentId, task_id: TaskId, execution_time: Duration, failed: bool);
}

/// Dispatcher tunables.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Queue capacity; submissions beyond it fail.
    pub queue_size: usize,
    /// Retries per task before terminal failure.
    pub max_retries: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_size: 100,
            max_retries: 3,
        }
    }
}

/// Errors surfaced by task submission.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The task failed structural validation.
    #[error("invalid task: {0}")]
    Validation(String),
    /// A task with this id already exists.
    #[error("task {0} already exists")]
    DuplicateTask(TaskId),
    /// The queue is at capacity.
    #[error("task queue full (capacity {capacity})")]
    QueueFull {
        /// The configured capacity.
        capacity: usize,
    },
    /// The assignment circuit breaker is open.
    #[error("task assignment unavailable, circuit open")]
    AssignmentUnavailable,
    /// The named task is unknown.
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
}

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: u8,
    seq: u64,
    task_id: TaskId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher priority first, then older submission first.
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Aggregate queue counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct DispatchStats {
    /// Tasks currently queued.
    pub queued: usize,
    /// Tasks assigned or running.
    pub in_flight: usize,
    /// Tasks completed since startup.
    pub completed: u64,
    /// Tasks terminally failed since startup.
    pub failed: u64,
    /// Tasks cancelled since startup.
    pub cancelled: u64,
}

/// The priority queue plus assignment machinery.
pub struct TaskDispatcher {
    config: DispatchConfig,
    queue: std::sync::Mutex<BinaryHeap<QueueEntry>>,
    /// Live tasks: queued, assigned, or running.
    tasks: DashMap<TaskId, Task>,
    /// Terminal tasks kept until maintenance purges them.
    history: DashMap<TaskId, Task>,
    seqs: DashMap<TaskId, u64>,
    next_seq: AtomicU64,
    counters: std::sync::Mutex<(u64, u64, u64)>,
    matcher: CapabilityMatcher,
    directory: Arc<dyn AgentDirectory>,
    bus: EventBus,
    assignment_breaker: CircuitBreaker,
    /// Serializes dispatch passes so two drivers never race on the head.
    drive_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDispatcher")
            .field("live_tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl TaskDispatcher {
    /// Create a dispatcher over the given agent directory.
    pub fn new(config: DispatchConfig, directory: Arc<dyn AgentDirectory>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue: std::sync::Mutex::new(BinaryHeap::new()),
            tasks: DashMap::new(),
            history: DashMap::new(),
            seqs: DashMap::new(),
            next_seq: AtomicU64::new(0),
            counters: std::sync::Mutex::new((0, 0, 0)),
            matcher: CapabilityMatcher::new(),
            directory,
            bus,
            assignment_breaker: CircuitBreaker::new(
                "TaskAssignment",
                CircuitBreakerConfig::new(5, Duration::from_secs(5), Duration::from_secs(20)),
            ),
            drive_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Spawn the event loop that reacts to task lifecycle and deadlock
    /// events on the bus. The handle should be aborted at shutdown.
    pub fn attach(self: &Arc<Self>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(SwarmEvent::TaskStarted { task_id, agent_id }) => {
                        dispatcher.on_task_started(task_id, agent_id);
                    }
                    Ok(SwarmEvent::TaskCompleted {
                        task_id,
                        agent_id,
                        result,
                        execution_time,
                        metrics,
                    }) => {
                        dispatcher
                            .on_task_completed(task_id, agent_id, result, execution_time, metrics)
                            .await;
                    }
                    Ok(SwarmEvent::TaskFailed { task_id, error }) => {
                        dispatcher.on_task_failed(task_id, &error).await;
                    }
                    Ok(SwarmEvent::DeadlockDetected { agents, .. }) => {
                        dispatcher.resolve_deadlock(&agents).await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "dispatcher lagged behind the event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    //─────────────────────────────
    //  Submission
    //─────────────────────────────

    /// Submit a task. Validated, enqueued (or assigned directly when the
    /// submitter pinned an agent), announced, and dispatched.
    pub async fn submit_task(&self, task: Task) -> Result<TaskId, DispatchError> {
        task.validate().map_err(DispatchError::Validation)?;
        if self.tasks.contains_key(&task.id) || self.history.contains_key(&task.id) {
            return Err(DispatchError::DuplicateTask(task.id));
        }
        if self.assignment_breaker.state() == BreakerState::Open {
            return Err(DispatchError::AssignmentUnavailable);
        }

        let task_id = task.id;

        if let Some(agent_id) = task.assigned_agent {
            // Pinned tasks skip the queue entirely.
            self.tasks.insert(task_id, task.clone());
            self.bus.emit(SwarmEvent::TaskCreated {
                task: Box::new(task),
            });
            self.assign_to(agent_id, task_id).await.map_err(|err| {
                self.tasks.remove(&task_id);
                warn!(task_id = %task_id, error = %err, "direct assignment failed");
                DispatchError::AssignmentUnavailable
            })?;
            return Ok(task_id);
        }

        {
            let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() >= self.config.queue_size {
                return Err(DispatchError::QueueFull {
                    capacity: self.config.queue_size,
                });
            }
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.seqs.insert(task_id, seq);
        self.tasks.insert(task_id, task.clone());
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push(QueueEntry {
                priority: task.priority,
                seq,
                task_id,
            });
        }
        debug!(task_id = %task_id, priority = task.priority, "task queued");
        self.bus.emit(SwarmEvent::TaskCreated {
            task: Box::new(task),
        });
        self.process_queue().await;
        Ok(task_id)
    }

    //─────────────────────────────
    //  Dispatch
    //─────────────────────────────

    /// Drain the queue while capable candidates exist. A head task with no
    /// capable agent goes back and ends the pass; tasks with unmet
    /// dependencies are skipped and re-queued after the pass.
    pub async fn process_queue(&self) {
        let _pass = self.drive_lock.lock().await;
        let mut deferred: Vec<TaskId> = Vec::new();

        loop {
            let candidates = self.directory.candidates();
            if candidates.is_empty() {
                break;
            }

            let entry = {
                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                queue.pop()
            };
            let entry = match entry {
                Some(entry) => entry,
                None => break,
            };
            let task = match self.tasks.get(&entry.task_id) {
                Some(task) => task.clone(),
                // Cancelled while queued; drop the stale entry.
                None => continue,
            };

            if !self.dependencies_met(&task) {
                deferred.push(entry.task_id);
                continue;
            }

            let best = self
                .matcher
                .find_best_agents(&task, &candidates, candidates.len())
                .into_iter()
                .find(|m| m.meets_requirements());
            let best = match best {
                Some(best) => best,
                None => {
                    debug!(task_id = %task.id, "no capable agent, task stays queued");
                    self.requeue(entry.task_id);
                    break;
                }
            };

            if let Err(err) = self.assign_to(best.agent_id, task.id).await {
                warn!(task_id = %task.id, error = %err, "assignment failed, stopping pass");
                self.requeue(entry.task_id);
                break;
            }
        }

        for task_id in deferred {
            self.requeue(task_id);
        }
    }

    async fn assign_to(&self, agent_id: AgentId, task_id: TaskId) -> anyhow::Result<()> {
        let directory = Arc::clone(&self.directory);
        self.assignment_breaker
            .call(move || async move { directory.assign(agent_id, task_id) })
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        if let Some(mut task) = self.tasks.get_mut(&task_id) {
            task.status = TaskStatus::Assigned;
            task.assigned_agent = Some(agent_id);
        }
        info!(task_id = %task_id, agent_id = %agent_id, "task assigned");
        self.bus.emit(SwarmEvent::TaskAssigned { task_id, agent_id });
        Ok(())
    }

    fn requeue(&self, task_id: TaskId) {
        let (priority, seq) = {
            let task = match self.tasks.get(&task_id) {
                Some(task) => task,
                None => return,
            };
            let seq = self.seqs.get(&task_id).map(|s| *s).unwrap_or_else(|| {
                self.next_seq.fetch_add(1, Ordering::Relaxed)
            });
            (task.priority, seq)
        };
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push(QueueEntry {
            priority,
            seq,
            task_id,
        });
    }

    fn dependencies_met(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.history
                .get(dep)
                .map(|t| t.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }

    //─────────────────────────────
    //  Lifecycle events
    //─────────────────────────────

    pub(crate) fn on_task_started(&self, task_id: TaskId, agent_id: AgentId) {
        if let Some(mut task) = self.tasks.get_mut(&task_id) {
            if task.status.can_transition_to(TaskStatus::Running) {
                task.status = TaskStatus::Running;
                task.assigned_agent = Some(agent_id);
                task.started_at = Some(Utc::now());
            }
        }
    }

    pub(crate) async fn on_task_completed(
        &self,
        task_id: TaskId,
        agent_id: AgentId,
        result: serde_json::Value,
        execution_time: Duration,
        metrics: Option<serde_json::Value>,
    ) {
        let finished = {
            match self.tasks.get_mut(&task_id) {
                Some(mut task) => {
                    task.status = TaskStatus::Completed;
                    task.completed_at = Some(Utc::now());
                    task.output = Some(result);
                    task.execution_metrics = metrics;
                    true
                }
                None => false,
            }
        };
        if !finished {
            return;
        }
        self.directory.release(agent_id, task_id, execution_time, false);
        self.move_to_history(task_id);
        {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            counters.0 += 1;
        }
        debug!(task_id = %task_id, "task completed");
        // A slot just freed up.
        self.process_queue().await;
    }

    pub(crate) async fn on_task_failed(self: &Arc<Self>, task_id: TaskId, error: &str) {
        let (agent, retry_count) = {
            match self.tasks.get(&task_id) {
                Some(task) => (task.assigned_agent, task.retry_count),
                None => return,
            }
        };
        if let Some(agent_id) = agent {
            self.directory
                .release(agent_id, task_id, Duration::ZERO, true);
        }

        if retry_count < self.config.max_retries {
            let delay = (Duration::from_secs(1) * 2u32.pow(retry_count)).min(MAX_RETRY_DELAY);
            {
                if let Some(mut task) = self.tasks.get_mut(&task_id) {
                    task.status = TaskStatus::Queued;
                    task.assigned_agent = None;
                    task.retry_count = retry_count + 1;
                    task.error = Some(error.to_string());
                }
            }
            info!(
                task_id = %task_id,
                retry = retry_count + 1,
                delay_s = delay.as_secs(),
                "task failed, scheduling retry"
            );
            let dispatcher = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                dispatcher.requeue(task_id);
                dispatcher.process_queue().await;
            });
        } else {
            {
                if let Some(mut task) = self.tasks.get_mut(&task_id) {
                    task.status = TaskStatus::Failed;
                    task.completed_at = Some(Utc::now());
                    task.error = Some(error.to_string());
                }
            }
            self.move_to_history(task_id);
            {
                let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
                counters.1 += 1;
            }
            warn!(task_id = %task_id, error, "task failed terminally, retries exhausted");
        }
    }

    /// Cancel every live task assigned to `agent_id`.
    pub async fn cancel_tasks_for_agent(&self, agent_id: AgentId, reason: &str) -> usize {
        let to_cancel: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|entry| entry.value().assigned_agent == Some(agent_id))
            .map(|entry| *entry.key())
            .collect();
        for task_id in &to_cancel {
            self.cancel_task(*task_id, reason).await;
        }
        to_cancel.len()
    }

    /// Cancel one task with a reason. Unknown or terminal tasks are a
    /// no-op.
    pub async fn cancel_task(&self, task_id: TaskId, reason: &str) {
        let agent = {
            match self.tasks.get_mut(&task_id) {
                Some(mut task) => {
                    task.status = TaskStatus::Cancelled;
                    task.completed_at = Some(Utc::now());
                    task.error = Some(reason.to_string());
                    task.assigned_agent
                }
                None => return,
            }
        };
        if let Some(agent_id) = agent {
            self.directory
                .release(agent_id, task_id, Duration::ZERO, true);
        }
        self.move_to_history(task_id);
        {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            counters.2 += 1;
        }
        info!(task_id = %task_id, reason, "task cancelled");
        self.bus.emit(SwarmEvent::TaskCancelled {
            task_id,
            reason: reason.to_string(),
        });
    }

    /// Deadlock policy: the lowest-priority participant loses all of its
    /// tasks.
    pub async fn resolve_deadlock(&self, agents: &[apiary_bus::DeadlockedAgent]) {
        let victim = agents.iter().min_by_key(|a| a.priority);
        if let Some(victim) = victim {
            warn!(agent_id = %victim.agent_id, "resolving deadlock by cancelling agent tasks");
            self.cancel_tasks_for_agent(victim.agent_id, DEADLOCK_CANCEL_REASON)
                .await;
        }
    }

    fn move_to_history(&self, task_id: TaskId) {
        if let Some((_, task)) = self.tasks.remove(&task_id) {
            self.history.insert(task_id, task);
        }
        self.seqs.remove(&task_id);
    }

    //─────────────────────────────
    //  Queries and maintenance
    //─────────────────────────────

    /// Snapshot of a task, live or historical.
    pub fn task(&self, task_id: TaskId) -> Option<Task> {
        self.tasks
            .get(&task_id)
            .map(|t| t.clone())
            .or_else(|| self.history.get(&task_id).map(|t| t.clone()))
    }

    /// Number of queued tasks.
    pub fn queue_depth(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Live tasks flagged critical, used by shutdown draining.
    pub fn critical_tasks(&self) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|entry| entry.value().is_critical())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Aggregate counters.
    pub fn stats(&self) -> DispatchStats {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        DispatchStats {
            queued: self.queue_depth(),
            in_flight: self.tasks.len().saturating_sub(self.queue_depth()),
            completed: counters.0,
            failed: counters.1,
            cancelled: counters.2,
        }
    }

    /// Purge terminal tasks older than `retention`.
    pub fn cleanup_history(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(24));
        let expired: Vec<TaskId> = self
            .history
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .completed_at
                    .map(|t| t < cutoff)
                    .unwrap_or(false)
            })
            .map(|entry| *entry.key())
            .collect();
        for task_id in &expired {
            self.history.remove(task_id);
        }
        expired.len()
    }
}
