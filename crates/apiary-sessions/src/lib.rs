#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **apiary-sessions** – Session management for the Apiary control plane.
//!
//! A session binds one agent to one terminal and one memory bank. The
//! three resources are allocated together; when any allocation fails the
//! ones already made are released best-effort before the error propagates.
//! Teardown waits are bounded so a wedged backend cannot hang shutdown.
//!
//! Sessions survive restarts through a persisted snapshot: active and
//! idle sessions are written through a circuit breaker and recreated with
//! their original ids and timestamps on restore; terminated sessions are
//! dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use apiary_core::{BreakerError, CircuitBreaker, CircuitBreakerConfig};
use apiary_types::ports::{MemoryStore, TerminalBackend};
use apiary_types::{Session, SessionId, SessionProfile, SessionStatus};

/// Key the session snapshot is persisted under.
pub const SESSIONS_KEY: &str = "sessions.json";

/// Bound on each resource release during teardown.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Batch size used when terminating every session at once.
const TERMINATE_BATCH: usize = 5;

/// Orchestrator-level task counters stored alongside the session
/// snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetrics {
    /// Tasks completed so far.
    pub completed_tasks: u64,
    /// Tasks failed so far.
    pub failed_tasks: u64,
    /// Sum of task execution time.
    pub total_task_duration: Duration,
}

/// One session plus the profile it was created from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionWithProfile {
    /// The session record.
    pub session: Session,
    /// The creation profile, kept so restores can re-allocate resources.
    pub profile: SessionProfile,
}

/// Shape of the persisted snapshot document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Persisted sessions.
    pub sessions: Vec<SessionWithProfile>,
    /// Task counters at save time.
    pub metrics: SnapshotMetrics,
    /// When the snapshot was written.
    pub saved_at: DateTime<Utc>,
}

/// Errors surfaced by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session id is unknown.
    #[error("session {0} not found")]
    NotFound(SessionId),
    /// Terminal allocation failed.
    #[error("terminal allocation failed: {0}")]
    TerminalAllocation(String),
    /// Memory bank allocation failed.
    #[error("memory bank allocation failed: {0}")]
    MemoryAllocation(String),
    /// Persisting the snapshot failed or the breaker is open.
    #[error("session persistence failed: {0}")]
    Persistence(#[from] BreakerError),
    /// The persisted snapshot could not be decoded.
    #[error("session snapshot is malformed: {0}")]
    MalformedSnapshot(String),
}

/// Binds agents to terminals and memory banks and owns the session
/// records.
pub struct SessionManager {
    sessions: DashMap<SessionId, SessionWithProfile>,
    terminal: Arc<dyn TerminalBackend>,
    memory: Arc<dyn MemoryStore>,
    persistence_breaker: CircuitBreaker,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager over the given terminal and memory backends.
    pub fn new(terminal: Arc<dyn TerminalBackend>, memory: Arc<dyn MemoryStore>) -> Self {
        Self {
            sessions: DashMap::new(),
            terminal,
            memory,
            persistence_breaker: CircuitBreaker::new(
                "SessionPersistence",
                CircuitBreakerConfig::new(5, Duration::from_secs(30), Duration::from_secs(60)),
            ),
        }
    }

    /// Open a session for `profile`: allocate a terminal, then a memory
    /// bank, then record the binding. Partial allocations are released
    /// before an error propagates.
    pub async fn create_session(&self, profile: SessionProfile) -> Result<Session, SessionError> {
        let terminal_id = self
            .terminal
            .spawn_terminal(profile.shell.as_deref())
            .await
            .map_err(|e| SessionError::TerminalAllocation(e.to_string()))?;

        let memory_bank_id = match self.memory.create_bank(profile.agent_id).await {
            Ok(bank) => bank,
            Err(err) => {
                if let Err(release_err) = self.terminal.release_terminal(terminal_id).await {
                    warn!(
                        terminal_id = %terminal_id,
                        error = %release_err,
                        "failed to release terminal after bank allocation failure"
                    );
                }
                return Err(SessionError::MemoryAllocation(err.to_string()));
            }
        };

        let session = Session {
            id: SessionId::new(),
            agent_id: profile.agent_id,
            terminal_id,
            memory_bank_id,
            status: SessionStatus::Active,
            start_time: Utc::now(),
            end_time: None,
            last_activity: Utc::now(),
        };
        info!(
            session_id = %session.id,
            agent_id = %profile.agent_id,
            "session created"
        );
        self.sessions.insert(
            session.id,
            SessionWithProfile {
                session: session.clone(),
                profile,
            },
        );
        Ok(session)
    }

    /// Terminate a session, releasing its terminal and memory bank with a
    /// bounded wait each. Misses are logged and swallowed.
    pub async fn terminate_session(&self, session_id: SessionId) -> Result<(), SessionError> {
        let (terminal_id, memory_bank_id) = {
            let entry = self
                .sessions
                .get(&session_id)
                .ok_or(SessionError::NotFound(session_id))?;
            if entry.session.status == SessionStatus::Terminated {
                return Ok(());
            }
            (entry.session.terminal_id, entry.session.memory_bank_id)
        };

        let release = tokio::time::timeout(
            TEARDOWN_TIMEOUT,
            self.terminal.release_terminal(terminal_id),
        )
        .await;
        match release {
            Ok(Err(err)) => warn!(session_id = %session_id, error = %err, "terminal release failed"),
            Err(_) => warn!(session_id = %session_id, "terminal release timed out"),
            Ok(Ok(())) => {}
        }

        let close = tokio::time::timeout(TEARDOWN_TIMEOUT, self.memory.close_bank(memory_bank_id)).await;
        match close {
            Ok(Err(err)) => warn!(session_id = %session_id, error = %err, "memory bank close failed"),
            Err(_) => warn!(session_id = %session_id, "memory bank close timed out"),
            Ok(Ok(())) => {}
        }

        if let Some(mut entry) = self.sessions.get_mut(&session_id) {
            entry.session.status = SessionStatus::Terminated;
            entry.session.end_time = Some(Utc::now());
        }
        info!(session_id = %session_id, "session terminated");
        Ok(())
    }

    /// Terminate every live session in bounded batches.
    pub async fn terminate_all_sessions(&self) {
        let live: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().session.status != SessionStatus::Terminated)
            .map(|entry| *entry.key())
            .collect();
        info!(count = live.len(), "terminating all sessions");
        for batch in live.chunks(TERMINATE_BATCH) {
            let futures = batch.iter().map(|id| self.terminate_session(*id));
            for result in join_all(futures).await {
                if let Err(err) = result {
                    warn!(error = %err, "session termination failed during drain");
                }
            }
        }
    }

    /// Persist active and idle sessions plus the given counters. Writes go
    /// through the persistence circuit breaker and fail fast while it is
    /// open.
    pub async fn persist_sessions(&self, metrics: SnapshotMetrics) -> Result<(), SessionError> {
        let snapshot = SessionSnapshot {
            sessions: self
                .sessions
                .iter()
                .filter(|entry| entry.value().session.status != SessionStatus::Terminated)
                .map(|entry| entry.value().clone())
                .collect(),
            metrics,
            saved_at: Utc::now(),
        };
        let document = serde_json::to_value(&snapshot)
            .map_err(|e| SessionError::MalformedSnapshot(e.to_string()))?;

        let memory = Arc::clone(&self.memory);
        self.persistence_breaker
            .call(move || async move { memory.put(SESSIONS_KEY, document).await })
            .await?;
        debug!(sessions = snapshot.sessions.len(), "session snapshot persisted");
        Ok(())
    }

    /// Restore sessions from the persisted snapshot, preserving their ids
    /// and timestamps and re-allocating terminals and banks. A missing
    /// snapshot restores nothing; per-session allocation failures skip
    /// that session. Returns the restored count.
    pub async fn restore_sessions(&self) -> Result<usize, SessionError> {
        let document = match self.memory.get(SESSIONS_KEY).await {
            Ok(Some(document)) => document,
            Ok(None) => return Ok(0),
            Err(err) => {
                // Treat unreadable snapshots like missing ones; a restart
                // must not be blocked by stale persistence.
                warn!(error = %err, "session snapshot unavailable, starting empty");
                return Ok(0);
            }
        };
        let snapshot: SessionSnapshot = serde_json::from_value(document)
            .map_err(|e| SessionError::MalformedSnapshot(e.to_string()))?;

        let mut restored = 0usize;
        for entry in snapshot.sessions {
            if entry.session.status == SessionStatus::Terminated {
                continue;
            }
            let terminal_id = match self
                .terminal
                .spawn_terminal(entry.profile.shell.as_deref())
                .await
            {
                Ok(id) => id,
                Err(err) => {
                    warn!(
                        session_id = %entry.session.id,
                        error = %err,
                        "skipping session restore, terminal allocation failed"
                    );
                    continue;
                }
            };
            let memory_bank_id = match self.memory.create_bank(entry.profile.agent_id).await {
                Ok(id) => id,
                Err(err) => {
                    warn!(
                        session_id = %entry.session.id,
                        error = %err,
                        "skipping session restore, bank allocation failed"
                    );
                    let _ = self.terminal.release_terminal(terminal_id).await;
                    continue;
                }
            };
            let mut session = entry.session.clone();
            session.terminal_id = terminal_id;
            session.memory_bank_id = memory_bank_id;
            self.sessions.insert(
                session.id,
                SessionWithProfile {
                    session,
                    profile: entry.profile,
                },
            );
            restored += 1;
        }
        info!(restored, "sessions restored from snapshot");
        Ok(restored)
    }

    /// Purge terminated sessions older than `retention`.
    pub fn cleanup_terminated(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(1));
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                let session = &entry.value().session;
                session.status == SessionStatus::Terminated
                    && session.end_time.map(|t| t < cutoff).unwrap_or(false)
            })
            .map(|entry| *entry.key())
            .collect();
        for id in &expired {
            self.sessions.remove(id);
        }
        expired.len()
    }

    /// Record activity on a session, refreshing its timestamp.
    pub fn touch(&self, session_id: SessionId) {
        if let Some(mut entry) = self.sessions.get_mut(&session_id) {
            entry.session.last_activity = Utc::now();
        }
    }

    /// Snapshot of one session.
    pub fn session(&self, session_id: SessionId) -> Option<Session> {
        self.sessions.get(&session_id).map(|e| e.session.clone())
    }

    /// Snapshots of every session, terminated included.
    pub fn list_sessions(&self) -> Vec<Session> {
        self.sessions
            .iter()
            .map(|entry| entry.value().session.clone())
            .collect()
    }

    /// Sessions not yet terminated.
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().session.status != SessionStatus::Terminated)
            .count()
    }
}
