//! Traits for external collaborators.
//!
//! The control plane talks to its surroundings through these interfaces
//! only: a key-value memory store, a terminal backend, a coordination
//! service, and an MCP server. Implementations live outside the core and
//! are injected at orchestrator construction.

use anyhow::Result;
use async_trait::async_trait;

use crate::{AgentId, MemoryBankId, TerminalId};

/// Opaque-key JSON document store used for persistence.
///
/// Keys are opaque strings (`agent:{id}`, `sessions.json`, ...); values are
/// JSON documents whose schemas belong to the callers.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Bring the store up. Called once during orchestrator initialization.
    async fn initialize(&self) -> Result<()>;

    /// Tear the store down. Called once during shutdown.
    async fn shutdown(&self) -> Result<()>;

    /// Write or replace the document at `key`.
    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()>;

    /// Read the document at `key`, if present.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Delete the document at `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Allocate a memory bank scoped to one agent.
    async fn create_bank(&self, agent_id: AgentId) -> Result<MemoryBankId>;

    /// Release a previously allocated bank.
    async fn close_bank(&self, bank_id: MemoryBankId) -> Result<()>;

    /// Periodic housekeeping hook; default does nothing.
    async fn maintenance(&self) -> Result<()> {
        Ok(())
    }
}

/// Backend that allocates and releases terminals for sessions.
#[async_trait]
pub trait TerminalBackend: Send + Sync {
    /// Bring the backend up.
    async fn initialize(&self) -> Result<()>;

    /// Tear the backend down.
    async fn shutdown(&self) -> Result<()>;

    /// Allocate a terminal, optionally with a specific shell.
    async fn spawn_terminal(&self, shell: Option<&str>) -> Result<TerminalId>;

    /// Release a terminal. Releasing an unknown terminal is not an error.
    async fn release_terminal(&self, terminal_id: TerminalId) -> Result<()>;

    /// Periodic housekeeping hook; default does nothing.
    async fn maintenance(&self) -> Result<()> {
        Ok(())
    }
}

/// Cross-component coordination service (locks, leases, shared counters).
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Bring the service up.
    async fn initialize(&self) -> Result<()>;

    /// Tear the service down.
    async fn shutdown(&self) -> Result<()>;

    /// Periodic housekeeping hook; default does nothing.
    async fn maintenance(&self) -> Result<()> {
        Ok(())
    }
}

/// MCP server surface the orchestrator starts and stops.
#[async_trait]
pub trait McpServer: Send + Sync {
    /// Start serving.
    async fn start(&self) -> Result<()>;

    /// Stop serving.
    async fn stop(&self) -> Result<()>;
}
