//! Loopback implementations of the external collaborator ports.
//!
//! Real deployments inject their own terminal, coordination, and MCP
//! implementations. These loopbacks allocate ids without touching the
//! outside world and are good enough for tests, demos, and single-process
//! runs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use apiary_types::ports::{CoordinationBackend, McpServer, TerminalBackend};
use apiary_types::TerminalId;

/// Terminal backend that hands out ids without spawning anything.
#[derive(Debug, Default)]
pub struct LoopbackTerminalBackend {
    spawned: AtomicUsize,
    released: AtomicUsize,
}

impl LoopbackTerminalBackend {
    /// Create a loopback backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Terminals handed out so far.
    pub fn spawned_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Terminals released so far.
    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TerminalBackend for LoopbackTerminalBackend {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn spawn_terminal(&self, shell: Option<&str>) -> Result<TerminalId> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        debug!(?shell, "loopback terminal allocated");
        Ok(TerminalId::new())
    }

    async fn release_terminal(&self, _terminal_id: TerminalId) -> Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Coordination backend with no cross-process state.
#[derive(Debug, Default)]
pub struct LoopbackCoordination;

#[async_trait]
impl CoordinationBackend for LoopbackCoordination {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// MCP server stub that only tracks whether it is running.
#[derive(Debug, Default)]
pub struct LoopbackMcpServer {
    running: AtomicBool,
}

impl LoopbackMcpServer {
    /// Create a stopped server stub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `start` has been called without a matching `stop`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl McpServer for LoopbackMcpServer {
    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}
