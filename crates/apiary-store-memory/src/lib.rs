#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **apiary-store-memory** – In-memory memory-store driver.
//!
//! A fast, non-persistent [`MemoryStore`] implementation suitable for
//! testing, development, and single-process deployments where durability
//! is not required. All documents and banks are lost when the process
//! terminates.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

use apiary_types::ports::MemoryStore;
use apiary_types::{AgentId, MemoryBankId};

/// An in-memory, non-persistent document store with bank allocation.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    documents: DashMap<String, serde_json::Value>,
    banks: DashMap<MemoryBankId, AgentId>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// Number of open banks.
    pub fn bank_count(&self) -> usize {
        self.banks.len()
    }

    /// Stored keys, for diagnostics.
    pub fn keys(&self) -> HashSet<String> {
        self.documents.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        self.documents.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.documents.get(key).map(|v| v.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.documents.remove(key);
        Ok(())
    }

    async fn create_bank(&self, agent_id: AgentId) -> Result<MemoryBankId> {
        let bank_id = MemoryBankId::new();
        self.banks.insert(bank_id, agent_id);
        Ok(bank_id)
    }

    async fn close_bank(&self, bank_id: MemoryBankId) -> Result<()> {
        self.banks.remove(&bank_id);
        Ok(())
    }
}
