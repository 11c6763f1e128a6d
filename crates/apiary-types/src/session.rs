//! Session records binding an agent to its terminal and memory bank.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AgentId, MemoryBankId, SessionId, TerminalId};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Resources bound and in use.
    Active,
    /// Bound but quiescent.
    Idle,
    /// Resources released; terminal.
    Terminated,
}

impl SessionStatus {
    /// Stable lowercase spelling used in events and persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Terminated => "terminated",
        }
    }
}

/// The triple binding one agent to one terminal and one memory bank.
///
/// Sessions reference the agent by id only; the agent manager is the sole
/// owner of agent records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session id.
    pub id: SessionId,
    /// Agent the session belongs to.
    pub agent_id: AgentId,
    /// Allocated terminal.
    pub terminal_id: TerminalId,
    /// Allocated memory bank.
    pub memory_bank_id: MemoryBankId,
    /// Current state.
    pub status: SessionStatus,
    /// When the session was created.
    pub start_time: DateTime<Utc>,
    /// When the session was terminated, if it was.
    pub end_time: Option<DateTime<Utc>>,
    /// Last observed activity.
    pub last_activity: DateTime<Utc>,
}

/// What a caller supplies when opening a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProfile {
    /// Agent to bind.
    pub agent_id: AgentId,
    /// Display name recorded alongside the session.
    pub agent_name: String,
    /// Shell or runtime requested for the terminal.
    pub shell: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_json_roundtrip_preserves_ids_and_times() {
        let session = Session {
            id: SessionId::new(),
            agent_id: AgentId::new(),
            terminal_id: TerminalId::new(),
            memory_bank_id: MemoryBankId::new(),
            status: SessionStatus::Active,
            start_time: Utc::now(),
            end_time: None,
            last_activity: Utc::now(),
        };
        let json = serde_json::to_value(&session).unwrap();
        let back: Session = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, session.id);
        assert_eq!(back.start_time, session.start_time);
        assert_eq!(back.status, SessionStatus::Active);
    }
}
