use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::decision::MAX_THREAT_SCORE;

/// Where a tenant came from. `"unknown"` marks legacy, untracked tenants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ingestion {
    #[serde(default = "unknown")]
    pub channel: String,
    #[serde(default = "unknown")]
    pub source: String,
    #[serde(default = "unknown")]
    pub timestamp: String,
}

impl Default for Ingestion {
    fn default() -> Self {
        Self {
            channel: unknown(),
            source: unknown(),
            timestamp: unknown(),
        }
    }
}

fn unknown() -> String {
    "unknown".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub approved: bool,
    #[serde(default)]
    pub approved_at: Option<String>,
    #[serde(default)]
    pub approved_by: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub has_executed: bool,
    #[serde(default)]
    pub last_execution_time: Option<String>,
}

/// Observation state reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationState {
    PendingApproval,
    Blocked,
    Cleared,
    Observed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(default)]
    pub current_threat_score: Option<u8>,
    pub state: ObservationState,
}

/// Authorization / execution lifecycle of one tenant, owned by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantState {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub ingestion: Ingestion,
    pub authorization: Authorization,
    pub execution: Execution,
    pub observation: Observation,
}

impl TenantState {
    /// Unapproved and never run: the condition that blocks every fleet run.
    pub fn is_awaiting_approval(&self) -> bool {
        !self.authorization.approved && !self.execution.has_executed
    }
}

/// Validates one loosely-typed record into a [`TenantState`].
pub fn decode_tenant_state(value: &Value) -> Result<TenantState, String> {
    let state: TenantState = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
    if state.name.trim().is_empty() {
        return Err("empty tenant name".to_string());
    }
    if let Some(score) = state.observation.current_threat_score {
        if score > MAX_THREAT_SCORE {
            return Err(format!("threat score {score} out of range"));
        }
    }
    Ok(state)
}

/// Agent-submitted candidate tenant awaiting review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxEntry {
    pub tenant: String,
    pub signed: bool,
    #[serde(default = "unknown")]
    pub timestamp: String,
    #[serde(default)]
    pub path: String,
}

impl InboxEntry {
    pub fn is_pending(&self) -> bool {
        !self.signed
    }
}

pub fn decode_inbox_entry(value: &Value) -> Result<InboxEntry, String> {
    let entry: InboxEntry = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
    if entry.tenant.trim().is_empty() {
        return Err("empty tenant".to_string());
    }
    Ok(entry)
}

/// Builds a tenant state in tests without going through JSON.
#[cfg(test)]
pub fn sample(name: &str, approved: bool, has_executed: bool) -> TenantState {
    let state = match (approved, has_executed) {
        (_, true) => ObservationState::Observed,
        (true, false) => ObservationState::Cleared,
        (false, false) => ObservationState::PendingApproval,
    };
    TenantState {
        id: name.to_string(),
        name: name.to_string(),
        ingestion: Ingestion::default(),
        authorization: Authorization {
            approved,
            approved_at: None,
            approved_by: None,
        },
        execution: Execution {
            has_executed,
            last_execution_time: None,
        },
        observation: Observation {
            current_threat_score: None,
            state,
        },
    }
}
