//! Per-user map of tool name -> trust decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustDecision {
    /// Allow exactly the pending invocation, then forget.
    Once,
    /// Allow this tool for this user from now on.
    Always,
    Denied,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustStore {
    entries: HashMap<String, TrustDecision>,
}

impl TrustStore {
    pub fn get(&self, tool_name: &str) -> Option<TrustDecision> {
        self.entries.get(tool_name).copied()
    }

    pub fn set(&mut self, tool_name: &str, decision: TrustDecision) {
        self.entries.insert(tool_name.to_string(), decision);
    }

    pub fn clear(&mut self, tool_name: &str) {
        self.entries.remove(tool_name);
    }
}

#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub tool_name: String,
    pub requested_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn once_decision_is_not_retained_by_the_caller() {
        let mut store = TrustStore::default();
        store.set("fetch_url", TrustDecision::Once);
        assert_eq!(store.get("fetch_url"), Some(TrustDecision::Once));
        store.clear("fetch_url");
        assert_eq!(store.get("fetch_url"), None);
    }

    #[test]
    fn always_decision_persists() {
        let mut store = TrustStore::default();
        store.set("fetch_url", TrustDecision::Always);
        assert_eq!(store.get("fetch_url"), Some(TrustDecision::Always));
    }
}
