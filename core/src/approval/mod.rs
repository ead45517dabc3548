//! Per-tool capability gate: `safe` tools run unconditionally, `elevated`
//! tools check a per-user trust store and otherwise register a pending
//! approval the dispatcher resolves from the user's next message.

mod store;

pub use store::{PendingApproval, TrustDecision, TrustStore};

use crate::tool::Capability;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalVerdict {
    /// Tool may run.
    Allowed,
    /// Tool is elevated and not yet trusted; a pending entry was registered.
    PendingApproval,
}

/// Shared across the dispatcher and every session: one trust store per user,
/// plus the set of tool invocations currently awaiting a reply.
pub struct ApprovalGate {
    trust: Arc<DashMap<String, TrustStore>>,
    pending: Arc<DashMap<String, PendingApproval>>,
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self {
            trust: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Seeds every user's trust store with operator pre-approved tool names
    /// (the `trust.approved_tools` config key).
    pub fn preapprove(&self, user_id: &str, tool_names: &[String]) {
        let mut entry = self.trust.entry(user_id.to_string()).or_default();
        for name in tool_names {
            entry.set(name, TrustDecision::Always);
        }
    }

    /// Checks whether `tool_name` may run for `user_id`. Safe tools are
    /// always allowed. Elevated tools consult the trust store; if absent, a
    /// pending approval is registered and `PendingApproval` is returned.
    pub fn check(&self, user_id: &str, tool_name: &str, capability: Capability) -> ApprovalVerdict {
        if capability == Capability::Safe {
            return ApprovalVerdict::Allowed;
        }
        let decision = self
            .trust
            .get(user_id)
            .and_then(|store| store.get(tool_name));
        match decision {
            Some(TrustDecision::Always) => ApprovalVerdict::Allowed,
            Some(TrustDecision::Denied) => ApprovalVerdict::PendingApproval,
            Some(TrustDecision::Once) => {
                // Consumed: the next invocation needs a fresh grant.
                self.trust.entry(user_id.to_string()).or_default().clear(tool_name);
                ApprovalVerdict::Allowed
            }
            None => {
                self.pending.insert(
                    user_id.to_string(),
                    PendingApproval {
                        tool_name: tool_name.to_string(),
                        requested_at: chrono::Utc::now(),
                    },
                );
                ApprovalVerdict::PendingApproval
            }
        }
    }

    pub fn pending_for(&self, user_id: &str) -> Option<PendingApproval> {
        self.pending.get(user_id).map(|p| p.clone())
    }

    fn trust_path(data_dir: &Path, user_id: &str) -> std::path::PathBuf {
        data_dir.join("users").join(user_id).join("trust.json")
    }

    /// Loads a user's persisted `always`/`denied` grants from
    /// `users/<userId>/trust.json`, if present. Called once before that
    /// user's first tool check so a restart doesn't re-prompt for
    /// previously-trusted tools.
    pub async fn load_persisted(&self, data_dir: &Path, user_id: &str) -> std::io::Result<()> {
        if let Some(store) = crate::fsutil::read_json::<TrustStore>(&Self::trust_path(data_dir, user_id)).await? {
            self.trust.insert(user_id.to_string(), store);
        }
        Ok(())
    }

    /// Snapshots this user's current trust store to disk. Cheap enough to
    /// call after every `resolve_from_text` that actually recorded a
    /// decision -- `always` grants are the only ones that matter across a
    /// restart, but writing the whole map is simpler than filtering.
    pub async fn persist(&self, data_dir: &Path, user_id: &str) -> std::io::Result<()> {
        if let Some(store) = self.trust.get(user_id) {
            crate::fsutil::write_json_atomic(&Self::trust_path(data_dir, user_id), &*store).await?;
        }
        Ok(())
    }

    /// Scans `text` for an approval keyword ("yes"/"always"/"no") and, if a
    /// pending approval exists for this user, resolves it. Returns whether a
    /// pending approval was consumed so the caller can suppress a normal
    /// agent turn and retry the tool instead.
    pub fn resolve_from_text(&self, user_id: &str, text: &str) -> bool {
        let Some((_, pending)) = self.pending.remove(user_id) else {
            return false;
        };
        let normalized = text.trim().to_lowercase();
        let decision = match normalized.as_str() {
            "yes" | "y" | "approve" | "allow" => Some(TrustDecision::Once),
            "always" | "always allow" | "trust" => Some(TrustDecision::Always),
            "no" | "n" | "deny" | "never" => Some(TrustDecision::Denied),
            _ => None,
        };
        match decision {
            Some(d) => {
                self.trust
                    .entry(user_id.to_string())
                    .or_default()
                    .set(&pending.tool_name, d);
                true
            }
            None => {
                // Not a recognized keyword: put the pending entry back so
                // the next message still gets a chance to resolve it.
                self.pending.insert(user_id.to_string(), pending);
                false
            }
        }
    }
}
