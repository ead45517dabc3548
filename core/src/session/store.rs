//! Persistence for the opaque per-user session transcript.
//!
//! The filesystem layout calls `sessions/<userId>/` "opaque to core; managed
//! by SDK collaborator" -- the concrete format is an external concern. This
//! module supplies the default JSON-on-disk implementation behind a small
//! trait so a different SDK-backed store can be swapped in without touching
//! [`SessionManager`](super::manager::SessionManager).

use crate::llm::chat::ChatMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub messages: Vec<ChatMessage>,
    pub model: String,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, user_id: &str) -> anyhow::Result<Option<StoredSession>>;
    async fn save(&self, user_id: &str, session: &StoredSession) -> anyhow::Result<()>;
    /// Renames the corrupt session directory aside (`-corrupt-<ts>`) so the
    /// caller can start fresh without losing the evidence.
    async fn quarantine(&self, user_id: &str) -> anyhow::Result<()>;
    async fn delete(&self, user_id: &str) -> anyhow::Result<()>;
}

pub struct FileSessionStore {
    sessions_dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { sessions_dir: data_dir.into().join("sessions") }
    }

    fn user_dir(&self, user_id: &str) -> PathBuf {
        self.sessions_dir.join(user_id)
    }

    fn transcript_path(&self, user_id: &str) -> PathBuf {
        self.user_dir(user_id).join("transcript.json")
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, user_id: &str) -> anyhow::Result<Option<StoredSession>> {
        Ok(crate::fsutil::read_json(&self.transcript_path(user_id)).await?)
    }

    async fn save(&self, user_id: &str, session: &StoredSession) -> anyhow::Result<()> {
        crate::fsutil::write_json_atomic(&self.transcript_path(user_id), session).await?;
        Ok(())
    }

    async fn quarantine(&self, user_id: &str) -> anyhow::Result<()> {
        let dir = self.user_dir(user_id);
        if tokio::fs::try_exists(&dir).await? {
            let quarantined = self
                .sessions_dir
                .join(format!("{user_id}-corrupt-{}", chrono::Utc::now().format("%Y%m%d%H%M%S")));
            tokio::fs::rename(&dir, &quarantined).await?;
        }
        Ok(())
    }

    async fn delete(&self, user_id: &str) -> anyhow::Result<()> {
        let dir = self.user_dir(user_id);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}
