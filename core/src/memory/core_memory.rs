//! The small, hand-curated memory block surfaced in every system prompt and
//! dumped verbatim by the `/memory` command -- distinct from the archival
//! fact store in [`super::store`], which is searched rather than read whole.

use std::path::PathBuf;

pub struct CoreMemoryStore {
    users_dir: PathBuf,
}

impl CoreMemoryStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { users_dir: data_dir.into().join("users") }
    }

    fn path(&self, user_id: &str) -> PathBuf {
        self.users_dir.join(user_id).join("core_memory.md")
    }

    pub async fn get(&self, user_id: &str) -> anyhow::Result<String> {
        match tokio::fs::read_to_string(self.path(user_id)).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn set(&self, user_id: &str, content: &str) -> anyhow::Result<()> {
        let path = self.path(user_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_core_memory_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CoreMemoryStore::new(dir.path());
        assert_eq!(store.get("alice").await.unwrap(), "");
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CoreMemoryStore::new(dir.path());
        store.set("alice", "prefers terse replies").await.unwrap();
        assert_eq!(store.get("alice").await.unwrap(), "prefers terse replies");
    }
}
