//! Durable half of the agent-managed schedule: a flat JSON array written
//! atomically, the same temp-file-then-rename technique every other
//! `pending`/`sessions` store in this crate uses.

use super::model::AgentJob;
use crate::fsutil;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub struct ScheduleStore {
    path: PathBuf,
}

impl ScheduleStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self { path: data_dir.into().join("schedules.json") }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> std::io::Result<Vec<AgentJob>> {
        Ok(fsutil::read_json(&self.path).await?.unwrap_or_default())
    }

    pub async fn save(&self, jobs: &[AgentJob]) -> std::io::Result<()> {
        fsutil::write_json_atomic(&self.path, &jobs.to_vec()).await
    }

    /// Appends `job`; the caller must only call this once the job has
    /// already started successfully.
    pub async fn insert(&self, job: AgentJob) -> std::io::Result<()> {
        let mut jobs = self.load().await?;
        jobs.push(job);
        self.save(&jobs).await
    }

    /// Removes a job by id. Returns whether it existed.
    pub async fn remove(&self, id: Uuid) -> std::io::Result<bool> {
        let mut jobs = self.load().await?;
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        let removed = jobs.len() != before;
        if removed {
            self.save(&jobs).await?;
        }
        Ok(removed)
    }

    pub async fn mark_fired(&self, id: Uuid, at: chrono::DateTime<chrono::Utc>) -> std::io::Result<()> {
        let mut jobs = self.load().await?;
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            job.last_fired_at = Some(at);
            self.save(&jobs).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::new(dir.path());
        assert!(store.load().await.unwrap().is_empty());

        let job = AgentJob::new("u1", "c1", "console", "0 9 * * *", "good morning", "UTC");
        let id = job.id;
        store.insert(job).await.unwrap();
        assert_eq!(store.load().await.unwrap().len(), 1);

        assert!(store.remove(id).await.unwrap());
        assert!(store.load().await.unwrap().is_empty());
        assert!(!store.remove(id).await.unwrap());
    }
}
