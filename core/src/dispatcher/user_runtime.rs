//! Per-user working set: the durable projection store, the archival vector
//! store, and the worker runtime built on top of both. Opened lazily on a
//! user's first turn and cached for the rest of the process lifetime.

use super::fact_sink::TriggeringFactSink;
use crate::config::WorkersConfig;
use crate::llm::LlmClient;
use crate::memory::{FactSink, VectorStore};
use crate::projections::{Embedder, ProjectionStore};
use crate::queue::MessageQueue;
use crate::workers::{WorkerRegistry, WorkerRuntime};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::OnceCell;

pub struct UserRuntime {
    pub projections: Arc<ProjectionStore>,
    pub memory: Arc<VectorStore>,
    pub workers: Arc<WorkerRuntime>,
}

impl UserRuntime {
    /// `users/<userId>/memory.db` holds the structured projection store
    /// (rusqlite); the archival vector store lives alongside it in its own
    /// lancedb directory since the two storage engines can't share one file
    /// despite the filesystem layout's informal "memory.db" shorthand.
    pub async fn open(
        data_dir: &Path,
        user_id: &str,
        channel_id: &str,
        platform: &str,
        workers_llm: Arc<LlmClient>,
        workers_config: WorkersConfig,
        queue: Arc<OnceCell<Arc<MessageQueue>>>,
    ) -> anyhow::Result<Self> {
        let user_dir = data_dir.join("users").join(user_id);
        tokio::fs::create_dir_all(&user_dir).await?;

        let projections = Arc::new(ProjectionStore::open(&user_dir.join("memory.db")).await?);
        let vector_path = user_dir.join("vectors");
        let vector_path_str = vector_path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("non-utf8 data_dir path"))?;
        let memory = Arc::new(VectorStore::new(vector_path_str).await?);

        let embedder: Arc<dyn Embedder> = memory.clone();
        let fact_sink: Arc<dyn FactSink> = Arc::new(TriggeringFactSink::new(
            memory.clone(),
            projections.clone(),
            Some(embedder),
            queue,
            user_id,
            channel_id,
            platform,
        ));

        let registry = Arc::new(WorkerRegistry::new());
        let workers = Arc::new(WorkerRuntime::new(
            registry,
            workers_llm,
            fact_sink,
            data_dir.to_path_buf(),
            workers_config,
            user_id,
        ));

        Ok(Self { projections, memory, workers })
    }
}
