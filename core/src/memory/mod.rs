pub mod core_memory;
pub mod store;

pub use core_memory::CoreMemoryStore;
pub use store::VectorStore;

use crate::projections::Embedder;

/// The archival-memory seam workers and the reflection pass write facts
/// through. A worker's completion, timeout, or cancellation is communicated
/// to the rest of the runtime solely by inserting one fact here -- whatever
/// downstream projection is watching for it picks it up via
/// `ProjectionStore::check_triggers` the next time a fact lands.
#[async_trait::async_trait]
pub trait FactSink: Send + Sync {
    async fn record(&self, content: &str) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl FactSink for VectorStore {
    async fn record(&self, content: &str) -> anyhow::Result<()> {
        self.add_memory(content).await
    }
}

/// The same FastEmbed model that indexes facts also drives
/// `ProjectionStore::check_triggers`'s semantic-similarity pass, so trigger
/// matching and archival search agree on what "similar" means.
#[async_trait::async_trait]
impl Embedder for VectorStore {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.embed_text(text).await
    }
}
