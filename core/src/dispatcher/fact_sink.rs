//! Composes the archival-memory write with projection-trigger evaluation.
//!
//! Workers and the reflection pass both communicate solely by inserting one
//! fact through [`FactSink`]; wrapping the raw [`VectorStore`] in this type
//! is what actually makes `trigger_on_fact` projections fire and re-enter
//! the conversation as a synthetic message.

use crate::memory::{FactSink, VectorStore};
use crate::projections::{Embedder, ProjectionStore};
use crate::queue::{scheduler_message, MessageQueue};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::warn;

const TRIGGER_SIMILARITY_THRESHOLD: f32 = 0.75;

pub struct TriggeringFactSink {
    memory: Arc<VectorStore>,
    projections: Arc<ProjectionStore>,
    embedder: Option<Arc<dyn Embedder>>,
    queue: Arc<OnceCell<Arc<MessageQueue>>>,
    user_id: String,
    channel_id: String,
    platform: String,
}

impl TriggeringFactSink {
    pub fn new(
        memory: Arc<VectorStore>,
        projections: Arc<ProjectionStore>,
        embedder: Option<Arc<dyn Embedder>>,
        queue: Arc<OnceCell<Arc<MessageQueue>>>,
        user_id: impl Into<String>,
        channel_id: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        Self {
            memory,
            projections,
            embedder,
            queue,
            user_id: user_id.into(),
            channel_id: channel_id.into(),
            platform: platform.into(),
        }
    }
}

#[async_trait::async_trait]
impl FactSink for TriggeringFactSink {
    async fn record(&self, content: &str) -> anyhow::Result<()> {
        self.memory.add_memory(content).await?;

        let activated = self
            .projections
            .check_triggers(content, self.embedder.as_deref(), TRIGGER_SIMILARITY_THRESHOLD)
            .await?;
        if activated.is_empty() {
            return Ok(());
        }
        let Some(queue) = self.queue.get() else {
            warn!(
                user_id = %self.user_id,
                count = activated.len(),
                "projection trigger fired before the message queue was attached; dropping activation(s)"
            );
            return Ok(());
        };
        for projection in activated {
            let text = format!("[projection triggered] {}", projection.summary);
            queue.enqueue(scheduler_message(&self.channel_id, &self.user_id, text, &self.platform));
        }
        Ok(())
    }
}
