use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Array, Float32Array, FixedSizeListArray, Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use chrono::Utc;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use futures::TryStreamExt;
use lance_arrow::FixedSizeListArrayExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection, Table};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task;

const EMBEDDING_DIMS: i32 = 384;
const DEFAULT_SOURCE: &str = "fact";

/// An archival memory entry: free-text content tagged with where it came
/// from, plus the embedding LanceDB indexes it by. Insertion is what
/// `ProjectionStore::check_triggers` reacts to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: i64,
    pub content: String,
    pub source: String,
    pub created_at: i64,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl std::fmt::Display for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.source, self.content)
    }
}

pub struct VectorStore {
    conn: Connection,
    embedding_model: Arc<Mutex<TextEmbedding>>,
}

impl VectorStore {
    pub async fn new(path: &str) -> Result<Self> {
        let conn = connect(path).execute().await.context("Failed to connect to LanceDB")?;

        let cache_dir = dirs::cache_dir()
            .context("Could not find cache directory")?
            .join("mylm")
            .join("models");
        std::fs::create_dir_all(&cache_dir)?;

        // BGE-Small-EN-v1.5, 384 dims.
        let embedding_model = TextEmbedding::try_new(
            InitOptions::new(EmbeddingModel::BGESmallENV15).with_cache_dir(cache_dir),
        )
        .context("Failed to initialize FastEmbed model")?;

        Ok(Self {
            conn,
            embedding_model: Arc::new(Mutex::new(embedding_model)),
        })
    }

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("content", DataType::Utf8, false),
            Field::new("source", DataType::Utf8, false),
            Field::new("created_at", DataType::Int64, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    EMBEDDING_DIMS,
                ),
                false,
            ),
        ]))
    }

    async fn table(&self) -> Result<Table> {
        match self.conn.open_table("memories").execute().await {
            Ok(table) => Ok(table),
            Err(_) => {
                let batches = RecordBatchIterator::new(vec![], Self::schema());
                self.conn
                    .create_table("memories", Box::new(batches))
                    .execute()
                    .await
                    .context("Failed to create memories table")
            }
        }
    }

    /// Embed a single string. FastEmbed's `embed()` is synchronous and
    /// CPU-bound, so it runs on the blocking pool.
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let model = self.embedding_model.clone();
        let text = text.to_string();
        let embeddings = task::spawn_blocking(move || {
            let mut model = model.blocking_lock();
            model.embed(vec![text], None)
        })
        .await
        .context("Join error during embedding")?
        .context("Embedding failed")?;
        embeddings.into_iter().next().context("No embedding generated")
    }

    pub async fn add_memory(&self, content: &str) -> Result<()> {
        self.add_tagged(content, DEFAULT_SOURCE).await
    }

    pub async fn add_tagged(&self, content: &str, source: &str) -> Result<()> {
        let embedding = self.embed_text(content).await?;
        let id = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| Utc::now().timestamp());
        let created_at = Utc::now().timestamp();

        let schema = Self::schema();
        let id_array = Int64Array::from(vec![id]);
        let content_array = StringArray::from(vec![content]);
        let source_array = StringArray::from(vec![source]);
        let created_at_array = Int64Array::from(vec![created_at]);
        let embedding_array = FixedSizeListArray::try_new_from_values(
            Float32Array::from(embedding),
            EMBEDDING_DIMS,
        )?;

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(id_array),
                Arc::new(content_array),
                Arc::new(source_array),
                Arc::new(created_at_array),
                Arc::new(embedding_array),
            ],
        )?;

        let table = self.table().await?;
        table
            .add(Box::new(RecordBatchIterator::new(vec![Ok(batch)], schema)))
            .execute()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to add memory to LanceDB: {:#}", e))?;

        Ok(())
    }

    pub async fn search_memory(&self, query: &str, limit: usize) -> Result<Vec<Memory>> {
        let query_embedding = self.embed_text(query).await?;
        let table = self.table().await?;
        let results = table
            .query()
            .nearest_to(query_embedding)?
            .limit(limit)
            .execute()
            .await
            .context("Search query failed")?;

        let batches: Vec<RecordBatch> = results.try_collect::<Vec<_>>().await?;

        let mut memories = Vec::new();
        for batch in batches {
            let id_col = batch
                .column_by_name("id")
                .context("id column missing")?
                .as_any()
                .downcast_ref::<Int64Array>()
                .context("Failed downcast id")?;
            let content_col = batch
                .column_by_name("content")
                .context("content column missing")?
                .as_any()
                .downcast_ref::<StringArray>()
                .context("Failed downcast content")?;
            let source_col = batch
                .column_by_name("source")
                .context("source column missing")?
                .as_any()
                .downcast_ref::<StringArray>()
                .context("Failed downcast source")?;
            let created_at_col = batch
                .column_by_name("created_at")
                .context("created_at column missing")?
                .as_any()
                .downcast_ref::<Int64Array>()
                .context("Failed downcast created_at")?;

            for i in 0..batch.num_rows() {
                memories.push(Memory {
                    id: id_col.value(i),
                    content: content_col.value(i).to_string(),
                    source: source_col.value(i).to_string(),
                    created_at: created_at_col.value(i),
                    embedding: None,
                });
            }
        }

        Ok(memories)
    }
}
