//! Persistence of article embeddings and nearest-neighbor lookup.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::vector::Embedding;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgVectorStore, TableName};

/// Values written for one article; `updated_at` is stamped by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewArticle {
    /// External content identifier.
    pub id: String,
    /// Article title, `None` when the CMS had none.
    pub title: Option<String>,
    /// Canonical text the embedding was computed from.
    pub normalized_text: String,
    /// Model embedding of `normalized_text`.
    pub embedding: Embedding,
}

/// Persisted article row.
#[derive(Debug, Clone, PartialEq)]
pub struct ArticleRecord {
    /// External content identifier (primary key).
    pub id: String,
    /// Article title.
    pub title: Option<String>,
    /// Canonical text.
    pub normalized_text: String,
    /// Stored embedding.
    pub embedding: Embedding,
    /// Time of the last write.
    pub updated_at: DateTime<Utc>,
}

/// Storage contract used by the relation updater.
///
/// Writes are upserts keyed on `id`: a second write for the same id replaces
/// the row (last commit wins) and never creates a duplicate.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Upserts a whole page of articles in one commit.
    async fn upsert_page(&self, articles: &[NewArticle]) -> Result<()>;

    /// Upserts a single article.
    async fn upsert(&self, article: &NewArticle) -> Result<()> {
        self.upsert_page(std::slice::from_ref(article)).await
    }

    /// Up to `k` ids ordered by ascending cosine distance to `vector`, then by
    /// id; `exclude_id` is never returned.
    async fn nearest(&self, vector: &Embedding, exclude_id: &str, k: usize)
        -> Result<Vec<String>>;

    /// Loads one record.
    async fn fetch(&self, id: &str) -> Result<Option<ArticleRecord>>;

    /// Every stored id, in ascending order.
    async fn list_ids(&self) -> Result<Vec<String>>;
}
