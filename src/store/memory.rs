//! Exact brute-force store kept in process memory.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use super::{ArticleRecord, NewArticle, VectorStore};
use crate::vector::Embedding;

/// In-memory [`VectorStore`] with an exact k-NN scan.
///
/// Suitable for small collections, dry runs, and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<BTreeMap<String, ArticleRecord>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.rows.read().map(|rows| rows.len()).unwrap_or(0)
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn upsert_page(&self, articles: &[NewArticle]) -> Result<()> {
        let now = Utc::now();
        let mut rows = self
            .rows
            .write()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        for article in articles {
            rows.insert(
                article.id.clone(),
                ArticleRecord {
                    id: article.id.clone(),
                    title: article.title.clone(),
                    normalized_text: article.normalized_text.clone(),
                    embedding: article.embedding.clone(),
                    updated_at: now,
                },
            );
        }
        Ok(())
    }

    async fn nearest(
        &self,
        vector: &Embedding,
        exclude_id: &str,
        k: usize,
    ) -> Result<Vec<String>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let rows = self
            .rows
            .read()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        let mut scored: Vec<(f64, &str)> = rows
            .values()
            .filter(|row| row.id != exclude_id)
            .map(|row| (vector.cosine_distance(&row.embedding), row.id.as_str()))
            .collect();
        scored.sort_by(|a, b| match a.0.total_cmp(&b.0) {
            Ordering::Equal => a.1.cmp(b.1),
            other => other,
        });
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(_, id)| id.to_string())
            .collect())
    }

    async fn fetch(&self, id: &str) -> Result<Option<ArticleRecord>> {
        let rows = self
            .rows
            .read()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(rows.get(id).cloned())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let rows = self
            .rows
            .read()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(rows.keys().cloned().collect())
    }
}
