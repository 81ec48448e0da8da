//! Relation graph maintenance: single-article processing, one-hop propagation,
//! and full-collection rebuild.
//!
//! Data flows content store → normalizer → embedder → vector store (write) →
//! vector store (neighbor query) → content store (relation patch). Sweeps are
//! skip-and-continue: one failing id is logged and reported, never fatal to
//! the rest of the sweep.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::cms::{ContentStore, ListQuery};
use crate::content::{ContentItem, REQUESTED_FIELDS};
use crate::embedder::Embedder;
use crate::normalizer::{ArticleHints, TextNormalizer};
use crate::store::{NewArticle, VectorStore};
use crate::vector::Embedding;

/// Neighbors written to each article's relation field.
pub const DEFAULT_NEIGHBORS: usize = 4;

/// Items requested per listing call during a rebuild.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Tunables for [`RelationUpdater`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdaterSettings {
    /// `k` of the nearest-neighbor query.
    pub neighbors: usize,
    /// Rebuild listing page size.
    pub page_size: usize,
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            neighbors: DEFAULT_NEIGHBORS,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// One id a sweep could not finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepFailure {
    /// Content id.
    pub id: String,
    /// Rendered error chain.
    pub error: String,
}

impl SweepFailure {
    fn new(id: &str, err: &anyhow::Error) -> Self {
        Self {
            id: id.to_string(),
            error: format!("{err:#}"),
        }
    }
}

/// Outcome of a propagation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Ids whose neighbor set was recomputed (and patched when non-empty).
    pub relinked: Vec<String>,
    /// Ids that had to be normalized and embedded first.
    pub ingested: Vec<String>,
    /// Ids neither stored nor present in the content store.
    pub missing: Vec<String>,
    /// Ids that failed.
    pub failed: Vec<SweepFailure>,
}

/// Outcome of a full rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Listing pages committed in phase 1.
    pub pages: usize,
    /// Articles upserted in phase 1.
    pub ingested: usize,
    /// Articles whose relations were recomputed in phase 2.
    pub relinked: usize,
    /// Per-item failures from both phases.
    pub failed: Vec<SweepFailure>,
}

/// Result of handling one content-changed event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventOutcome {
    /// Neighbors written for the changed article.
    pub neighbors: Vec<String>,
    /// Propagation over those neighbors; empty when there were none.
    pub propagation: SweepReport,
}

/// Orchestrates normalizer, embedder, vector store, and content store.
#[derive(Clone)]
pub struct RelationUpdater {
    content: Arc<dyn ContentStore>,
    store: Arc<dyn VectorStore>,
    normalizer: TextNormalizer,
    embedder: Arc<dyn Embedder>,
    settings: UpdaterSettings,
}

impl RelationUpdater {
    /// Wires the collaborators together.
    pub fn new(
        content: Arc<dyn ContentStore>,
        store: Arc<dyn VectorStore>,
        normalizer: TextNormalizer,
        embedder: Arc<dyn Embedder>,
        settings: UpdaterSettings,
    ) -> Self {
        Self {
            content,
            store,
            normalizer,
            embedder,
            settings: UpdaterSettings {
                neighbors: settings.neighbors,
                page_size: settings.page_size.max(1),
            },
        }
    }

    /// Active settings.
    pub fn settings(&self) -> UpdaterSettings {
        self.settings
    }

    /// ProcessOne followed by PropagateUpdate when neighbors were found.
    pub async fn handle_event(&self, endpoint: &str, content_id: &str) -> Result<EventOutcome> {
        let neighbors = self.process_one(endpoint, content_id).await?;
        let propagation = if neighbors.is_empty() {
            SweepReport::default()
        } else {
            self.propagate_update(endpoint, &neighbors).await
        };
        Ok(EventOutcome {
            neighbors,
            propagation,
        })
    }

    /// Re-embeds one article and rewrites its own relation field.
    ///
    /// Returns an empty list, and writes nothing, when the content store does
    /// not know `content_id`. Neighbors' relation fields are left untouched.
    pub async fn process_one(&self, endpoint: &str, content_id: &str) -> Result<Vec<String>> {
        let Some(item) = self
            .content
            .find(endpoint, content_id)
            .await
            .with_context(|| format!("failed to fetch content {content_id}"))?
        else {
            info!(endpoint, content_id, "content not found; nothing to do");
            return Ok(Vec::new());
        };
        let article = self.prepare(content_id, &item).await?;
        self.store
            .upsert(&article)
            .await
            .with_context(|| format!("failed to store embedding for {content_id}"))?;
        let neighbors = self.relink(endpoint, content_id, &article.embedding).await?;
        info!(endpoint, content_id, neighbors = ?neighbors, "article processed");
        Ok(neighbors)
    }

    /// Recomputes and patches the neighbor sets of `neighbor_ids` (one hop).
    ///
    /// Stored embeddings are reused as-is; only ids missing from the vector
    /// store go through normalization and embedding.
    pub async fn propagate_update(&self, endpoint: &str, neighbor_ids: &[String]) -> SweepReport {
        let mut report = SweepReport::default();
        for id in neighbor_ids {
            match self.propagate_one(endpoint, id, &mut report).await {
                Ok(true) => report.relinked.push(id.clone()),
                Ok(false) => report.missing.push(id.clone()),
                Err(err) => {
                    warn!(endpoint, content_id = %id, error = %format!("{err:#}"), "propagation failed");
                    report.failed.push(SweepFailure::new(id, &err));
                }
            }
        }
        report
    }

    async fn propagate_one(
        &self,
        endpoint: &str,
        id: &str,
        report: &mut SweepReport,
    ) -> Result<bool> {
        let vector = match self.store.fetch(id).await? {
            Some(record) => {
                debug!(content_id = id, "reusing stored embedding");
                record.embedding
            }
            None => {
                let Some(item) = self.content.find(endpoint, id).await? else {
                    return Ok(false);
                };
                let article = self.prepare(id, &item).await?;
                self.store.upsert(&article).await?;
                report.ingested.push(id.to_string());
                article.embedding
            }
        };
        self.relink(endpoint, id, &vector).await?;
        Ok(true)
    }

    /// Re-ingests the whole collection, then recomputes every relation.
    ///
    /// Phase 1 commits one listing page at a time, so an interrupted rebuild
    /// keeps its finished pages and can simply be run again. A page the store
    /// rejects is retried row by row and only the offending rows are reported.
    /// Phase 2 only starts once every page is stored.
    pub async fn batch_rebuild(&self, endpoint: &str) -> Result<RebuildReport> {
        let mut report = RebuildReport::default();
        let mut offset = 0usize;
        loop {
            let page = self
                .content
                .list(
                    endpoint,
                    &ListQuery {
                        limit: self.settings.page_size,
                        offset,
                        fields: Some(REQUESTED_FIELDS),
                        ids: &[],
                    },
                )
                .await
                .with_context(|| format!("failed to list {endpoint} at offset {offset}"))?;
            if page.contents.is_empty() {
                break;
            }
            let fetched = page.contents.len();
            let mut batch = Vec::with_capacity(fetched);
            for item in &page.contents {
                let Some(id) = item.id() else {
                    warn!(endpoint, offset, "listed item has no id; skipping");
                    report.failed.push(SweepFailure {
                        id: String::new(),
                        error: "listed item has no id".to_string(),
                    });
                    continue;
                };
                match self.prepare(&id, item).await {
                    Ok(article) => batch.push(article),
                    Err(err) => {
                        warn!(endpoint, content_id = %id, error = %format!("{err:#}"), "ingest failed");
                        report.failed.push(SweepFailure::new(&id, &err));
                    }
                }
            }
            let committed = self.commit_page(endpoint, offset, &batch, &mut report).await;
            report.pages += 1;
            report.ingested += committed;
            offset += fetched;
            info!(
                endpoint,
                page = report.pages,
                committed,
                total = page.total,
                "rebuild page committed"
            );
        }

        let ids = self
            .store
            .list_ids()
            .await
            .context("failed to list stored articles")?;
        for id in &ids {
            match self.relink_stored(endpoint, id).await {
                Ok(()) => report.relinked += 1,
                Err(err) => {
                    warn!(endpoint, content_id = %id, error = %format!("{err:#}"), "relink failed");
                    report.failed.push(SweepFailure::new(id, &err));
                }
            }
        }
        info!(
            endpoint,
            ingested = report.ingested,
            relinked = report.relinked,
            failed = report.failed.len(),
            "rebuild finished"
        );
        Ok(report)
    }

    /// Commits a page in one go; when the store rejects it, falls back to
    /// row-by-row upserts so one bad row only costs itself.
    async fn commit_page(
        &self,
        endpoint: &str,
        offset: usize,
        batch: &[NewArticle],
        report: &mut RebuildReport,
    ) -> usize {
        let Err(err) = self.store.upsert_page(batch).await else {
            return batch.len();
        };
        warn!(
            endpoint,
            offset,
            error = %format!("{err:#}"),
            "page commit failed; retrying row by row"
        );
        let mut committed = 0;
        for article in batch {
            match self.store.upsert(article).await {
                Ok(()) => committed += 1,
                Err(err) => {
                    let err = err.context(format!("failed to store embedding for {}", article.id));
                    warn!(endpoint, content_id = %article.id, error = %format!("{err:#}"), "row rejected");
                    report.failed.push(SweepFailure::new(&article.id, &err));
                }
            }
        }
        committed
    }

    async fn relink_stored(&self, endpoint: &str, id: &str) -> Result<()> {
        let record = self
            .store
            .fetch(id)
            .await?
            .with_context(|| format!("article {id} vanished from the store"))?;
        self.relink(endpoint, id, &record.embedding).await?;
        Ok(())
    }

    /// Normalize and embed one content item without writing anything.
    async fn prepare(&self, id: &str, item: &ContentItem) -> Result<NewArticle> {
        let source = item.to_source();
        let hints = ArticleHints {
            published_at: source.published_at.as_deref(),
            ..ArticleHints::default()
        };
        let normalized = self
            .normalizer
            .normalize(&source.title, &source.body, &hints)
            .await
            .with_context(|| format!("failed to normalize {id}"))?;
        let embedding = self
            .embedder
            .embed(&normalized.canonical_text)
            .await
            .with_context(|| format!("failed to embed {id}"))?;
        Ok(NewArticle {
            id: id.to_string(),
            title: source.stored_title(),
            normalized_text: normalized.canonical_text,
            embedding,
        })
    }

    /// Nearest-neighbor query plus relation patch when the result is non-empty.
    async fn relink(&self, endpoint: &str, id: &str, vector: &Embedding) -> Result<Vec<String>> {
        let neighbors = self
            .store
            .nearest(vector, id, self.settings.neighbors)
            .await
            .with_context(|| format!("neighbor query failed for {id}"))?;
        if !neighbors.is_empty() {
            self.content
                .patch_relations(endpoint, id, &neighbors)
                .await
                .with_context(|| format!("failed to patch relations of {id}"))?;
        }
        Ok(neighbors)
    }
}
