#![warn(missing_docs)]
//! Core library for relgraph: keeps a CMS collection's "related articles"
//! field in sync with the nearest neighbors of each article's embedding.

pub mod cms;
pub mod config;
pub mod content;
pub mod embedder;
pub mod html;
pub mod llm;
pub mod normalizer;
pub mod pipeline;
pub mod store;
pub mod vector;
pub mod webhook;

pub use cms::{ContentPage, ContentStore, ListQuery, MicroCmsClient};
pub use config::{Service, ServiceConfig};
pub use content::{ArticleSource, ContentItem};
pub use embedder::{Embedder, OpenAiEmbedder};
pub use llm::{LlmProvider, ProviderRequest};
pub use normalizer::{ArticleHints, NormalizedArticle, TextNormalizer};
pub use pipeline::{
    EventOutcome, RebuildReport, RelationUpdater, SweepFailure, SweepReport, UpdaterSettings,
};
pub use store::{ArticleRecord, MemoryStore, NewArticle, PgVectorStore, TableName, VectorStore};
pub use vector::{Embedding, VectorError};
pub use webhook::{SignatureVerifier, WebhookAck, WebhookError, WebhookEvent};
