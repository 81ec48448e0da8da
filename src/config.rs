//! Process-wide configuration shared by the binaries.
//!
//! Everything is parsed once at startup (flags with environment fallbacks) and
//! turned into concrete clients that are handed to [`RelationUpdater`] by
//! reference; nothing re-reads the environment per call.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};

use crate::cms::{CmsTimeouts, MicroCmsClient};
use crate::embedder::OpenAiEmbedder;
use crate::llm::{AnthropicProvider, LlmProvider, OpenAiProvider};
use crate::normalizer::TextNormalizer;
use crate::pipeline::{RelationUpdater, UpdaterSettings, DEFAULT_NEIGHBORS, DEFAULT_PAGE_SIZE};
use crate::store::{PgVectorStore, TableName};
use crate::webhook::SignatureVerifier;

/// Backend used for the normalization call.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum LlmBackend {
    /// OpenAI chat completions (default).
    Openai,
    /// Anthropic messages API.
    Anthropic,
}

/// Language model and embedding settings.
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// OpenAI API key used for embeddings (and normalization with the OpenAI backend)
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: String,

    /// Base URL for OpenAI-compatible endpoints
    #[arg(long, env = "RELGRAPH_OPENAI_BASE", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    /// Model that produces the canonical rewrite
    #[arg(long, env = "OPENAI_NORMALIZE_MODEL", default_value = "gpt-5")]
    pub normalize_model: String,

    /// Embedding model identifier
    #[arg(long, env = "OPENAI_EMBED_MODEL", default_value = "text-embedding-3-large")]
    pub embed_model: String,

    /// Embedding dimension (also the width of the vector column)
    #[arg(long, env = "RELGRAPH_EMBED_DIMENSIONS", default_value_t = 3072)]
    pub embed_dimensions: usize,

    /// Characters of canonical text sent to the embedding model; longer input is truncated
    #[arg(long, env = "RELGRAPH_EMBED_MAX_CHARS", default_value_t = 8000)]
    pub embed_max_chars: usize,

    /// Backend for the normalization call
    #[arg(long, env = "RELGRAPH_LLM_PROVIDER", value_enum, default_value_t = LlmBackend::Openai)]
    pub llm_provider: LlmBackend,

    /// Anthropic API key (required with `--llm-provider anthropic`)
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,

    /// Anthropic model used with `--llm-provider anthropic`
    #[arg(long, env = "ANTHROPIC_MODEL", default_value = "claude-sonnet-4-5")]
    pub anthropic_model: String,

    /// Seconds before a normalization call times out
    #[arg(long, env = "RELGRAPH_LLM_TIMEOUT_SECS", default_value_t = 120)]
    pub llm_timeout_secs: u64,

    /// Seconds before an embedding call times out
    #[arg(long, env = "RELGRAPH_EMBED_TIMEOUT_SECS", default_value_t = 60)]
    pub embed_timeout_secs: u64,
}

/// Content API settings.
#[derive(Args, Debug, Clone)]
pub struct CmsArgs {
    /// microCMS API key (needs draft read access for unpublished content)
    #[arg(long, env = "MICROCMS_API_KEY", hide_env_values = true)]
    pub microcms_api_key: String,

    /// microCMS service id (subdomain)
    #[arg(long, env = "MICROCMS_SERVICE_ID")]
    pub microcms_service_id: String,

    /// Override for the content API base URL
    #[arg(long, env = "RELGRAPH_MICROCMS_BASE")]
    pub microcms_base_url: Option<String>,

    /// Shared secret for webhook signatures; unset disables verification
    #[arg(long, env = "MICROCMS_WEBHOOK_SECRET", hide_env_values = true)]
    pub webhook_secret: Option<String>,

    /// Default endpoint (collection) name
    #[arg(long, env = "MICROCMS_ENDPOINT", default_value = "blog")]
    pub endpoint: String,

    /// Relation field overwritten with neighbor ids
    #[arg(long, env = "MICROCMS_RELATION_FIELD", default_value = "related_blog_post")]
    pub relation_field: String,

    /// Seconds before single-item fetches and patches time out
    #[arg(long, env = "RELGRAPH_CMS_TIMEOUT_SECS", default_value_t = 30)]
    pub cms_timeout_secs: u64,

    /// Seconds before listing calls time out
    #[arg(long, env = "RELGRAPH_CMS_LIST_TIMEOUT_SECS", default_value_t = 60)]
    pub cms_list_timeout_secs: u64,
}

/// Vector store settings.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Postgres connection string (postgres://...)
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    /// Schema for the embeddings table
    #[arg(long, env = "RELGRAPH_SCHEMA", default_value = "public")]
    pub schema: String,

    /// Embeddings table name
    #[arg(long, env = "RELGRAPH_TABLE", default_value = "article_embeddings")]
    pub table: String,

    /// Create the extension, table, and index when missing
    #[arg(long, env = "RELGRAPH_PREPARE", default_value_t = true, action = clap::ArgAction::Set)]
    pub prepare: bool,
}

/// Relation graph tunables.
#[derive(Args, Debug, Clone)]
pub struct GraphArgs {
    /// Neighbors written to each relation field
    #[arg(long, env = "RELGRAPH_NEIGHBORS", default_value_t = DEFAULT_NEIGHBORS)]
    pub neighbors: usize,

    /// Listing page size during a rebuild
    #[arg(long, env = "RELGRAPH_PAGE_SIZE", default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: usize,
}

/// Full service configuration.
#[derive(Args, Debug, Clone)]
pub struct ServiceConfig {
    #[command(flatten)]
    #[allow(missing_docs)]
    pub models: ModelArgs,
    #[command(flatten)]
    #[allow(missing_docs)]
    pub cms: CmsArgs,
    #[command(flatten)]
    #[allow(missing_docs)]
    pub store: StoreArgs,
    #[command(flatten)]
    #[allow(missing_docs)]
    pub graph: GraphArgs,
}

/// Clients built from a [`ServiceConfig`].
pub struct Service {
    /// Pipeline entry points.
    pub updater: RelationUpdater,
    /// Webhook verifier.
    pub verifier: SignatureVerifier,
    /// Endpoint used when an event or command names none.
    pub default_endpoint: String,
}

impl ServiceConfig {
    /// Validated table name.
    pub fn table_name(&self) -> Result<TableName> {
        TableName::new(self.store.schema.clone(), self.store.table.clone())
    }

    /// Updater tunables.
    pub fn updater_settings(&self) -> UpdaterSettings {
        UpdaterSettings {
            neighbors: self.graph.neighbors,
            page_size: self.graph.page_size.max(1),
        }
    }

    /// Content API base URL, derived from the service id unless overridden.
    pub fn cms_base_url(&self) -> String {
        self.cms
            .microcms_base_url
            .clone()
            .unwrap_or_else(|| MicroCmsClient::service_base_url(&self.cms.microcms_service_id))
    }

    /// Chat provider selected by `--llm-provider`.
    pub fn llm_provider(&self) -> Result<Arc<dyn LlmProvider>> {
        let timeout = secs(self.models.llm_timeout_secs);
        let provider: Arc<dyn LlmProvider> = match self.models.llm_provider {
            LlmBackend::Openai => Arc::new(OpenAiProvider::new(
                &self.models.openai_api_key,
                &self.models.openai_base_url,
                self.models.normalize_model.clone(),
                timeout,
            )?),
            LlmBackend::Anthropic => {
                let key = self
                    .models
                    .anthropic_api_key
                    .as_deref()
                    .context("ANTHROPIC_API_KEY is required for the anthropic backend")?;
                Arc::new(AnthropicProvider::new(
                    key,
                    self.models.anthropic_model.clone(),
                    timeout,
                )?)
            }
        };
        Ok(provider)
    }

    /// Embedding client.
    pub fn embedder(&self) -> Result<OpenAiEmbedder> {
        OpenAiEmbedder::new(
            &self.models.openai_api_key,
            &self.models.openai_base_url,
            self.models.embed_model.clone(),
            self.models.embed_dimensions,
            self.models.embed_max_chars,
            secs(self.models.embed_timeout_secs),
        )
    }

    /// Content API client.
    pub fn cms_client(&self) -> Result<MicroCmsClient> {
        MicroCmsClient::new(
            &self.cms.microcms_api_key,
            &self.cms_base_url(),
            self.cms.relation_field.clone(),
            CmsTimeouts {
                item: secs(self.cms.cms_timeout_secs),
                list: secs(self.cms.cms_list_timeout_secs),
            },
        )
    }

    /// Connects every collaborator and prepares the table when asked to.
    pub async fn build(&self) -> Result<Service> {
        let table = self.table_name()?;
        let store = PgVectorStore::connect(&self.store.database_url, table.clone()).await?;
        if self.store.prepare {
            store
                .prepare(&table, self.models.embed_dimensions)
                .await
                .context("failed to prepare vector table")?;
        }
        let updater = RelationUpdater::new(
            Arc::new(self.cms_client()?),
            Arc::new(store),
            TextNormalizer::new(self.llm_provider()?),
            Arc::new(self.embedder()?),
            self.updater_settings(),
        );
        Ok(Service {
            updater,
            verifier: SignatureVerifier::new(self.cms.webhook_secret.as_deref()),
            default_endpoint: self.cms.endpoint.clone(),
        })
    }
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value.max(1))
}
