//! pgvector-backed article store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{error, info, warn};

use super::{ArticleRecord, NewArticle, VectorStore};
use crate::vector::Embedding;

/// IVFFlat list count used when creating the cosine index.
const IVFFLAT_LISTS: u32 = 100;

/// Fully-qualified Postgres table name (schema + table).
#[derive(Debug, Clone)]
pub struct TableName {
    schema: String,
    table: String,
}

impl TableName {
    /// Builds a new table identifier.
    pub fn new<S, T>(schema: S, table: T) -> Result<Self>
    where
        S: Into<String>,
        T: Into<String>,
    {
        let schema = schema.into();
        let table = table.into();
        anyhow::ensure!(!schema.trim().is_empty(), "schema name is required");
        anyhow::ensure!(!table.trim().is_empty(), "table name is required");
        Ok(Self { schema, table })
    }

    /// Fully-qualified table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Index name used for the cosine IVFFlat index.
    pub fn vector_index_name(&self) -> String {
        format!(
            "{}_{}_embedding_cos_idx",
            sanitize_ident(&self.schema),
            sanitize_ident(&self.table)
        )
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    let escaped = input.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

fn sanitize_ident(input: &str) -> String {
    input
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

/// [`VectorStore`] over a single Postgres table with a `vector` column.
pub struct PgVectorStore {
    client: Mutex<Client>,
    sql: Statements,
}

struct Statements {
    upsert: String,
    nearest: String,
    fetch: String,
    list_ids: String,
}

impl Statements {
    fn new(table: &TableName) -> Self {
        let qualified = table.qualified();
        Self {
            upsert: format!(
                "INSERT INTO {qualified} (id, title, normalized_text, embedding, updated_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (id) DO UPDATE SET \
                    title = EXCLUDED.title, \
                    normalized_text = EXCLUDED.normalized_text, \
                    embedding = EXCLUDED.embedding, \
                    updated_at = EXCLUDED.updated_at"
            ),
            nearest: format!(
                "SELECT id FROM {qualified} \
                 WHERE id <> $1 \
                 ORDER BY embedding <=> $2 ASC, id ASC \
                 LIMIT $3"
            ),
            fetch: format!(
                "SELECT id, title, normalized_text, embedding, updated_at \
                 FROM {qualified} WHERE id = $1"
            ),
            list_ids: format!("SELECT id FROM {qualified} ORDER BY id"),
        }
    }
}

impl PgVectorStore {
    /// Connects to Postgres and drives the connection on a background task.
    pub async fn connect(database_url: &str, table: TableName) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("failed to connect to Postgres")?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "postgres connection error");
            }
        });
        Ok(Self::from_client(client, &table))
    }

    /// Wraps an existing client.
    pub fn from_client(client: Client, table: &TableName) -> Self {
        Self {
            client: Mutex::new(client),
            sql: Statements::new(table),
        }
    }

    /// Creates the extension, table, and cosine index when missing.
    ///
    /// IVFFlat creation can fail on an empty table; that failure is logged and
    /// ignored, queries then fall back to a sequential scan.
    pub async fn prepare(&self, table: &TableName, dims: usize) -> Result<()> {
        anyhow::ensure!(dims > 0, "embedding dimension must be positive");
        let client = self.client.lock().await;
        client
            .execute("CREATE EXTENSION IF NOT EXISTS vector", &[])
            .await
            .context("failed to ensure pgvector extension")?;
        let ddl = table_ddl(table, dims);
        client
            .execute(&ddl, &[])
            .await
            .context("failed to create article embeddings table")?;
        let index = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} USING ivfflat (embedding vector_cosine_ops) \
             WITH (lists = {IVFFLAT_LISTS})",
            table.vector_index_name(),
            table.qualified()
        );
        match client.execute(&index, &[]).await {
            Ok(_) => info!(table = %table.qualified(), dims, "vector table ready"),
            Err(err) => warn!(error = %err, "deferring IVFFlat index creation"),
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn upsert_page(&self, articles: &[NewArticle]) -> Result<()> {
        if articles.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;
        let statement = transaction.prepare(&self.sql.upsert).await?;
        for article in articles {
            let vector = Vector::from(article.embedding.clone());
            transaction
                .execute(
                    &statement,
                    &[
                        &article.id,
                        &article.title,
                        &article.normalized_text,
                        &vector,
                        &now,
                    ],
                )
                .await
                .with_context(|| format!("failed to upsert article {}", article.id))?;
        }
        transaction.commit().await.context("failed to commit upsert")?;
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
        let query = Vector::from(vector.clone());
        let limit = i64::try_from(k).context("neighbor count exceeds i64 range")?;
        let client = self.client.lock().await;
        let rows = client
            .query(self.sql.nearest.as_str(), &[&exclude_id, &query, &limit])
            .await
            .context("nearest-neighbor query failed")?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    async fn fetch(&self, id: &str) -> Result<Option<ArticleRecord>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(self.sql.fetch.as_str(), &[&id])
            .await
            .with_context(|| format!("failed to load article {id}"))?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let client = self.client.lock().await;
        let rows = client
            .query(self.sql.list_ids.as_str(), &[])
            .await
            .context("failed to list article ids")?;
        Ok(rows.iter().map(|row| row.get("id")).collect())
    }
}

fn table_ddl(table: &TableName, dims: usize) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (
            id TEXT PRIMARY KEY,
            title TEXT NULL,
            normalized_text TEXT NOT NULL,
            embedding VECTOR({dims}) NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
        table.qualified()
    )
}

fn record_from_row(row: &Row) -> Result<ArticleRecord> {
    let id: String = row.get("id");
    let vector: Vector = row.get("embedding");
    let embedding = Embedding::new(vector.to_vec())
        .with_context(|| format!("stored embedding for {id} is invalid"))?;
    let updated_at: DateTime<Utc> = row.get("updated_at");
    Ok(ArticleRecord {
        title: row.get("title"),
        normalized_text: row.get("normalized_text"),
        embedding,
        updated_at,
        id,
    })
}
