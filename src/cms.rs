//! Content store gateway: microCMS REST client and the trait the pipeline uses.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::content::{ContentItem, REQUESTED_FIELDS};

/// Header carrying the microCMS API key.
pub const API_KEY_HEADER: &str = "x-microcms-api-key";

/// Parameters for a paginated list call.
#[derive(Debug, Clone, Default)]
pub struct ListQuery<'a> {
    /// Page size.
    pub limit: usize,
    /// Items to skip.
    pub offset: usize,
    /// Comma-separated field projection.
    pub fields: Option<&'a str>,
    /// Restricts the listing to these ids.
    pub ids: &'a [String],
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ContentPage {
    /// Items on this page.
    #[serde(default)]
    pub contents: Vec<ContentItem>,
    /// Total items matching the query across all pages.
    #[serde(rename = "totalCount", default)]
    pub total: usize,
}

/// Content API contract used by the relation updater.
///
/// Every call is keyed by an API endpoint name (the collection). Any
/// non-success response is an error; nothing is retried.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Single-item fetch; `depth` controls relation expansion.
    async fn get_by_id(&self, endpoint: &str, id: &str, depth: u8) -> Result<ContentItem>;

    /// Paginated listing.
    async fn list(&self, endpoint: &str, query: &ListQuery<'_>) -> Result<ContentPage>;

    /// Replaces the relation field of `id` with `related_ids`, order preserved.
    async fn patch_relations(&self, endpoint: &str, id: &str, related_ids: &[String])
        -> Result<()>;

    /// Fetches one item through the listing API filtered by id.
    ///
    /// Unlike [`ContentStore::get_by_id`], drafts are reachable without a
    /// draft key when the API key is allowed to read them. `None` when absent.
    async fn find(&self, endpoint: &str, id: &str) -> Result<Option<ContentItem>> {
        let ids = [id.to_string()];
        let page = self
            .list(
                endpoint,
                &ListQuery {
                    limit: 1,
                    offset: 0,
                    fields: Some(REQUESTED_FIELDS),
                    ids: &ids,
                },
            )
            .await?;
        Ok(page.contents.into_iter().next())
    }
}

/// Request timeouts for the content API.
#[derive(Debug, Clone, Copy)]
pub struct CmsTimeouts {
    /// Single-item fetch and relation patch.
    pub item: Duration,
    /// Listing calls.
    pub list: Duration,
}

impl Default for CmsTimeouts {
    fn default() -> Self {
        Self {
            item: Duration::from_secs(30),
            list: Duration::from_secs(60),
        }
    }
}

/// microCMS REST client.
#[derive(Clone)]
pub struct MicroCmsClient {
    client: Client,
    base: Url,
    relation_field: String,
    timeouts: CmsTimeouts,
}

impl MicroCmsClient {
    /// Default API base for a service id.
    pub fn service_base_url(service_id: &str) -> String {
        format!("https://{}.microcms.io/api/v1", service_id.trim())
    }

    /// Builds a client; `relation_field` is the field overwritten by patches.
    pub fn new(
        api_key: &str,
        base_url: &str,
        relation_field: String,
        timeouts: CmsTimeouts,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing microCMS API key");
        anyhow::ensure!(
            !relation_field.trim().is_empty(),
            "missing relation field name"
        );
        let base = Url::parse(base_url.trim_end_matches('/'))
            .with_context(|| format!("invalid content API base URL {base_url}"))?;
        anyhow::ensure!(
            !base.cannot_be_a_base(),
            "content API base URL must be hierarchical"
        );
        let mut headers = HeaderMap::new();
        headers.insert(
            API_KEY_HEADER,
            HeaderValue::from_str(api_key.trim()).context("invalid microCMS API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to build microCMS HTTP client")?;
        Ok(Self {
            client,
            base,
            relation_field,
            timeouts,
        })
    }

    /// Field overwritten by [`ContentStore::patch_relations`].
    pub fn relation_field(&self) -> &str {
        &self.relation_field
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("content API base URL cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl ContentStore for MicroCmsClient {
    async fn get_by_id(&self, endpoint: &str, id: &str, depth: u8) -> Result<ContentItem> {
        let url = self.url(&[endpoint, id])?;
        debug!(endpoint, content_id = id, "fetching content");
        let resp = send(
            self.client
                .get(url)
                .query(&[("depth", depth)])
                .timeout(self.timeouts.item),
            "fetch content",
        )
        .await?;
        resp.json()
            .await
            .with_context(|| format!("invalid content payload for {id}"))
    }

    async fn list(&self, endpoint: &str, query: &ListQuery<'_>) -> Result<ContentPage> {
        let url = self.url(&[endpoint])?;
        let params = list_params(query);
        debug!(
            endpoint,
            limit = query.limit,
            offset = query.offset,
            "listing contents"
        );
        let resp = send(
            self.client
                .get(url)
                .query(&params)
                .timeout(self.timeouts.list),
            "list contents",
        )
        .await?;
        resp.json()
            .await
            .with_context(|| format!("invalid list payload from {endpoint}"))
    }

    async fn patch_relations(
        &self,
        endpoint: &str,
        id: &str,
        related_ids: &[String],
    ) -> Result<()> {
        let url = self.url(&[endpoint, id])?;
        let body = relation_body(&self.relation_field, related_ids);
        debug!(endpoint, content_id = id, related = ?related_ids, "patching relations");
        send(
            self.client
                .patch(url)
                .json(&body)
                .timeout(self.timeouts.item),
            "patch relations",
        )
        .await?;
        Ok(())
    }
}

/// Query string of a listing call; `fields` and `ids` only when set.
fn list_params(query: &ListQuery<'_>) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("limit", query.limit.to_string()),
        ("offset", query.offset.to_string()),
    ];
    if let Some(fields) = query.fields.filter(|fields| !fields.is_empty()) {
        params.push(("fields", fields.to_string()));
    }
    if !query.ids.is_empty() {
        params.push(("ids", query.ids.join(",")));
    }
    params
}

/// `{ "<field>": [ids...] }`, the full-overwrite patch body.
pub fn relation_body(field: &str, related_ids: &[String]) -> Value {
    let ids = related_ids.iter().cloned().map(Value::String).collect();
    let mut body = Map::new();
    body.insert(field.to_string(), Value::Array(ids));
    Value::Object(body)
}

async fn send(request: RequestBuilder, action: &str) -> Result<Response> {
    let resp = request
        .send()
        .await
        .with_context(|| format!("failed to {action}"))?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp
            .text()
            .await
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        bail!("content API {action} failed ({}): {}", status, body);
    }
    Ok(resp)
}
