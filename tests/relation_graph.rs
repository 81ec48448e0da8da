use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use pretty_assertions::assert_eq;
use relgraph::webhook;
use relgraph::{
    ContentItem, ContentPage, ContentStore, Embedder, Embedding, ListQuery, LlmProvider,
    MemoryStore, NewArticle, ProviderRequest, RelationUpdater, SignatureVerifier, TextNormalizer,
    UpdaterSettings, VectorStore, WebhookError,
};
use serde_json::json;
use sha2::Sha256;

const ENDPOINT: &str = "blog";

/// Content API double: ordered items, recorded patches, optional list failure.
#[derive(Default)]
struct FakeCms {
    items: Mutex<Vec<ContentItem>>,
    patches: Mutex<Vec<(String, Vec<String>)>>,
    fail_list_at_offset: Mutex<Option<usize>>,
}

impl FakeCms {
    fn with_items(items: Vec<serde_json::Value>) -> Arc<Self> {
        let items = items
            .into_iter()
            .map(|value| serde_json::from_value(value).expect("object"))
            .collect();
        Arc::new(Self {
            items: Mutex::new(items),
            ..Self::default()
        })
    }

    fn patches(&self) -> Vec<(String, Vec<String>)> {
        self.patches.lock().unwrap().clone()
    }

    fn patch_for(&self, id: &str) -> Option<Vec<String>> {
        self.patches()
            .into_iter()
            .rev()
            .find(|(patched, _)| patched == id)
            .map(|(_, ids)| ids)
    }
}

#[async_trait]
impl ContentStore for FakeCms {
    async fn get_by_id(&self, _endpoint: &str, id: &str, _depth: u8) -> Result<ContentItem> {
        let items = self.items.lock().unwrap();
        match items.iter().find(|item| item.id().as_deref() == Some(id)) {
            Some(item) => Ok(item.clone()),
            None => bail!("content API fetch content failed (404 Not Found)"),
        }
    }

    async fn list(&self, _endpoint: &str, query: &ListQuery<'_>) -> Result<ContentPage> {
        if *self.fail_list_at_offset.lock().unwrap() == Some(query.offset) {
            bail!("content API list contents failed (503 Service Unavailable)");
        }
        let items = self.items.lock().unwrap();
        let matching: Vec<ContentItem> = items
            .iter()
            .filter(|item| {
                query.ids.is_empty()
                    || item
                        .id()
                        .is_some_and(|id| query.ids.iter().any(|wanted| *wanted == id))
            })
            .cloned()
            .collect();
        let total = matching.len();
        let contents = matching
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect();
        Ok(ContentPage { contents, total })
    }

    async fn patch_relations(
        &self,
        _endpoint: &str,
        id: &str,
        related_ids: &[String],
    ) -> Result<()> {
        self.patches
            .lock()
            .unwrap()
            .push((id.to_string(), related_ids.to_vec()));
        Ok(())
    }
}

/// Model double that never emits the canonical-body section.
#[derive(Default)]
struct EchoLlm {
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl LlmProvider for EchoLlm {
    async fn complete(&self, request: &ProviderRequest<'_>) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.to_string());
        Ok("1) 種別\n不明\n".to_string())
    }
}

/// Embedding double keyed by canonical text.
#[derive(Default)]
struct TableEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    calls: Mutex<Vec<String>>,
}

impl TableEmbedder {
    fn new(entries: &[(&str, [f32; 2])]) -> Arc<Self> {
        Arc::new(Self {
            vectors: entries
                .iter()
                .map(|(text, vector)| (text.to_string(), vector.to_vec()))
                .collect(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Embedder for TableEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        self.calls.lock().unwrap().push(text.to_string());
        match self.vectors.get(text) {
            Some(vector) => Ok(Embedding::new(vector.clone())?),
            None => bail!("embedding service rejected input {text:?}"),
        }
    }

    fn dimension(&self) -> usize {
        2
    }
}

struct Harness {
    cms: Arc<FakeCms>,
    store: Arc<MemoryStore>,
    llm: Arc<EchoLlm>,
    embedder: Arc<TableEmbedder>,
    updater: RelationUpdater,
}

/// Rejects a whole page when any row carries an over-long title, the way a
/// single failing INSERT rolls back a Postgres transaction.
struct TitleLimitStore {
    inner: Arc<MemoryStore>,
    max_title_chars: usize,
}

#[async_trait]
impl VectorStore for TitleLimitStore {
    async fn upsert_page(&self, articles: &[NewArticle]) -> Result<()> {
        for article in articles {
            let len = article.title.as_deref().map_or(0, |t| t.chars().count());
            if len > self.max_title_chars {
                bail!("value too long for title of {}", article.id);
            }
        }
        self.inner.upsert_page(articles).await
    }

    async fn nearest(
        &self,
        vector: &Embedding,
        exclude_id: &str,
        k: usize,
    ) -> Result<Vec<String>> {
        self.inner.nearest(vector, exclude_id, k).await
    }

    async fn fetch(&self, id: &str) -> Result<Option<relgraph::ArticleRecord>> {
        self.inner.fetch(id).await
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        self.inner.list_ids().await
    }
}

fn harness(cms: Arc<FakeCms>, embedder: Arc<TableEmbedder>, settings: UpdaterSettings) -> Harness {
    let store = Arc::new(MemoryStore::new());
    harness_over(cms, embedder, settings, store.clone(), store)
}

fn harness_over(
    cms: Arc<FakeCms>,
    embedder: Arc<TableEmbedder>,
    settings: UpdaterSettings,
    store: Arc<MemoryStore>,
    backend: Arc<dyn VectorStore>,
) -> Harness {
    let llm = Arc::new(EchoLlm::default());
    let updater = RelationUpdater::new(
        cms.clone(),
        backend,
        TextNormalizer::new(llm.clone()),
        embedder.clone(),
        settings,
    );
    Harness {
        cms,
        store,
        llm,
        embedder,
        updater,
    }
}

fn stored(id: &str, vector: [f32; 2]) -> NewArticle {
    NewArticle {
        id: id.to_string(),
        title: None,
        normalized_text: id.to_string(),
        embedding: Embedding::new(vector.to_vec()).unwrap(),
    }
}

fn five_article_store_entries() -> Vec<NewArticle> {
    vec![
        stored("a", [1.0, 0.0]),
        stored("b", [0.9, 0.1]),
        stored("c", [0.6, 0.8]),
        stored("d", [0.8, 0.2]),
        stored("e", [0.0, 1.0]),
    ]
}

#[tokio::test(flavor = "current_thread")]
async fn process_one_cleans_falls_back_and_stores_once() {
    let cms = FakeCms::with_items(vec![json!({
        "id": "a1",
        "title": "Greeting",
        "content": "<p>Hello</p><script>x</script>",
    })]);
    let h = harness(
        cms,
        TableEmbedder::new(&[("Hello", [1.0, 0.0])]),
        UpdaterSettings::default(),
    );

    let neighbors = h.updater.process_one(ENDPOINT, "a1").await.expect("process");

    assert_eq!(neighbors, Vec::<String>::new());
    assert_eq!(h.embedder.calls(), vec!["Hello"]);
    assert_eq!(h.store.list_ids().await.unwrap(), vec!["a1"]);
    let record = h.store.fetch("a1").await.unwrap().expect("record");
    assert_eq!(record.normalized_text, "Hello");
    assert_eq!(record.title.as_deref(), Some("Greeting"));
    assert_eq!(record.embedding.as_slice(), &[1.0, 0.0]);
    assert!(h.cms.patches().is_empty(), "no neighbors means no patch");
}

#[tokio::test(flavor = "current_thread")]
async fn redelivered_event_does_not_duplicate() {
    let cms = FakeCms::with_items(vec![json!({"id": "a1", "body": "Hello"})]);
    let h = harness(
        cms,
        TableEmbedder::new(&[("Hello", [1.0, 0.0])]),
        UpdaterSettings::default(),
    );
    h.updater.process_one(ENDPOINT, "a1").await.unwrap();
    h.updater.process_one(ENDPOINT, "a1").await.unwrap();
    assert_eq!(h.store.len(), 1);
    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn upsert_is_idempotent() {
    let store = MemoryStore::new();
    let mut article = stored("x", [0.5, 0.5]);
    store.upsert(&article).await.unwrap();
    article.normalized_text = "latest".to_string();
    store.upsert(&article).await.unwrap();
    assert_eq!(store.list_ids().await.unwrap(), vec!["x"]);
    assert_eq!(
        store.fetch("x").await.unwrap().unwrap().normalized_text,
        "latest"
    );
}

#[tokio::test(flavor = "current_thread")]
async fn nearest_returns_closest_others_in_order() {
    let store = MemoryStore::new();
    store
        .upsert_page(&five_article_store_entries())
        .await
        .unwrap();
    let query = Embedding::new(vec![1.0, 0.0]).unwrap();

    let first = store.nearest(&query, "a", 2).await.unwrap();
    assert_eq!(first, vec!["b", "d"]);
    for _ in 0..3 {
        assert_eq!(store.nearest(&query, "a", 2).await.unwrap(), first);
    }
    let all = store.nearest(&query, "a", 10).await.unwrap();
    assert_eq!(all, vec!["b", "d", "c", "e"]);
    assert!(!all.contains(&"a".to_string()));
}

#[tokio::test(flavor = "current_thread")]
async fn process_one_missing_content_is_a_no_op() {
    let h = harness(
        FakeCms::with_items(Vec::new()),
        TableEmbedder::new(&[]),
        UpdaterSettings::default(),
    );
    let neighbors = h.updater.process_one(ENDPOINT, "ghost").await.unwrap();
    assert!(neighbors.is_empty());
    assert!(h.store.is_empty());
    assert!(h.cms.patches().is_empty());
    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 0);
    assert!(h.embedder.calls().is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn process_one_patches_only_its_own_relations() {
    let cms = FakeCms::with_items(vec![json!({"id": "new", "text": "fresh"})]);
    let h = harness(
        cms,
        TableEmbedder::new(&[("fresh", [1.0, 0.05])]),
        UpdaterSettings {
            neighbors: 2,
            ..UpdaterSettings::default()
        },
    );
    h.store
        .upsert_page(&five_article_store_entries())
        .await
        .unwrap();

    let neighbors = h.updater.process_one(ENDPOINT, "new").await.unwrap();

    assert_eq!(neighbors, vec!["a", "b"]);
    assert_eq!(
        h.cms.patches(),
        vec![("new".to_string(), vec!["a".to_string(), "b".to_string()])]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn propagate_reuses_stored_embeddings() {
    let cms = FakeCms::with_items(vec![
        json!({"id": "b", "body": "bravo"}),
        json!({"id": "c", "body": "charlie"}),
    ]);
    let h = harness(
        cms,
        TableEmbedder::new(&[("bravo", [0.9, 0.1]), ("charlie", [0.6, 0.8])]),
        UpdaterSettings {
            neighbors: 2,
            ..UpdaterSettings::default()
        },
    );
    h.store
        .upsert_page(&[stored("a", [1.0, 0.0]), stored("b", [0.9, 0.1])])
        .await
        .unwrap();

    let neighbors = vec!["b".to_string(), "c".to_string()];
    let report = h.updater.propagate_update(ENDPOINT, &neighbors).await;

    assert_eq!(report.relinked, vec!["b", "c"]);
    assert_eq!(report.ingested, vec!["c"]);
    assert!(report.failed.is_empty());
    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.embedder.calls(), vec!["charlie"]);
    assert_eq!(h.store.len(), 3);
    // "c" is not stored yet when "b" is relinked.
    assert_eq!(h.cms.patch_for("b"), Some(vec!["a".to_string()]));
    assert_eq!(h.cms.patch_for("c"), Some(vec!["b".to_string(), "a".to_string()]));
}

#[tokio::test(flavor = "current_thread")]
async fn propagate_skips_failures_and_missing_ids() {
    let cms = FakeCms::with_items(vec![
        json!({"id": "bad", "body": "unembeddable"}),
        json!({"id": "ok", "body": "fine"}),
    ]);
    let h = harness(
        cms,
        TableEmbedder::new(&[("fine", [0.0, 1.0])]),
        UpdaterSettings::default(),
    );
    h.store.upsert(&stored("a", [1.0, 0.0])).await.unwrap();

    let ids = vec!["bad".to_string(), "gone".to_string(), "ok".to_string()];
    let report = h.updater.propagate_update(ENDPOINT, &ids).await;

    assert_eq!(report.relinked, vec!["ok"]);
    assert_eq!(report.missing, vec!["gone"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].id, "bad");
    assert!(report.failed[0].error.contains("failed to embed bad"));
    assert_eq!(h.cms.patch_for("ok"), Some(vec!["a".to_string()]));
}

#[tokio::test(flavor = "current_thread")]
async fn handle_event_propagates_one_hop() {
    let cms = FakeCms::with_items(vec![json!({"id": "new", "body": "fresh"})]);
    let h = harness(
        cms,
        TableEmbedder::new(&[("fresh", [1.0, 0.05])]),
        UpdaterSettings {
            neighbors: 2,
            ..UpdaterSettings::default()
        },
    );
    h.store
        .upsert_page(&five_article_store_entries())
        .await
        .unwrap();

    let outcome = h.updater.handle_event(ENDPOINT, "new").await.unwrap();

    assert_eq!(outcome.neighbors, vec!["a", "b"]);
    assert_eq!(outcome.propagation.relinked, vec!["a", "b"]);
    assert_eq!(h.cms.patch_for("a"), Some(vec!["new".to_string(), "b".to_string()]));
    assert_eq!(h.cms.patch_for("b"), Some(vec!["new".to_string(), "a".to_string()]));
    assert_eq!(h.cms.patch_for("c"), None, "second hop is not recomputed");
    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn body_field_priority_reaches_the_model() {
    let cms = FakeCms::with_items(vec![json!({
        "id": "p",
        "title": "Priority",
        "content": "from content",
        "body": "from body",
    })]);
    let h = harness(
        cms,
        TableEmbedder::new(&[("from content", [1.0, 0.0])]),
        UpdaterSettings::default(),
    );
    h.updater.process_one(ENDPOINT, "p").await.unwrap();
    let prompts = h.llm.prompts.lock().unwrap().clone();
    assert!(prompts[0].contains("from content"));
    assert!(!prompts[0].contains("from body"));
}

fn four_items() -> Vec<serde_json::Value> {
    vec![
        json!({"id": "p1", "body": "one"}),
        json!({"id": "p2", "body": "two"}),
        json!({"id": "p3", "body": "three"}),
        json!({"id": "p4", "body": "four"}),
    ]
}

fn four_vectors() -> Arc<TableEmbedder> {
    TableEmbedder::new(&[
        ("one", [1.0, 0.0]),
        ("two", [0.9, 0.1]),
        ("three", [0.1, 0.9]),
        ("four", [0.0, 1.0]),
    ])
}

#[tokio::test(flavor = "current_thread")]
async fn rebuild_commits_per_page_and_resumes_cleanly() {
    let h = harness(
        FakeCms::with_items(four_items()),
        four_vectors(),
        UpdaterSettings {
            neighbors: 1,
            page_size: 2,
        },
    );

    *h.cms.fail_list_at_offset.lock().unwrap() = Some(2);
    let err = h.updater.batch_rebuild(ENDPOINT).await.unwrap_err();
    assert!(format!("{err:#}").contains("offset 2"));
    assert_eq!(h.store.list_ids().await.unwrap(), vec!["p1", "p2"]);
    assert!(h.cms.patches().is_empty(), "relations wait for a complete store");

    *h.cms.fail_list_at_offset.lock().unwrap() = None;
    let report = h.updater.batch_rebuild(ENDPOINT).await.expect("restart");

    assert_eq!(report.pages, 2);
    assert_eq!(report.ingested, 4);
    assert_eq!(report.relinked, 4);
    assert!(report.failed.is_empty());
    assert_eq!(
        h.store.list_ids().await.unwrap(),
        vec!["p1", "p2", "p3", "p4"]
    );
    assert_eq!(h.cms.patch_for("p1"), Some(vec!["p2".to_string()]));
    assert_eq!(h.cms.patch_for("p3"), Some(vec!["p4".to_string()]));
}

#[tokio::test(flavor = "current_thread")]
async fn rebuild_continues_past_bad_items() {
    let mut items = four_items();
    items.insert(1, json!({"id": "broken", "body": "no vector for me"}));
    let h = harness(
        FakeCms::with_items(items),
        four_vectors(),
        UpdaterSettings {
            neighbors: 2,
            page_size: 2,
        },
    );

    let report = h.updater.batch_rebuild(ENDPOINT).await.expect("rebuild");

    assert_eq!(report.pages, 3);
    assert_eq!(report.ingested, 4);
    assert_eq!(report.relinked, 4);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].id, "broken");
    assert!(h.store.fetch("broken").await.unwrap().is_none());
}

#[tokio::test(flavor = "current_thread")]
async fn rebuild_isolates_a_row_the_store_rejects() {
    let long_title = "x".repeat(600);
    let items = vec![
        json!({"id": "p1", "body": "one"}),
        json!({"id": "p2", "title": long_title, "body": "two"}),
        json!({"id": "p3", "body": "three"}),
        json!({"id": "p4", "body": "four"}),
    ];
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(TitleLimitStore {
        inner: store.clone(),
        max_title_chars: 512,
    });
    let h = harness_over(
        FakeCms::with_items(items),
        four_vectors(),
        UpdaterSettings {
            neighbors: 1,
            page_size: 2,
        },
        store,
        backend,
    );

    let report = h.updater.batch_rebuild(ENDPOINT).await.expect("rebuild");

    assert_eq!(report.pages, 2);
    assert_eq!(report.ingested, 3);
    assert_eq!(report.relinked, 3);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].id, "p2");
    assert!(report.failed[0].error.contains("value too long"));
    assert_eq!(h.store.list_ids().await.unwrap(), vec!["p1", "p3", "p4"]);
    assert_eq!(h.cms.patch_for("p1"), Some(vec!["p3".to_string()]));
    assert_eq!(h.cms.patch_for("p4"), Some(vec!["p3".to_string()]));
    assert_eq!(h.cms.patch_for("p2"), None);
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

fn webhook_harness() -> Harness {
    harness(
        FakeCms::with_items(vec![json!({"id": "a1", "body": "Hello"})]),
        TableEmbedder::new(&[("Hello", [1.0, 0.0])]),
        UpdaterSettings::default(),
    )
}

#[tokio::test(flavor = "current_thread")]
async fn webhook_rejects_bad_signatures_before_any_work() {
    let h = webhook_harness();
    let verifier = SignatureVerifier::new(Some("s3cret"));
    let body = br#"{"api":"blog","id":"a1"}"#;

    let missing = webhook::receive(&verifier, &h.updater, ENDPOINT, body, None).await;
    assert!(matches!(missing, Err(WebhookError::MissingSignature)));

    let forged = sign("wrong", body);
    let invalid = webhook::receive(&verifier, &h.updater, ENDPOINT, body, Some(&forged)).await;
    assert!(matches!(invalid, Err(WebhookError::InvalidSignature)));

    let garbage = b"not json at all";
    let unsigned_garbage =
        webhook::receive(&verifier, &h.updater, ENDPOINT, garbage, Some("00")).await;
    assert!(matches!(unsigned_garbage, Err(WebhookError::InvalidSignature)));

    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 0);
    assert!(h.embedder.calls().is_empty());
    assert!(h.cms.patches().is_empty());
    assert!(h.store.is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn webhook_without_content_id_is_skipped() {
    let h = webhook_harness();
    let verifier = SignatureVerifier::new(None);

    let ack = webhook::receive(&verifier, &h.updater, ENDPOINT, br#"{"api":"blog"}"#, None)
        .await
        .expect("accepted");

    assert_eq!(
        serde_json::to_value(&ack).unwrap(),
        json!({"ok": true, "skipped": "no content id"})
    );
    assert_eq!(h.llm.calls.load(Ordering::SeqCst), 0);
    assert!(h.store.is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn signed_webhook_processes_the_article() {
    let h = webhook_harness();
    let verifier = SignatureVerifier::new(Some("s3cret"));
    let body = br#"{"id":"a1"}"#;
    let signature = sign("s3cret", body);

    let ack = webhook::receive(&verifier, &h.updater, ENDPOINT, body, Some(&signature))
        .await
        .expect("processed");

    assert_eq!(
        serde_json::to_value(&ack).unwrap(),
        json!({"ok": true, "id": "a1", "endpoint": "blog", "neighbors": []})
    );
    assert_eq!(h.store.list_ids().await.unwrap(), vec!["a1"]);

    let open = SignatureVerifier::new(None);
    let malformed = webhook::receive(&open, &h.updater, ENDPOINT, b"[", None).await;
    assert!(matches!(malformed, Err(WebhookError::Payload(_))));
}
