//! Canonical rewrite of article text through a language model.
//!
//! The model is asked for a numbered, sectioned rewrite. Section 11 carries the
//! canonical body and section 3 an optional summary; everything else in the
//! answer is kept only as `raw_output` for inspection.

use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use crate::html::html_to_text;
use crate::llm::{LlmProvider, ProviderRequest};

/// System instruction: preserve facts, forbid invention, always emit section 11.
pub const SYSTEM_PROMPT: &str = concat!(
    "あなたは歴史・人文学分野に精通した編集者かつ学術ライターです。",
    "与えられた記事テキストを、体裁の違い（対談/学会評/書評/展覧会評/研究/随筆など）を吸収して、",
    "内容を正確に維持したまま日本語で一貫性ある標準形に整えます。",
    "事実の追加・憶測は禁止。UIや広告などノイズは削除。見出しは簡潔。",
    "出力は章立ての自然言語で、特に『11) 正規化本文』を明確に示してください。",
);

const MAX_OUTPUT_TOKENS: usize = 16384;

static BODY_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*11\)\s*正規化本文\s*\n").expect("body marker"));
static AFTER_BODY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*1[2-9]\)\s*").expect("post-body heading"));
static SUMMARY_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*3\)\s*要約\s*\n").expect("summary marker"));
static AFTER_SUMMARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*4\)").expect("post-summary heading"));

/// Optional per-article context passed to the model alongside the body.
#[derive(Debug, Clone, Default)]
pub struct ArticleHints<'a> {
    /// Publish (or creation) timestamp as given by the CMS.
    pub published_at: Option<&'a str>,
    /// Authors or participants.
    pub authors: Option<&'a str>,
    /// Genre hint (interview, review, essay, ...).
    pub type_hint: Option<&'a str>,
}

/// Result of one normalization call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedArticle {
    /// Canonical body; the cleaned input when the model omitted section 11.
    pub canonical_text: String,
    /// Section 3 summary, empty when absent.
    pub summary: String,
    /// Full model answer.
    pub raw_output: String,
}

/// Cleans markup and asks the model for the canonical rewrite.
#[derive(Clone)]
pub struct TextNormalizer {
    provider: Arc<dyn LlmProvider>,
}

impl TextNormalizer {
    /// Builds a normalizer on top of a chat provider.
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    /// Normalizes one article. Model errors propagate unchanged; a missing
    /// section 11 falls back to the cleaned text.
    pub async fn normalize(
        &self,
        title: &str,
        raw_body: &str,
        hints: &ArticleHints<'_>,
    ) -> Result<NormalizedArticle> {
        let article_text = html_to_text(raw_body);
        let prompt = user_prompt(title, &article_text, hints);
        let raw_output = self
            .provider
            .complete(&ProviderRequest {
                system: SYSTEM_PROMPT,
                prompt: &prompt,
                max_tokens: MAX_OUTPUT_TOKENS,
            })
            .await
            .context("normalization model call failed")?;

        let sections = extract_sections(&raw_output);
        let canonical_text = if sections.body.is_empty() {
            debug!(title, "model output lacked canonical body; using cleaned text");
            article_text
        } else {
            sections.body
        };
        Ok(NormalizedArticle {
            canonical_text,
            summary: sections.summary,
            raw_output,
        })
    }
}

/// Builds the per-article user message.
pub fn user_prompt(title: &str, article_text: &str, hints: &ArticleHints<'_>) -> String {
    format!(
        "入力情報:\n\
         - タイトル: {title}\n\
         - 投稿日時: {published_at}\n\
         - 著者/参加者: {authors}\n\
         - 種別ヒント: {type_hint}\n\n\
         本文:\n```\n{article_text}\n```\n\n\
         タスク:\n1) 指示どおりに章立てで自然言語の標準形へ整形\n\
         2) 曖昧・不明は『不明』と記載\n\
         3) 最後に『11) 正規化本文』を必ず含める\n",
        published_at = hints.published_at.unwrap_or(""),
        authors = hints.authors.unwrap_or(""),
        type_hint = hints.type_hint.unwrap_or(""),
    )
}

/// Sections scanned out of a model answer; empty strings when missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedSections {
    /// Section 11 up to the next 12)-19) heading or end of output.
    pub body: String,
    /// Section 3 up to the 4) heading or end of output.
    pub summary: String,
}

/// Scans the model answer for the canonical body and summary sections.
pub fn extract_sections(output: &str) -> ExtractedSections {
    let body = section_after(output, &BODY_MARKER, &AFTER_BODY);
    let summary = section_after(output, &SUMMARY_MARKER, &AFTER_SUMMARY);
    ExtractedSections { body, summary }
}

fn section_after(output: &str, start: &Regex, end: &Regex) -> String {
    let Some(marker) = start.find(output) else {
        return String::new();
    };
    let rest = &output[marker.end()..];
    let section = match end.find(rest) {
        Some(next) => &rest[..next.start()],
        None => rest,
    };
    section.trim().to_string()
}
