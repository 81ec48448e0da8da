//! Embedding model clients.

use anyhow::Result;
use async_trait::async_trait;

use crate::vector::Embedding;

pub mod openai;

pub use openai::OpenAiEmbedder;

/// Maps canonical text to a fixed-dimension vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embeds one text. Service errors surface unchanged.
    async fn embed(&self, text: &str) -> Result<Embedding>;

    /// Dimension every returned vector has.
    fn dimension(&self) -> usize;
}

/// Cuts `text` to at most `max_chars` characters, on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}
