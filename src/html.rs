//! Markup cleanup applied before articles are sent to the language model.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Node};

/// Elements whose text never belongs to the article body.
pub const NOISE_TAGS: &[&str] = &["script", "style", "nav", "footer", "header", "noscript"];

/// Share/copyright banners; a line is cut from the first match to its end.
pub const BOILERPLATE_PHRASES: &[&str] = &["シェア", "共有", "COPY", "著作権", "All rights reserved"];

static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n+").expect("blank-run pattern"));
static INLINE_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("inline-space pattern"));
static BOILERPLATE: LazyLock<Regex> = LazyLock::new(|| {
    let alternatives = BOILERPLATE_PHRASES
        .iter()
        .map(|phrase| regex::escape(phrase))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!("(?im)({alternatives}).*$")).expect("boilerplate pattern")
});

/// Converts HTML (or plain text, which parses as a single text node) into
/// cleaned plain text.
pub fn html_to_text(input: &str) -> String {
    let document = Html::parse_document(input);
    let mut pieces = Vec::new();
    for node in document.root_element().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let in_noise = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|element| NOISE_TAGS.contains(&element.name()))
        });
        if !in_noise {
            pieces.push(&**text);
        }
    }
    clean_text(&pieces.join("\n"))
}

/// Whitespace collapsing and boilerplate trimming on already-extracted text.
pub fn clean_text(raw: &str) -> String {
    let text = BLANK_RUNS.replace_all(raw, "\n\n");
    let text = INLINE_SPACE.replace_all(&text, " ");
    let text = BOILERPLATE.replace_all(text.trim(), "");
    text.trim().to_string()
}
