//! Loosely typed CMS payloads and the field policy used to read them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Title fields, first non-empty string wins.
pub const TITLE_FIELDS: &[&str] = &["title", "name"];

/// Body fields, first non-empty string wins.
pub const BODY_FIELDS: &[&str] = &["contents", "content", "body", "text", "html", "description"];

/// Publish timestamp fields, first non-empty string wins.
pub const PUBLISHED_FIELDS: &[&str] = &["publishedAt", "createdAt"];

/// Field list requested from list calls so every policy field is present.
pub const REQUESTED_FIELDS: &str =
    "id,title,contents,content,body,text,html,description,publishedAt,createdAt";

/// One content item as returned by the CMS.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentItem(Map<String, Value>);

impl ContentItem {
    /// Wraps a JSON object.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// The `id` field, stringified when numeric.
    pub fn id(&self) -> Option<String> {
        match self.0.get("id")? {
            Value::String(id) if !id.is_empty() => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }

    /// Raw field access.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// First non-empty string among `fields`, in order.
    pub fn first_text(&self, fields: &[&str]) -> Option<&str> {
        fields.iter().find_map(|name| match self.0.get(*name) {
            Some(Value::String(text)) if !text.is_empty() => Some(text.as_str()),
            _ => None,
        })
    }

    /// Applies the title/body policy.
    ///
    /// When no body field holds text, the whole payload serialized as JSON
    /// becomes the body, so extraction itself never fails.
    pub fn to_source(&self) -> ArticleSource {
        let title = self.first_text(TITLE_FIELDS).unwrap_or_default().to_string();
        let body = match self.first_text(BODY_FIELDS) {
            Some(body) => body.to_string(),
            None => serde_json::to_string(&self.0).unwrap_or_default(),
        };
        ArticleSource {
            id: self.id(),
            title,
            body,
            published_at: self.first_text(PUBLISHED_FIELDS).map(str::to_string),
        }
    }
}

impl From<Map<String, Value>> for ContentItem {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Title/body view of a content item handed to the normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleSource {
    /// Content id, when the payload carried one.
    pub id: Option<String>,
    /// Title, empty when none of [`TITLE_FIELDS`] was set.
    pub title: String,
    /// Raw markup or text.
    pub body: String,
    /// Publish hint for the model.
    pub published_at: Option<String>,
}

impl ArticleSource {
    /// Title as stored: `None` when empty.
    pub fn stored_title(&self) -> Option<String> {
        (!self.title.is_empty()).then(|| self.title.clone())
    }
}
