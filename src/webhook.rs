//! Content-changed webhook: signature check and payload decoding.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, warn};

use crate::pipeline::RelationUpdater;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the raw request body.
pub const SIGNATURE_HEADER: &str = "x-microcms-signature";

/// Reasons an incoming event is rejected before any processing.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// Verification is enabled but the request carried no signature.
    #[error("missing webhook signature")]
    MissingSignature,
    /// Signature did not match the body.
    #[error("invalid webhook signature")]
    InvalidSignature,
    /// Body was not the expected JSON object.
    #[error("malformed webhook payload: {0}")]
    Payload(#[from] serde_json::Error),
    /// The relation update itself failed.
    #[error("{0:#}")]
    Processing(anyhow::Error),
}

impl WebhookError {
    /// True for rejections caused by the signature check.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::MissingSignature | Self::InvalidSignature)
    }
}

/// Verifies, decodes, and processes one raw webhook delivery.
///
/// The signature is checked before the body is parsed; an event without a
/// content id is acknowledged as skipped and never reaches the updater.
pub async fn receive(
    verifier: &SignatureVerifier,
    updater: &RelationUpdater,
    default_endpoint: &str,
    body: &[u8],
    signature: Option<&str>,
) -> Result<WebhookAck, WebhookError> {
    verifier.verify(body, signature)?;
    let event = WebhookEvent::parse(body)?;
    let endpoint = event.endpoint(default_endpoint).to_string();
    let Some(content_id) = event.content_id() else {
        debug!(%endpoint, "webhook without content id");
        return Ok(WebhookAck::skipped("no content id"));
    };
    let outcome = updater
        .handle_event(&endpoint, &content_id)
        .await
        .map_err(WebhookError::Processing)?;
    if !outcome.propagation.failed.is_empty() {
        warn!(
            %content_id,
            failed = outcome.propagation.failed.len(),
            "some neighbors could not be relinked"
        );
    }
    Ok(WebhookAck::processed(
        content_id,
        endpoint,
        outcome.neighbors,
    ))
}

/// HMAC-SHA256 verifier; without a secret every request passes.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Option<Vec<u8>>,
}

impl SignatureVerifier {
    /// An empty or absent secret disables verification.
    pub fn new(secret: Option<&str>) -> Self {
        let secret = secret
            .filter(|secret| !secret.is_empty())
            .map(|secret| secret.as_bytes().to_vec());
        Self { secret }
    }

    /// True when a secret is configured.
    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Checks `signature` against the raw `body` in constant time.
    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> Result<(), WebhookError> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };
        let signature = signature
            .map(str::trim)
            .filter(|sig| !sig.is_empty())
            .ok_or(WebhookError::MissingSignature)?;
        let expected = hex::decode(signature).map_err(|_| WebhookError::InvalidSignature)?;
        let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| WebhookError::InvalidSignature)?;
        mac.update(body);
        mac.verify_slice(&expected)
            .map_err(|_| WebhookError::InvalidSignature)
    }
}

/// Decoded webhook body. Only `api` and `id` matter here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookEvent {
    /// Endpoint (collection) name of the changed content.
    #[serde(default)]
    pub api: Option<String>,
    /// Changed content id.
    #[serde(default)]
    pub id: Option<Value>,
}

impl WebhookEvent {
    /// Parses the raw body.
    pub fn parse(body: &[u8]) -> Result<Self, WebhookError> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Endpoint from the payload, or `default` when absent or empty.
    pub fn endpoint<'a>(&'a self, default: &'a str) -> &'a str {
        self.api
            .as_deref()
            .filter(|api| !api.is_empty())
            .unwrap_or(default)
    }

    /// Content id, stringified when numeric; `None` when absent or empty.
    pub fn content_id(&self) -> Option<String> {
        match self.id.as_ref()? {
            Value::String(id) if !id.is_empty() => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }
}

/// JSON acknowledgement returned to the webhook sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookAck {
    /// Always true for accepted events.
    pub ok: bool,
    /// Set when the event was accepted but not processed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    /// Processed content id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Endpoint the event was processed against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Neighbors written for the content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neighbors: Option<Vec<String>>,
}

impl WebhookAck {
    /// Accepted without processing.
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            ok: true,
            skipped: Some(reason.into()),
            id: None,
            endpoint: None,
            neighbors: None,
        }
    }

    /// Processed successfully.
    pub fn processed(id: String, endpoint: String, neighbors: Vec<String>) -> Self {
        Self {
            ok: true,
            skipped: None,
            id: Some(id),
            endpoint: Some(endpoint),
            neighbors: Some(neighbors),
        }
    }
}
