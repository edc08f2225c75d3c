//! News Message Types
//!
//! Canonical outbound payloads for the live news stream and the normalizer
//! that turns raw broker bodies into them.
//!
//! # Normalization
//!
//! ```text
//! bytes ──► JSON ──► object? ──► NewsItem valid? ──► BroadcastMessage::News
//!             │         │                 │
//!             ▼         ▼                 └──────► BroadcastMessage::Passthrough
//!          Decode   NotAnObject
//!        (dropped)   (dropped)
//! ```
//!
//! Producers that publish shapes not yet covered by [`NewsItem`] still reach
//! subscribers as a passthrough object, byte for byte as published.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::value::RawValue;

// =============================================================================
// Types
// =============================================================================

/// A typed news record published on the broadcast exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsItem {
    /// Headline.
    pub title: String,
    /// Short summary.
    #[serde(default, rename = "abstract")]
    pub summary: Option<String>,
    /// Cover image URL.
    #[serde(default)]
    pub cover: Option<String>,
    /// Publication time as Unix epoch seconds.
    pub published_at: i64,
    /// URL of the article at its origin.
    #[serde(default)]
    pub origin_url: Option<String>,
    /// Canonical URL of the article.
    pub url: String,
    /// Identifier of the source feed.
    #[serde(default)]
    pub source_id: Option<String>,
    /// Kind of source (e.g. `twitter`, `rss`).
    #[serde(default)]
    pub source_type: Option<String>,
    /// Display name of the source.
    #[serde(default)]
    pub source_name: Option<String>,
    /// News category.
    #[serde(default, rename = "type")]
    pub category: Option<String>,
    /// Ordering key assigned by the producer.
    #[serde(default)]
    pub sort: Option<i64>,
}

impl NewsItem {
    /// Field-level checks that serde cannot express.
    fn validate(&self) -> bool {
        !self.title.trim().is_empty() && !self.url.trim().is_empty() && self.published_at >= 0
    }
}

/// Payload delivered to every connected client.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BroadcastMessage {
    /// Message that matched the typed news schema.
    News(NewsItem),
    /// Any other JSON object, kept as its original text so key order and
    /// number precision survive the round trip.
    Passthrough(Box<RawValue>),
}

impl BroadcastMessage {
    /// Label used for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::News(_) => "news",
            Self::Passthrough(_) => "passthrough",
        }
    }

    /// Whether this message matched the typed schema.
    #[must_use]
    pub const fn is_news(&self) -> bool {
        matches!(self, Self::News(_))
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Reasons a broker payload cannot be broadcast.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    /// Body is not valid UTF-8 JSON.
    #[error("malformed JSON payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// Body is JSON but not an object.
    #[error("payload is a JSON {0}, expected an object")]
    NotAnObject(&'static str),
}

// =============================================================================
// Normalizer
// =============================================================================

/// Convert a raw broker body into the canonical outbound shape.
///
/// # Errors
///
/// Returns [`NormalizeError`] when the body is not JSON or not a JSON object.
/// A JSON object that fails typed validation is not an error; it is returned
/// as [`BroadcastMessage::Passthrough`].
pub fn normalize(body: &[u8]) -> Result<BroadcastMessage, NormalizeError> {
    let raw: Box<RawValue> = serde_json::from_slice(body)?;

    if !raw.get().starts_with('{') {
        let value: Value = serde_json::from_str(raw.get())?;
        return Err(NormalizeError::NotAnObject(json_kind(&value)));
    }

    match serde_json::from_str::<NewsItem>(raw.get()) {
        Ok(item) if item.validate() => Ok(BroadcastMessage::News(item)),
        Ok(_) => {
            tracing::debug!("News item failed field validation, forwarding as passthrough");
            Ok(BroadcastMessage::Passthrough(raw))
        }
        Err(e) => {
            tracing::debug!(error = %e, "Payload does not match news schema, forwarding as passthrough");
            Ok(BroadcastMessage::Passthrough(raw))
        }
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Tests
// =============================================================================
