//! Response normalization.
//!
//! Cassettes answer in many shapes: canonical `NOTICE`/`EVENT`/`EOSE`
//! messages, bare arrays of events, `{"events": [...]}` wrappers, or a single
//! event object. [`normalize_response`] applies a fixed, ordered rule set and
//! returns one [`NormalizedMessage`]. Rule order matters: canonical messages
//! are recognised before the batch heuristics so an `EVENT` is never mistaken
//! for a bare event.

use serde::Serialize;
use serde_json::{json, Value};

use crate::dedup::{entity_id, EventDeduplicator};

pub const EMPTY_RESPONSE: &str = "Error: Empty response from cassette";
pub const CLOSE_NOT_IMPLEMENTED: &str = "Close not implemented";
pub const UNSUPPORTED_MESSAGE: &str = "Unsupported message type";

/// Characters of an unparsable response quoted back in the notice.
const INVALID_PREVIEW_CHARS: usize = 50;

/// The only shapes handed back to callers.
///
/// `raw` holds the cassette's own text for canonical messages, which go
/// back out byte for byte. Messages the host builds carry `None` and are
/// serialized from their fields.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NormalizedMessage {
    Notice {
        text: String,
        #[serde(skip)]
        raw: Option<String>,
    },
    Event {
        subscription_id: Option<String>,
        event: Value,
        #[serde(skip)]
        raw: Option<String>,
    },
    EndOfStream {
        subscription_id: Option<String>,
        #[serde(skip)]
        raw: Option<String>,
    },
    EventBatch(Vec<Value>),
    /// Valid JSON of no recognised shape, returned as the cassette wrote it.
    Passthrough(String),
}

impl NormalizedMessage {
    /// A notice generated by the host.
    pub fn notice(text: impl Into<String>) -> Self {
        Self::Notice {
            text: text.into(),
            raw: None,
        }
    }

    /// Notice text, if this is a notice.
    pub fn as_notice(&self) -> Option<&str> {
        match self {
            Self::Notice { text, .. } => Some(text),
            _ => None,
        }
    }

    /// Canonical wire text.
    pub fn to_wire(&self) -> String {
        match self {
            Self::Notice { raw: Some(raw), .. }
            | Self::Event { raw: Some(raw), .. }
            | Self::EndOfStream { raw: Some(raw), .. } => raw.clone(),
            Self::Notice { text, raw: None } => json!(["NOTICE", text]).to_string(),
            Self::Event {
                subscription_id: Some(sub),
                event,
                raw: None,
            } => json!(["EVENT", sub, event]).to_string(),
            Self::Event {
                subscription_id: None,
                event,
                raw: None,
            } => json!(["EVENT", event]).to_string(),
            Self::EndOfStream {
                subscription_id: Some(sub),
                raw: None,
            } => json!(["EOSE", sub]).to_string(),
            Self::EndOfStream {
                subscription_id: None,
                raw: None,
            } => json!(["EOSE"]).to_string(),
            Self::EventBatch(events) => Value::Array(events.clone()).to_string(),
            Self::Passthrough(text) => text.clone(),
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Self::EndOfStream { .. })
    }
}

impl std::fmt::Display for NormalizedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_wire())
    }
}

fn duplicate_notice(id: &str) -> NormalizedMessage {
    NormalizedMessage::notice(format!("Skipping duplicate event: {id}"))
}

/// Parse `text`, or produce the notice describing why it could not be parsed.
fn parse(text: &str) -> Result<Value, NormalizedMessage> {
    if text.trim().is_empty() {
        return Err(NormalizedMessage::notice(EMPTY_RESPONSE));
    }
    serde_json::from_str(text).map_err(|e| {
        if text.starts_with('[') {
            tracing::warn!("response starts with '[' but is not valid JSON: {e}");
            NormalizedMessage::notice(format!("Error: Invalid response format: {e}"))
        } else {
            let preview: String = text.chars().take(INVALID_PREVIEW_CHARS).collect();
            tracing::warn!("response is not valid JSON: {e}");
            NormalizedMessage::notice(format!("Error: Invalid response: {preview}"))
        }
    })
}

/// Subscription id as text; numeric ids keep their decimal form.
fn subscription(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Recognise `["NOTICE", text]`, `["EVENT", sub, event]`, `["EOSE", sub]`.
///
/// Recognised messages keep `text` as their wire form. An `EVENT` whose id
/// was already seen becomes a suppression notice when a deduplicator is
/// supplied.
fn canonical(
    text: &str,
    items: &[Value],
    dedup: Option<&mut EventDeduplicator>,
) -> Option<NormalizedMessage> {
    if items.len() < 2 {
        return None;
    }
    let raw = Some(text.to_string());
    match items[0].as_str()? {
        "NOTICE" => items[1].as_str().map(|body| NormalizedMessage::Notice {
            text: body.to_string(),
            raw,
        }),
        "EVENT" => {
            let (subscription_id, event) = match items.get(2) {
                Some(event) => (subscription(items.get(1)), event.clone()),
                None => (None, items[1].clone()),
            };
            if let (Some(dedup), Some(id)) = (dedup, entity_id(&event)) {
                if !dedup.add_and_check(&id) {
                    tracing::debug!(event_id = %id, "skipping duplicate event");
                    return Some(duplicate_notice(&id));
                }
            }
            Some(NormalizedMessage::Event {
                subscription_id,
                event,
                raw,
            })
        }
        "EOSE" => Some(NormalizedMessage::EndOfStream {
            subscription_id: subscription(items.get(1)),
            raw,
        }),
        _ => None,
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64() != Some(0.0),
        Some(_) => true,
    }
}

/// First element carries an identifier and a kind.
fn looks_like_event_list(items: &[Value]) -> bool {
    items
        .first()
        .is_some_and(|first| is_truthy(first.get("id")) && first.get("kind").is_some())
}

/// Identifier, author, and kind are all present.
fn looks_like_event(value: &Value) -> bool {
    value.is_object()
        && is_truthy(value.get("id"))
        && is_truthy(value.get("pubkey"))
        && value.get("kind").is_some()
}

fn batch(events: Vec<Value>, dedup: Option<&mut EventDeduplicator>) -> NormalizedMessage {
    match dedup {
        Some(dedup) => {
            let total = events.len();
            let kept = dedup.filter_duplicates(events);
            if kept.len() < total {
                tracing::debug!(dropped = total - kept.len(), "filtered duplicate events");
            }
            NormalizedMessage::EventBatch(kept)
        }
        None => NormalizedMessage::EventBatch(events),
    }
}

/// Normalize the text a cassette returned from `req`.
pub fn normalize_response(text: &str, mut dedup: Option<&mut EventDeduplicator>) -> NormalizedMessage {
    let value = match parse(text) {
        Ok(value) => value,
        Err(notice) => return notice,
    };

    if let Value::Array(items) = &value {
        if let Some(message) = canonical(text, items, dedup.as_deref_mut()) {
            return message;
        }
        if looks_like_event_list(items) {
            return batch(items.clone(), dedup);
        }
    }

    if let Some(Value::Array(events)) = value.get("events") {
        return batch(events.clone(), dedup);
    }

    if looks_like_event(&value) {
        if let (Some(dedup), Some(id)) = (dedup, entity_id(&value)) {
            if !dedup.add_and_check(&id) {
                return duplicate_notice(&id);
            }
        }
        return NormalizedMessage::EventBatch(vec![value]);
    }

    NormalizedMessage::Passthrough(text.to_string())
}

/// Normalize the text a cassette returned from `close`.
///
/// Only the parse checks and canonical recognition apply; close
/// acknowledgements carry no events worth deduplicating.
pub fn normalize_close(text: &str) -> NormalizedMessage {
    let value = match parse(text) {
        Ok(value) => value,
        Err(notice) => return notice,
    };
    if let Value::Array(items) = &value {
        if let Some(message) = canonical(text, items, None) {
            return message;
        }
    }
    NormalizedMessage::Passthrough(text.to_string())
}
