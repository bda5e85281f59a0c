//! Application-level notification messages carried in text frames.
//!
//! ```json
//! {
//!   "messageType": "data",
//!   "event": "update",
//!   "meta": { "requestId": "9f0c…" },
//!   "data": { "id": "51d2…", "objectType": "objects.todos", "title": "…" }
//! }
//! ```
//!
//! `meta` is present when the mutation was made through a request this client
//! may have issued itself, which lets the engine pair the echo with the request.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// What happened to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

/// One pushed mutation made by any writer.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub object_type: String,
    /// The full object as the backend sees it, `id` and `objectType` included.
    pub payload: Map<String, Value>,
    pub request_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum EventParseError {
    #[error("Notification is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Notification messageType '{0}' carries no object event")]
    NotData(String),

    #[error("Notification object has no objectType")]
    MissingObjectType,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(default)]
    message_type: Option<String>,
    event: EventKind,
    #[serde(default)]
    meta: Option<RawMeta>,
    data: Map<String, Value>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RawMessageRef<'a> {
    message_type: &'static str,
    event: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<RawMeta>,
    data: &'a Map<String, Value>,
}

const DATA_MESSAGE: &str = "data";

impl Event {
    pub fn new(kind: EventKind, payload: Map<String, Value>) -> Self {
        let object_type = payload
            .get("objectType")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self {
            kind,
            object_type,
            payload,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Durable id of the object, if the payload carries one.
    pub fn object_id(&self) -> Option<&str> {
        self.payload.get("id").and_then(Value::as_str)
    }

    /// Parse one text message.
    pub fn from_json(text: &str) -> Result<Self, EventParseError> {
        let raw: RawMessage = serde_json::from_str(text)?;
        if let Some(message_type) = raw.message_type {
            if message_type != DATA_MESSAGE {
                return Err(EventParseError::NotData(message_type));
            }
        }
        let object_type = raw
            .data
            .get("objectType")
            .and_then(Value::as_str)
            .ok_or(EventParseError::MissingObjectType)?
            .to_string();
        Ok(Self {
            kind: raw.event,
            object_type,
            payload: raw.data,
            request_id: raw.meta.and_then(|meta| meta.request_id),
        })
    }

    /// Serialize the way the backend sends it.
    pub fn to_json(&self) -> String {
        let raw = RawMessageRef {
            message_type: DATA_MESSAGE,
            event: self.kind,
            meta: self.request_id.clone().map(|request_id| RawMeta {
                request_id: Some(request_id),
            }),
            data: &self.payload,
        };
        // A map of JSON values plus plain strings always serializes.
        serde_json::to_string(&raw).unwrap_or_default()
    }
}
