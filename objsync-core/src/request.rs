//! The request interface the engine consumes, and the bookkeeping it keeps for
//! every request in flight.
//!
//! HTTP construction, authentication and the rest of the backend client live
//! behind [`Backend`]. Every `issue_*` call returns immediately with a
//! [`RequestId`]; the matching [`Completion`] is fed back to the engine later,
//! in any order.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::index::EntryId;
use crate::object_ref::{LocalId, ObjectId};
use crate::query::Query;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random request id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outbound side of the backend. Issuing never blocks.
pub trait Backend {
    /// Create an object. `payload` carries `objectType` but no `id`.
    fn issue_create(&mut self, payload: Map<String, Value>) -> RequestId;

    /// Update an object. `delta` carries the changed keys plus `id` and `objectType`.
    fn issue_update(&mut self, id: &ObjectId, delta: Map<String, Value>) -> RequestId;

    fn issue_remove(&mut self, id: &ObjectId, object_type: &str) -> RequestId;

    /// Run a query. Results arrive as `{"results": [...]}`.
    fn issue_query(&mut self, query: &Query) -> RequestId;
}

/// Result of a previously issued request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub request_id: RequestId,
    pub ok: bool,
    pub backend_status: u16,
    /// The object for create/update, `{"results": [...]}` for queries, an
    /// error description on failure.
    pub payload: Value,
}

impl Completion {
    pub fn success(request_id: RequestId, payload: Value) -> Self {
        Self {
            request_id,
            ok: true,
            backend_status: 200,
            payload,
        }
    }

    pub fn failure(request_id: RequestId, backend_status: u16, payload: Value) -> Self {
        Self {
            request_id,
            ok: false,
            backend_status,
            payload,
        }
    }

    pub fn is_not_found(&self) -> bool {
        !self.ok && self.backend_status == 404
    }

    /// The returned object, for create and update completions.
    pub fn object(&self) -> Option<&Map<String, Value>> {
        self.payload.as_object()
    }

    /// Durable id of the returned object.
    pub fn object_id(&self) -> Option<ObjectId> {
        self.object()
            .and_then(|object| object.get("id"))
            .and_then(Value::as_str)
            .map(ObjectId::from)
    }

    /// Query results. Missing or malformed results read as empty.
    pub fn results(&self) -> &[Value] {
        self.payload
            .get("results")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// What a pending request was for, with everything needed to fold its
/// completion back in.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingKind {
    Create {
        local: LocalId,
        entry: EntryId,
    },
    Update {
        object: ObjectId,
        entry: EntryId,
        /// Row content to restore if the update is rejected.
        previous: Map<String, Value>,
    },
    Remove {
        object: ObjectId,
        entry: EntryId,
    },
    FullQuery {
        generation: u64,
    },
    FetchMore {
        generation: u64,
        offset: usize,
        limit: usize,
    },
}

impl PendingKind {
    pub fn name(&self) -> &'static str {
        match self {
            PendingKind::Create { .. } => "create",
            PendingKind::Update { .. } => "update",
            PendingKind::Remove { .. } => "remove",
            PendingKind::FullQuery { .. } => "query",
            PendingKind::FetchMore { .. } => "fetch more",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub request_id: RequestId,
    pub kind: PendingKind,
    pub sent_at: Instant,
}

impl RequestRecord {
    pub fn new(request_id: RequestId, kind: PendingKind) -> Self {
        Self {
            request_id,
            kind,
            sent_at: Instant::now(),
        }
    }
}
