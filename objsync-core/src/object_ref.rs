//! Object identity: temporary (client-side, before the create is confirmed)
//! or durable (assigned by the backend).

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client-generated placeholder for an object whose create is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(Uuid);

impl LocalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tmp-{}", self.0)
    }
}

/// Backend-assigned identifier, stable for the object's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ObjectId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ObjectId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a row's object.
///
/// The two variants never compare equal, so a pushed notification can never be
/// mistaken for a row that is still waiting for its create.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectRef {
    Temporary(LocalId),
    Durable(ObjectId),
}

impl ObjectRef {
    pub fn is_temporary(&self) -> bool {
        matches!(self, ObjectRef::Temporary(_))
    }

    pub fn durable(&self) -> Option<&ObjectId> {
        match self {
            ObjectRef::Durable(id) => Some(id),
            ObjectRef::Temporary(_) => None,
        }
    }

    pub fn local(&self) -> Option<LocalId> {
        match self {
            ObjectRef::Temporary(local) => Some(*local),
            ObjectRef::Durable(_) => None,
        }
    }
}

impl From<LocalId> for ObjectRef {
    fn from(local: LocalId) -> Self {
        ObjectRef::Temporary(local)
    }
}

impl From<ObjectId> for ObjectRef {
    fn from(id: ObjectId) -> Self {
        ObjectRef::Durable(id)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectRef::Temporary(local) => local.fmt(f),
            ObjectRef::Durable(id) => id.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_never_equals_durable() {
        let local = LocalId::new();
        let durable = ObjectRef::Durable(ObjectId::new(local.to_string()));
        assert_ne!(ObjectRef::Temporary(local), durable);
        assert!(ObjectRef::from(local).is_temporary());
        assert!(durable.durable().is_some());
    }

    #[test]
    fn test_local_ids_are_unique() {
        assert_ne!(LocalId::new(), LocalId::new());
        assert!(LocalId::new().to_string().starts_with("tmp-"));
    }

    #[test]
    fn test_object_id_serializes_as_string() {
        let id = ObjectId::from("51d2");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"51d2\"");
    }
}
