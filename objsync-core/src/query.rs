//! The query a collection mirrors.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Object type, filter, sort and paging window.
///
/// Serialized the way the backend expects it, e.g.
/// `{"objectType":"objects.todos","query":{"done":false},"limit":50}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Query {
    pub object_type: String,
    #[serde(rename = "query", skip_serializing_if = "Map::is_empty")]
    pub filter: Map<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "is_zero")]
    pub offset: usize,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

impl Query {
    pub fn new(object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.filter.insert(key.into(), value);
        self
    }

    pub fn with_sort(mut self, sort: Value) -> Self {
        self.sort.push(sort);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// A query without an object type mirrors nothing.
    pub fn is_empty(&self) -> bool {
        self.object_type.is_empty()
    }

    /// The same query restricted to one page.
    pub fn page(&self, offset: usize, limit: usize) -> Query {
        Query {
            offset,
            limit: Some(limit),
            ..self.clone()
        }
    }

    /// Whether a pushed object belongs to this query.
    ///
    /// Plain filter fields must match exactly. Operator expressions (`$`-keys)
    /// are left to the backend and always pass.
    pub fn matches(&self, object: &Map<String, Value>) -> bool {
        if self.is_empty() {
            return false;
        }
        let object_type = object.get("objectType").and_then(Value::as_str);
        if object_type != Some(self.object_type.as_str()) {
            return false;
        }
        self.filter.iter().all(|(key, expected)| {
            if key.starts_with('$') || is_operator(expected) {
                return true;
            }
            object.get(key) == Some(expected)
        })
    }
}

fn is_operator(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.keys().any(|key| key.starts_with('$')))
}
