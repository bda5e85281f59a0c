//! The mirrored collection as observers see it.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::object_ref::{ObjectId, ObjectRef};

/// One row: the object payload plus its identity.
///
/// Durable rows carry their `id` inside the payload too; temporary rows have
/// no `id` key until the create is confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub object: ObjectRef,
    pub payload: Map<String, Value>,
}

impl Item {
    pub fn new(object: ObjectRef, payload: Map<String, Value>) -> Self {
        Self { object, payload }
    }

    /// A row straight from the backend. `None` if the payload has no `id`.
    pub fn durable(payload: Map<String, Value>) -> Option<Self> {
        let id = payload.get("id").and_then(Value::as_str)?.to_string();
        Some(Self {
            object: ObjectRef::Durable(ObjectId::from(id)),
            payload,
        })
    }

    pub fn id(&self) -> Option<&ObjectId> {
        self.object.durable()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

/// Ordered change notification. Ranges are half-open: `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "camelCase")]
pub enum ModelChange {
    RangeInserted { start: usize, end: usize },
    RangeRemoved { start: usize, end: usize },
    /// Payload or synced flag of one row changed.
    RowChanged { row: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowSnapshot {
    pub object: ObjectRef,
    pub payload: Map<String, Value>,
    /// `false` while requests referencing the row are in flight.
    pub synced: bool,
}

/// Immutable copy of the collection, safe to hand to other tasks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionSnapshot {
    rows: Vec<RowSnapshot>,
}

impl CollectionSnapshot {
    pub fn new(rows: Vec<RowSnapshot>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, row: usize) -> Option<&RowSnapshot> {
        self.rows.get(row)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RowSnapshot> {
        self.rows.iter()
    }

    /// Durable ids in row order; temporary rows are skipped.
    pub fn ids(&self) -> Vec<&str> {
        self.rows
            .iter()
            .filter_map(|row| row.object.durable().map(ObjectId::as_str))
            .collect()
    }

    /// Row of the object with durable id `id`.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.rows
            .iter()
            .position(|row| row.object.durable().map(ObjectId::as_str) == Some(id))
    }
}
