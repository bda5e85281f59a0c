use serde_json::Value;
use thiserror::Error;

use crate::index::{EntryId, RowSlot};
use crate::object_ref::ObjectRef;

/// Row/identity bookkeeping went out of sync with the collection.
///
/// Always a reconciliation bug; the engine logs every one at error level.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndexError {
    #[error("No index entry for object {0}")]
    UnknownObject(ObjectRef),

    #[error("Index entry {0:?} no longer exists")]
    UnknownEntry(EntryId),

    #[error("Row {row} is out of range (index holds {len} rows)")]
    RowOutOfRange { row: usize, len: usize },

    #[error("Object {object} is indexed at {actual:?}, expected row {expected}")]
    RowMismatch {
        object: ObjectRef,
        expected: usize,
        actual: RowSlot,
    },

    #[error("Object {0} is already present on another row")]
    DuplicateObject(ObjectRef),

    #[error("Reference count of {0} dropped below zero")]
    RefUnderflow(ObjectRef),

    #[error("Temporary row {0} has no pending create")]
    MissingPendingCreate(ObjectRef),
}

/// Why a single operation's reply resolved with an error.
///
/// These are per-request and recoverable; the collection heals itself.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OperationError {
    #[error("Backend rejected the request with status {status}")]
    Backend { status: u16, payload: Value },

    #[error("The query was changed before the request could be sent")]
    StaleRequest,

    #[error("Dependent create failed, so the object could not be {operation}")]
    DependentCreateFailed { operation: &'static str },

    #[error("Row {row} is out of range (row count {len})")]
    InvalidRow { row: usize, len: usize },

    #[error("Property '{0}' is read-only")]
    ReadOnlyProperty(String),

    #[error("Internal inconsistency: {0}")]
    Internal(#[from] IndexError),

    #[error("The engine was dropped before the request completed")]
    EngineDropped,
}

impl OperationError {
    pub fn status(&self) -> Option<u16> {
        match self {
            OperationError::Backend { status, .. } => Some(*status),
            _ => None,
        }
    }
}
