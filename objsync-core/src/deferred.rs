//! Operations waiting for a create to finish.
//!
//! A remove or update on a row whose create is still in flight cannot be sent
//! yet: the backend id is unknown. It waits here, keyed by the create's
//! request id, and is dispatched when that create's completion is folded in.

use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

use crate::index::EntryId;
use crate::reply::Responder;
use crate::request::RequestId;

#[derive(Debug)]
pub(crate) enum DeferredAction {
    Remove,
    SetProperty {
        key: String,
        value: Value,
        /// Value of `key` before the optimistic write, for rollback.
        prior: Option<Value>,
    },
}

impl DeferredAction {
    pub(crate) fn verb(&self) -> &'static str {
        match self {
            DeferredAction::Remove => "removed",
            DeferredAction::SetProperty { .. } => "updated",
        }
    }
}

#[derive(Debug)]
pub(crate) struct DeferredOp {
    /// Entry referenced on the op's behalf; released at dispatch.
    pub(crate) entry: EntryId,
    pub(crate) action: DeferredAction,
    pub(crate) responder: Responder,
}

#[derive(Debug, Default)]
pub(crate) struct DeferredOps {
    by_create: FxHashMap<RequestId, Vec<DeferredOp>>,
}

impl DeferredOps {
    pub(crate) fn queue(&mut self, create: RequestId, op: DeferredOp) {
        self.by_create.entry(create).or_default().push(op);
    }

    /// Everything waiting on `create`, in call order.
    pub(crate) fn take(&mut self, create: &RequestId) -> Vec<DeferredOp> {
        self.by_create.remove(create).unwrap_or_default()
    }

    /// Write the values of property updates waiting on `create` over
    /// `payload`, later updates winning.
    pub(crate) fn overlay(&self, create: &RequestId, payload: &mut Map<String, Value>) {
        let Some(ops) = self.by_create.get(create) else {
            return;
        };
        for op in ops {
            if let DeferredAction::SetProperty { key, value, .. } = &op.action {
                payload.insert(key.clone(), value.clone());
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.by_create.values().map(Vec::len).sum()
    }
}
