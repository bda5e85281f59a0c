//! Row/identity index.
//!
//! Maps between the three ways the engine refers to a row:
//!
//! ```text
//!   row (0..N) ──► rows[row] ───┐
//!   ObjectRef ──► by_object ────┼──► EntryId ──► AttachedData { row, object, ref_count, .. }
//!   RequestId ──► by_request ───┘
//! ```
//!
//! Entries live in stable slots. An `EntryId` is never reused, so a pending
//! request keeps pointing at the right entry across removals, confirmations
//! and query resets. An entry outlives its row while requests still reference
//! it and is collected when the last reference is released.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::IndexError;
use crate::object_ref::{LocalId, ObjectId, ObjectRef};
use crate::request::RequestId;

/// Number of paths that may report the same request: its Completion and its
/// echo Event.
const REQUEST_RESOLUTIONS: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

/// Where an entry currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSlot {
    Live(usize),
    /// The row is gone; the entry survives only while referenced.
    Deleted,
}

impl RowSlot {
    pub fn live(self) -> Option<usize> {
        match self {
            RowSlot::Live(row) => Some(row),
            RowSlot::Deleted => None,
        }
    }
}

/// Per-row bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachedData {
    pub row: RowSlot,
    pub object: ObjectRef,
    /// In-flight operations referencing this row. Zero means synced.
    pub ref_count: u32,
    pub pending_create: Option<RequestId>,
    /// Temporary id the entry was created under; still resolves after confirmation.
    pub local_id: Option<LocalId>,
}

#[derive(Debug, Default)]
pub struct RowIndex {
    next_entry: u64,
    entries: FxHashMap<EntryId, AttachedData>,
    by_object: FxHashMap<ObjectRef, EntryId>,
    rows: Vec<EntryId>,
    by_request: FxHashMap<RequestId, (u8, EntryId)>,
}

impl RowIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Entries held, including deleted ones that are still referenced.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Requests still waiting for one of their two resolutions.
    pub fn tracked_requests(&self) -> usize {
        self.by_request.len()
    }

    pub fn get(&self, entry: EntryId) -> Option<&AttachedData> {
        self.entries.get(&entry)
    }

    pub fn entry_at(&self, row: usize) -> Option<EntryId> {
        self.rows.get(row).copied()
    }

    pub fn entry_for(&self, object: &ObjectRef) -> Option<EntryId> {
        self.by_object.get(object).copied()
    }

    /// Whether any entry, live or deleted, is known under `object`.
    pub fn contains(&self, object: &ObjectRef) -> bool {
        self.by_object.contains_key(object)
    }

    pub fn row_of(&self, entry: EntryId) -> Option<usize> {
        self.entries.get(&entry).and_then(|data| data.row.live())
    }

    pub fn row_from_object(&self, object: &ObjectRef) -> Option<usize> {
        self.entry_for(object).and_then(|entry| self.row_of(entry))
    }

    pub fn row_from_durable(&self, id: &ObjectId) -> Option<usize> {
        self.row_from_object(&ObjectRef::Durable(id.clone()))
    }

    pub fn row_from_request(&self, request: &RequestId) -> Option<usize> {
        self.by_request
            .get(request)
            .and_then(|(_, entry)| self.row_of(*entry))
    }

    /// `None` for an out-of-range row.
    pub fn is_synced(&self, row: usize) -> Option<bool> {
        let entry = self.entry_at(row)?;
        self.entries.get(&entry).map(|data| data.ref_count == 0)
    }

    // ─── Rows ───────────────────────────────────────────────────────

    pub fn insert(&mut self, row: usize, object: ObjectRef) -> Result<EntryId, IndexError> {
        let mut ids = self.insert_range(row, vec![object])?;
        ids.pop().ok_or(IndexError::RowOutOfRange { row, len: self.len() })
    }

    /// Insert one contiguous run of rows starting at `row`.
    pub fn insert_range(
        &mut self,
        row: usize,
        objects: Vec<ObjectRef>,
    ) -> Result<Vec<EntryId>, IndexError> {
        if row > self.rows.len() {
            return Err(IndexError::RowOutOfRange {
                row,
                len: self.rows.len(),
            });
        }
        let mut seen = FxHashSet::default();
        for object in &objects {
            if self.row_from_object(object).is_some() || !seen.insert(object) {
                return Err(IndexError::DuplicateObject(object.clone()));
            }
        }

        let ids: Vec<EntryId> = objects
            .into_iter()
            .map(|object| {
                let id = self.allocate(object.clone());
                self.by_object.insert(object, id);
                id
            })
            .collect();
        self.rows.splice(row..row, ids.iter().copied());
        self.reindex_after_insertion(row);
        Ok(ids)
    }

    /// Rewrite the row of every entry from `row` onwards.
    pub fn reindex_after_insertion(&mut self, row: usize) {
        for (position, id) in self.rows.iter().enumerate().skip(row) {
            if let Some(data) = self.entries.get_mut(id) {
                data.row = RowSlot::Live(position);
            }
        }
    }

    /// Drop `row`, shift every later row down by one and mark the removed
    /// entry `Deleted`. The entry is collected right away when unreferenced.
    pub fn reindex_after_removal(&mut self, row: usize) -> Result<EntryId, IndexError> {
        if row >= self.rows.len() {
            return Err(IndexError::RowOutOfRange {
                row,
                len: self.rows.len(),
            });
        }
        let removed = self.rows.remove(row);
        self.reindex_after_insertion(row);

        let data = self
            .entries
            .get_mut(&removed)
            .ok_or(IndexError::UnknownEntry(removed))?;
        data.row = RowSlot::Deleted;
        if data.ref_count == 0 {
            self.collect(removed);
        }
        Ok(removed)
    }

    /// Rebuild after a full query. Entries still referenced by in-flight
    /// requests survive: they move to their object's new row, or become
    /// `Deleted` when the object is not part of the new result.
    pub fn reset(&mut self, objects: Vec<ObjectRef>) -> Result<(), IndexError> {
        let mut seen = FxHashSet::default();
        for object in &objects {
            if !seen.insert(object) {
                return Err(IndexError::DuplicateObject(object.clone()));
            }
        }

        let previous = std::mem::take(&mut self.entries);
        self.by_object.clear();
        self.rows.clear();

        for (id, mut data) in previous {
            if data.ref_count == 0 {
                continue;
            }
            data.row = RowSlot::Deleted;
            if let Some(local) = data.local_id {
                self.by_object.insert(ObjectRef::Temporary(local), id);
            }
            self.by_object.insert(data.object.clone(), id);
            self.entries.insert(id, data);
        }

        for (row, object) in objects.into_iter().enumerate() {
            let reusable = self
                .by_object
                .get(&object)
                .copied()
                .filter(|id| self.entries.contains_key(id));
            let id = match reusable {
                Some(id) => id,
                None => {
                    let id = self.allocate(object.clone());
                    self.by_object.insert(object, id);
                    id
                }
            };
            if let Some(data) = self.entries.get_mut(&id) {
                data.row = RowSlot::Live(row);
            }
            self.rows.push(id);
        }

        // Requests on dropped entries can no longer affect a row.
        let entries = &self.entries;
        self.by_request.retain(|_, (_, id)| entries.contains_key(id));
        Ok(())
    }

    // ─── References ─────────────────────────────────────────────────

    /// Take a reference on the entry for `object`, which must sit at `row`.
    pub fn ref_object(&mut self, object: &ObjectRef, row: usize) -> Result<EntryId, IndexError> {
        let id = self
            .entry_for(object)
            .ok_or_else(|| IndexError::UnknownObject(object.clone()))?;
        let data = self
            .entries
            .get_mut(&id)
            .ok_or(IndexError::UnknownEntry(id))?;
        if data.row != RowSlot::Live(row) {
            return Err(IndexError::RowMismatch {
                object: object.clone(),
                expected: row,
                actual: data.row,
            });
        }
        data.ref_count += 1;
        Ok(id)
    }

    /// Take a reference on whatever entry occupies `row`.
    pub fn ref_row(&mut self, row: usize) -> Result<EntryId, IndexError> {
        let id = self.entry_at(row).ok_or(IndexError::RowOutOfRange {
            row,
            len: self.rows.len(),
        })?;
        let data = self
            .entries
            .get_mut(&id)
            .ok_or(IndexError::UnknownEntry(id))?;
        data.ref_count += 1;
        Ok(id)
    }

    pub fn deref(&mut self, object: &ObjectRef) -> Result<AttachedData, IndexError> {
        let id = self
            .entry_for(object)
            .ok_or_else(|| IndexError::UnknownObject(object.clone()))?;
        self.deref_entry(id)
    }

    /// Release one reference. Returns the entry as it was after the release.
    pub fn deref_entry(&mut self, id: EntryId) -> Result<AttachedData, IndexError> {
        let data = self
            .entries
            .get_mut(&id)
            .ok_or(IndexError::UnknownEntry(id))?;
        if data.ref_count == 0 {
            return Err(IndexError::RefUnderflow(data.object.clone()));
        }
        data.ref_count -= 1;
        let snapshot = data.clone();
        if snapshot.ref_count == 0 && snapshot.row == RowSlot::Deleted {
            self.collect(id);
        }
        Ok(snapshot)
    }

    pub fn set_pending_create(
        &mut self,
        id: EntryId,
        request: Option<RequestId>,
    ) -> Result<(), IndexError> {
        let data = self
            .entries
            .get_mut(&id)
            .ok_or(IndexError::UnknownEntry(id))?;
        data.pending_create = request;
        Ok(())
    }

    // ─── Requests ───────────────────────────────────────────────────

    /// Track `request` against the entry at `row`.
    pub fn insert_request(&mut self, request: RequestId, row: usize) -> Result<EntryId, IndexError> {
        let id = self.entry_at(row).ok_or(IndexError::RowOutOfRange {
            row,
            len: self.rows.len(),
        })?;
        self.by_request.insert(request, (REQUEST_RESOLUTIONS, id));
        Ok(id)
    }

    /// Record one resolution of `request`.
    ///
    /// Returns `true` when the other resolution path already handled it, which
    /// means the caller must not apply the effect again. Unknown requests
    /// return `false`.
    pub fn mark_request_handled(&mut self, request: &RequestId) -> bool {
        let Some((remaining, _)) = self.by_request.get_mut(request) else {
            return false;
        };
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.by_request.remove(request);
            true
        } else {
            false
        }
    }

    // ─── Identity ───────────────────────────────────────────────────

    /// Rename a temporary entry to its durable id. The temporary id keeps
    /// resolving to the same entry.
    pub fn confirm(&mut self, local: LocalId, durable: ObjectId) -> Result<EntryId, IndexError> {
        let temporary = ObjectRef::Temporary(local);
        let id = self
            .entry_for(&temporary)
            .ok_or(IndexError::UnknownObject(temporary))?;
        let durable = ObjectRef::Durable(durable);
        if let Some(other) = self.entry_for(&durable) {
            if other != id && self.row_of(other).is_some() {
                return Err(IndexError::DuplicateObject(durable));
            }
        }
        let data = self
            .entries
            .get_mut(&id)
            .ok_or(IndexError::UnknownEntry(id))?;
        data.object = durable.clone();
        data.pending_create = None;
        self.by_object.insert(durable, id);
        Ok(id)
    }

    fn allocate(&mut self, object: ObjectRef) -> EntryId {
        let id = EntryId(self.next_entry);
        self.next_entry += 1;
        let local_id = object.local();
        self.entries.insert(
            id,
            AttachedData {
                row: RowSlot::Live(0),
                object,
                ref_count: 0,
                pending_create: None,
                local_id,
            },
        );
        id
    }

    fn collect(&mut self, id: EntryId) {
        let Some(data) = self.entries.remove(&id) else {
            return;
        };
        let mut keys = vec![data.object];
        if let Some(local) = data.local_id {
            keys.push(ObjectRef::Temporary(local));
        }
        for key in keys {
            if self.by_object.get(&key) == Some(&id) {
                self.by_object.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn durable(id: &str) -> ObjectRef {
        ObjectRef::Durable(ObjectId::from(id))
    }

    fn index_of(ids: &[&str]) -> RowIndex {
        let mut index = RowIndex::new();
        index
            .reset(ids.iter().map(|id| durable(id)).collect())
            .unwrap();
        index
    }

    fn assert_consistent(index: &RowIndex) {
        for (row, id) in index.rows.iter().enumerate() {
            let data = &index.entries[id];
            assert_eq!(data.row, RowSlot::Live(row));
            assert_eq!(index.row_from_object(&data.object), Some(row));
        }
        for data in index.entries.values() {
            if data.row == RowSlot::Deleted {
                assert!(data.ref_count > 0, "unreferenced deleted entry not collected");
            }
        }
    }

    #[test]
    fn test_reset_builds_rows() {
        let index = index_of(&["a", "b", "c"]);
        assert_eq!(index.len(), 3);
        assert_eq!(index.row_from_object(&durable("b")), Some(1));
        assert_eq!(index.is_synced(2), Some(true));
        assert_eq!(index.is_synced(3), None);
        assert_consistent(&index);
    }

    #[test]
    fn test_removal_shifts_later_rows() {
        let mut index = index_of(&["a", "b", "c", "d"]);
        index.reindex_after_removal(1).unwrap();
        assert_eq!(index.row_from_object(&durable("a")), Some(0));
        assert_eq!(index.row_from_object(&durable("b")), None);
        assert_eq!(index.row_from_object(&durable("c")), Some(1));
        assert_eq!(index.row_from_object(&durable("d")), Some(2));
        assert!(!index.contains(&durable("b")));
        assert_consistent(&index);
    }

    #[test]
    fn test_referenced_entry_survives_removal() {
        let mut index = index_of(&["a", "b"]);
        let entry = index.ref_object(&durable("b"), 1).unwrap();
        index.insert_request("r1".into(), 1).unwrap();
        index.reindex_after_removal(1).unwrap();

        assert_eq!(index.get(entry).unwrap().row, RowSlot::Deleted);
        assert_eq!(index.row_from_request(&"r1".into()), None);

        let released = index.deref_entry(entry).unwrap();
        assert_eq!(released.row, RowSlot::Deleted);
        assert_eq!(released.ref_count, 0);
        assert!(index.get(entry).is_none());
        assert_consistent(&index);
    }

    #[test]
    fn test_request_resolves_after_rows_move() {
        let mut index = index_of(&["a", "b", "c"]);
        index.ref_object(&durable("c"), 2).unwrap();
        index.insert_request("r1".into(), 2).unwrap();
        index.reindex_after_removal(0).unwrap();
        assert_eq!(index.row_from_request(&"r1".into()), Some(1));
    }

    #[test]
    fn test_ref_detects_row_mismatch() {
        let mut index = index_of(&["a", "b"]);
        let err = index.ref_object(&durable("a"), 1).unwrap_err();
        assert!(matches!(err, IndexError::RowMismatch { expected: 1, .. }));
        assert!(matches!(
            index.ref_object(&durable("zz"), 0),
            Err(IndexError::UnknownObject(_))
        ));
    }

    #[test]
    fn test_deref_underflow() {
        let mut index = index_of(&["a"]);
        assert!(matches!(
            index.deref(&durable("a")),
            Err(IndexError::RefUnderflow(_))
        ));
    }

    #[test]
    fn test_synced_follows_ref_count() {
        let mut index = index_of(&["a"]);
        index.ref_object(&durable("a"), 0).unwrap();
        index.ref_row(0).unwrap();
        assert_eq!(index.is_synced(0), Some(false));
        index.deref(&durable("a")).unwrap();
        assert_eq!(index.is_synced(0), Some(false));
        index.deref(&durable("a")).unwrap();
        assert_eq!(index.is_synced(0), Some(true));
    }

    #[test]
    fn test_mark_request_handled_second_resolution() {
        let mut index = index_of(&["a"]);
        let request = RequestId::from("r1");
        index.insert_request(request.clone(), 0).unwrap();
        assert!(!index.mark_request_handled(&request));
        assert!(index.mark_request_handled(&request));
        assert_eq!(index.tracked_requests(), 0);
        assert!(!index.mark_request_handled(&"unknown".into()));
    }

    #[test]
    fn test_insert_range_is_contiguous() {
        let mut index = index_of(&["a", "d"]);
        let ids = index
            .insert_range(1, vec![durable("b"), durable("c")])
            .unwrap();
        assert_eq!(ids.len(), 2);
        for (row, id) in ["a", "b", "c", "d"].iter().enumerate() {
            assert_eq!(index.row_from_object(&durable(id)), Some(row));
        }
        assert!(matches!(
            index.insert(0, durable("c")),
            Err(IndexError::DuplicateObject(_))
        ));
        assert!(matches!(
            index.insert(9, durable("z")),
            Err(IndexError::RowOutOfRange { .. })
        ));
        assert_consistent(&index);
    }

    #[test]
    fn test_confirm_keeps_temporary_alias() {
        let mut index = index_of(&["a"]);
        let local = LocalId::new();
        let entry = index.insert(1, ObjectRef::Temporary(local)).unwrap();
        index.set_pending_create(entry, Some("create".into())).unwrap();

        index.confirm(local, ObjectId::from("b")).unwrap();
        let data = index.get(entry).unwrap();
        assert_eq!(data.object, durable("b"));
        assert!(data.pending_create.is_none());
        assert_eq!(index.row_from_object(&durable("b")), Some(1));
        assert_eq!(index.row_from_object(&ObjectRef::Temporary(local)), Some(1));
    }

    #[test]
    fn test_confirm_rejects_visible_duplicate() {
        let mut index = index_of(&["a"]);
        let local = LocalId::new();
        index.insert(1, ObjectRef::Temporary(local)).unwrap();
        assert!(matches!(
            index.confirm(local, ObjectId::from("a")),
            Err(IndexError::DuplicateObject(_))
        ));
    }

    #[test]
    fn test_reset_keeps_referenced_entries() {
        let mut index = index_of(&["a", "b"]);
        let local = LocalId::new();
        let pending = index.insert(2, ObjectRef::Temporary(local)).unwrap();
        index.ref_object(&ObjectRef::Temporary(local), 2).unwrap();
        let b = index.ref_object(&durable("b"), 1).unwrap();

        index.reset(vec![durable("c"), durable("b")]).unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(index.get(b).unwrap().row, RowSlot::Live(1));
        assert_eq!(index.get(pending).unwrap().row, RowSlot::Deleted);
        assert!(!index.contains(&durable("a")));
        assert_eq!(index.row_from_object(&durable("c")), Some(0));
        assert_consistent(&index);
    }

    #[test]
    fn test_reset_forgets_requests_of_dropped_entries() {
        let mut index = index_of(&["a", "b"]);
        index.insert_request("done".into(), 0).unwrap();
        let b = index.ref_object(&durable("b"), 1).unwrap();
        index.insert_request("in-flight".into(), 1).unwrap();
        assert_eq!(index.tracked_requests(), 2);

        index.reset(vec![durable("b")]).unwrap();

        assert_eq!(index.tracked_requests(), 1);
        assert!(!index.mark_request_handled(&"done".into()));
        assert_eq!(index.row_from_request(&"in-flight".into()), Some(0));
        assert_eq!(index.get(b).unwrap().row, RowSlot::Live(0));
    }

    #[test]
    fn test_reset_rejects_duplicates() {
        let mut index = RowIndex::new();
        assert!(index.reset(vec![durable("a"), durable("a")]).is_err());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Insert(usize),
            Remove(usize),
            Ref(usize),
            Deref(usize),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0usize..16).prop_map(Op::Insert),
                (0usize..16).prop_map(Op::Remove),
                (0usize..16).prop_map(Op::Ref),
                (0usize..16).prop_map(Op::Deref),
            ]
        }

        proptest! {
            #[test]
            fn rows_stay_contiguous(ops in proptest::collection::vec(op(), 0..64)) {
                let mut index = RowIndex::new();
                let mut model: Vec<ObjectRef> = Vec::new();
                let mut held: Vec<EntryId> = Vec::new();
                let mut counter = 0;

                for op in ops {
                    match op {
                        Op::Insert(at) => {
                            let at = at % (model.len() + 1);
                            counter += 1;
                            let object = durable(&format!("o{counter}"));
                            index.insert(at, object.clone()).unwrap();
                            model.insert(at, object);
                        }
                        Op::Remove(at) if !model.is_empty() => {
                            let at = at % model.len();
                            index.reindex_after_removal(at).unwrap();
                            model.remove(at);
                        }
                        Op::Ref(at) if !model.is_empty() => {
                            let at = at % model.len();
                            held.push(index.ref_object(&model[at], at).unwrap());
                        }
                        Op::Deref(pick) if !held.is_empty() => {
                            let entry = held.remove(pick % held.len());
                            index.deref_entry(entry).unwrap();
                        }
                        _ => {}
                    }

                    prop_assert_eq!(index.len(), model.len());
                    for (row, object) in model.iter().enumerate() {
                        prop_assert_eq!(index.row_from_object(object), Some(row));
                    }
                    assert_consistent(&index);
                }
            }
        }
    }
}
