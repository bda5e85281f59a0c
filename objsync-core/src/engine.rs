//! Synchronization engine.
//!
//! Applies caller intents to the collection immediately, issues the matching
//! backend requests, and folds Completions and pushed Events back in. The
//! engine is the single owner of the collection and the [`RowIndex`]; every
//! method runs on the caller's thread and never blocks.
//!
//! ```text
//!  append / remove / set_property / run_query / fetch_more
//!        │                                   ▲
//!        ▼                                   │ Reply
//!  ┌───────────┐  issue_*   ┌─────────┐      │
//!  │ SyncEngine│ ─────────► │ Backend │ ─ Completion ─┐
//!  │  items    │            └─────────┘               │
//!  │  RowIndex │ ◄──────────── on_completion ─────────┘
//!  │  deferred │ ◄──────────── on_notification ◄── Event (transport)
//!  └─────┬─────┘
//!        └── ModelChange ──► observers
//! ```
//!
//! Completions and Events for the same mutation may arrive in either order.
//! Each tracked request can be resolved twice (once per path); the index
//! reports the second resolution so its effect is not applied again.

use objsync_wire::{Event, EventKind};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::collection::{CollectionSnapshot, Item, ModelChange, RowSnapshot};
use crate::deferred::{DeferredAction, DeferredOp, DeferredOps};
use crate::error::{IndexError, OperationError};
use crate::index::{EntryId, RowIndex};
use crate::object_ref::{LocalId, ObjectId, ObjectRef};
use crate::query::Query;
use crate::reply::{Outcome, Reply, Responder};
use crate::request::{Backend, Completion, PendingKind, RequestId, RequestRecord};

const ID_KEY: &str = "id";
const OBJECT_TYPE_KEY: &str = "objectType";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Change notifications buffered per observer before it lags.
    pub change_capacity: usize,
    /// Page size for queries without a `limit`. `None` leaves them unpaged.
    pub default_page_size: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            change_capacity: 256,
            default_page_size: None,
        }
    }
}

struct PendingRequest {
    record: RequestRecord,
    responder: Responder,
}

pub struct SyncEngine<B: Backend> {
    backend: B,
    config: EngineConfig,
    query: Query,
    /// Bumped by every `run_query`; results of older queries are not applied.
    generation: u64,
    items: Vec<Item>,
    index: RowIndex,
    pending: FxHashMap<RequestId, PendingRequest>,
    deferred: DeferredOps,
    /// Objects reported deleted while not visible, kept while creates are in
    /// flight so a create confirmed after its own deletion is dropped.
    tombstones: FxHashSet<ObjectId>,
    changes: broadcast::Sender<ModelChange>,
    latest_requested_offset: usize,
    can_fetch_more: bool,
    /// The full query or page request currently outstanding.
    paging_request: Option<RequestId>,
}

impl<B: Backend> SyncEngine<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, EngineConfig::default())
    }

    pub fn with_config(backend: B, config: EngineConfig) -> Self {
        let (changes, _) = broadcast::channel(config.change_capacity.max(1));
        Self {
            backend,
            config,
            query: Query::default(),
            generation: 0,
            items: Vec::new(),
            index: RowIndex::new(),
            pending: FxHashMap::default(),
            deferred: DeferredOps::default(),
            tombstones: FxHashSet::default(),
            changes,
            latest_requested_offset: 0,
            can_fetch_more: false,
            paging_request: None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn row_count(&self) -> usize {
        self.items.len()
    }

    pub fn get(&self, row: usize) -> Option<&Item> {
        self.items.get(row)
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// `false` while requests referencing the row are in flight.
    pub fn is_synced(&self, row: usize) -> Option<bool> {
        self.index.is_synced(row)
    }

    pub fn row_of(&self, id: &ObjectId) -> Option<usize> {
        self.index.row_from_durable(id)
    }

    pub fn index(&self) -> &RowIndex {
        &self.index
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn deferred_operations(&self) -> usize {
        self.deferred.len()
    }

    pub fn can_fetch_more(&self) -> bool {
        self.can_fetch_more && self.paging_request.is_none() && !self.query.is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModelChange> {
        self.changes.subscribe()
    }

    pub fn snapshot(&self) -> CollectionSnapshot {
        CollectionSnapshot::new(
            self.items
                .iter()
                .enumerate()
                .map(|(row, item)| RowSnapshot {
                    object: item.object.clone(),
                    payload: item.payload.clone(),
                    synced: self.index.is_synced(row).unwrap_or(true),
                })
                .collect(),
        )
    }

    // ─── Caller intents ─────────────────────────────────────────────

    /// Append one object optimistically and issue its create.
    pub fn append(&mut self, payload: Map<String, Value>) -> Reply {
        let row = self.items.len();
        self.insert(row, payload)
    }

    pub fn insert(&mut self, row: usize, payload: Map<String, Value>) -> Reply {
        if row > self.items.len() {
            return Reply::resolved(Err(self.invalid_row(row)));
        }
        match self.insert_range(row, vec![payload]).pop() {
            Some(reply) => reply,
            None => Reply::resolved(Err(self.invalid_row(row))),
        }
    }

    /// Append several objects as one contiguous insertion.
    pub fn append_all(&mut self, payloads: Vec<Map<String, Value>>) -> Vec<Reply> {
        let row = self.items.len();
        self.insert_range(row, payloads)
    }

    fn insert_range(&mut self, row: usize, payloads: Vec<Map<String, Value>>) -> Vec<Reply> {
        if payloads.is_empty() {
            return Vec::new();
        }
        let prepared: Vec<(LocalId, Map<String, Value>)> = payloads
            .into_iter()
            .map(|mut payload| {
                payload.remove(ID_KEY);
                if !self.query.is_empty() {
                    payload.insert(
                        OBJECT_TYPE_KEY.to_string(),
                        Value::String(self.query.object_type.clone()),
                    );
                }
                (LocalId::new(), payload)
            })
            .collect();

        let objects = prepared
            .iter()
            .map(|(local, _)| ObjectRef::Temporary(*local))
            .collect();
        if let Err(err) = self.index.insert_range(row, objects) {
            self.inconsistency(&err);
            return prepared
                .iter()
                .map(|_| Reply::resolved(Err(err.clone().into())))
                .collect();
        }

        let count = prepared.len();
        let mut items = Vec::with_capacity(count);
        let mut replies = Vec::with_capacity(count);
        for (offset, (local, payload)) in prepared.into_iter().enumerate() {
            let position = row + offset;
            let request = self.backend.issue_create(payload.clone());
            let (responder, reply) = Reply::channel();
            match self.track_create(position, local, &request) {
                Ok(entry) => {
                    log::debug!("Create {request} issued for temporary row {position}");
                    self.track(request, PendingKind::Create { local, entry }, responder);
                }
                Err(err) => {
                    self.inconsistency(&err);
                    responder.resolve(Err(err.into()));
                }
            }
            items.push(Item::new(ObjectRef::Temporary(local), payload));
            replies.push(reply);
        }
        self.items.splice(row..row, items);
        self.emit(ModelChange::RangeInserted {
            start: row,
            end: row + count,
        });
        replies
    }

    fn track_create(
        &mut self,
        row: usize,
        local: LocalId,
        request: &RequestId,
    ) -> Result<EntryId, IndexError> {
        let entry = self.index.ref_object(&ObjectRef::Temporary(local), row)?;
        self.index.set_pending_create(entry, Some(request.clone()))?;
        self.index.insert_request(request.clone(), row)?;
        Ok(entry)
    }

    /// Remove the object on `row`.
    ///
    /// The row stays visible, marked unsynced, until the backend or a Delete
    /// event confirms the removal.
    pub fn remove(&mut self, row: usize) -> Reply {
        let (responder, reply) = Reply::channel();
        let Some(item) = self.items.get(row) else {
            responder.resolve(Err(self.invalid_row(row)));
            return reply;
        };
        match item.object.clone() {
            ObjectRef::Durable(id) => self.remove_now(row, id, responder),
            ObjectRef::Temporary(_) => self.defer(row, DeferredAction::Remove, responder),
        }
        reply
    }

    fn remove_now(&mut self, row: usize, id: ObjectId, responder: Responder) {
        let entry = match self.index.ref_object(&ObjectRef::Durable(id.clone()), row) {
            Ok(entry) => entry,
            Err(err) => return self.fail(responder, err),
        };
        let object_type = self.object_type_at(row);
        let request = self.backend.issue_remove(&id, &object_type);
        if let Err(err) = self.index.insert_request(request.clone(), row) {
            self.inconsistency(&err);
        }
        log::debug!("Remove {request} issued for {id} on row {row}");
        self.track(request, PendingKind::Remove { object: id, entry }, responder);
        self.emit(ModelChange::RowChanged { row });
    }

    /// Set one property on `row`, optimistically.
    ///
    /// The previous content is restored if the backend rejects the update.
    pub fn set_property(&mut self, row: usize, key: impl Into<String>, value: Value) -> Reply {
        let key = key.into();
        let (responder, reply) = Reply::channel();
        if key == ID_KEY || key == OBJECT_TYPE_KEY {
            responder.resolve(Err(OperationError::ReadOnlyProperty(key)));
            return reply;
        }
        let Some(item) = self.items.get_mut(row) else {
            responder.resolve(Err(self.invalid_row(row)));
            return reply;
        };
        let prior = item.payload.get(&key).cloned();
        match item.object.clone() {
            ObjectRef::Durable(id) => self.set_property_now(row, id, key, value, prior, responder),
            ObjectRef::Temporary(_) => {
                item.payload.insert(key.clone(), value.clone());
                self.defer(row, DeferredAction::SetProperty { key, value, prior }, responder);
                self.emit(ModelChange::RowChanged { row });
            }
        }
        reply
    }

    fn set_property_now(
        &mut self,
        row: usize,
        id: ObjectId,
        key: String,
        value: Value,
        prior: Option<Value>,
        responder: Responder,
    ) {
        let entry = match self.index.ref_object(&ObjectRef::Durable(id.clone()), row) {
            Ok(entry) => entry,
            Err(err) => return self.fail(responder, err),
        };
        let Some(item) = self.items.get_mut(row) else {
            let len = self.items.len();
            return self.fail(responder, IndexError::RowOutOfRange { row, len });
        };

        let mut previous = item.payload.clone();
        match prior {
            Some(prior) => previous.insert(key.clone(), prior),
            None => previous.remove(&key),
        };
        item.payload.insert(key.clone(), value.clone());

        let mut delta = Map::new();
        delta.insert(key, value);
        delta.insert(ID_KEY.to_string(), Value::String(id.to_string()));
        if let Some(object_type) = item.payload.get(OBJECT_TYPE_KEY) {
            delta.insert(OBJECT_TYPE_KEY.to_string(), object_type.clone());
        }

        let request = self.backend.issue_update(&id, delta);
        if let Err(err) = self.index.insert_request(request.clone(), row) {
            self.inconsistency(&err);
        }
        log::debug!("Update {request} issued for {id} on row {row}");
        self.track(
            request,
            PendingKind::Update {
                object: id,
                entry,
                previous,
            },
            responder,
        );
        self.emit(ModelChange::RowChanged { row });
    }

    /// Queue an operation on a row whose create is still in flight.
    fn defer(&mut self, row: usize, action: DeferredAction, responder: Responder) {
        let entry = match self.index.ref_row(row) {
            Ok(entry) => entry,
            Err(err) => return self.fail(responder, err),
        };
        let Some(data) = self.index.get(entry) else {
            return self.fail(responder, IndexError::UnknownEntry(entry));
        };
        let Some(create) = data.pending_create.clone() else {
            let err = IndexError::MissingPendingCreate(data.object.clone());
            if let Err(release) = self.index.deref_entry(entry) {
                self.inconsistency(&release);
            }
            return self.fail(responder, err);
        };
        log::debug!(
            "Row {row} will be {} once create {create} completes",
            action.verb()
        );
        self.deferred.queue(
            create,
            DeferredOp {
                entry,
                action,
                responder,
            },
        );
    }

    /// Replace the query and fetch its first page.
    ///
    /// Every row is replaced when the result arrives. An empty object type
    /// clears the collection without a request.
    pub fn run_query(&mut self, query: Query) -> Reply {
        self.query = query;
        self.generation += 1;
        self.latest_requested_offset = 0;
        self.paging_request = None;
        let limit = self.page_limit();
        self.can_fetch_more = limit.is_some();

        if self.query.is_empty() {
            self.can_fetch_more = false;
            self.full_reset(Vec::new());
            return Reply::resolved(Ok(Value::Array(Vec::new())));
        }

        let mut request_query = self.query.clone();
        if let Some(limit) = limit {
            request_query.limit = Some(limit);
            self.latest_requested_offset = request_query.offset + limit;
        }
        let request = self.backend.issue_query(&request_query);
        log::debug!(
            "Query {request} issued for {} (generation {})",
            self.query.object_type,
            self.generation
        );
        let (responder, reply) = Reply::channel();
        self.paging_request = Some(request.clone());
        self.track(
            request,
            PendingKind::FullQuery {
                generation: self.generation,
            },
            responder,
        );
        reply
    }

    /// Re-issue the current query.
    pub fn refresh(&mut self) -> Reply {
        let query = self.query.clone();
        self.run_query(query)
    }

    /// Request the next page. `None` when paging is off, exhausted, or a page
    /// is already outstanding.
    pub fn fetch_more(&mut self) -> Option<Reply> {
        if !self.can_fetch_more() {
            return None;
        }
        let limit = self.page_limit()?.max(1);
        let offset = self.latest_requested_offset;
        self.latest_requested_offset = offset + limit;

        let request = self.backend.issue_query(&self.query.page(offset, limit));
        log::debug!("Page {request} issued for offset {offset}, limit {limit}");
        let (responder, reply) = Reply::channel();
        self.paging_request = Some(request.clone());
        self.track(
            request,
            PendingKind::FetchMore {
                generation: self.generation,
                offset,
                limit,
            },
            responder,
        );
        Some(reply)
    }

    fn page_limit(&self) -> Option<usize> {
        self.query.limit.or(self.config.default_page_size)
    }

    // ─── Completions ────────────────────────────────────────────────

    /// Fold one Completion back in.
    pub fn on_completion(&mut self, completion: Completion) {
        let Some(PendingRequest { record, responder }) = self.pending.remove(&completion.request_id)
        else {
            log::warn!(
                "Ignoring completion for unknown request {}",
                completion.request_id
            );
            return;
        };
        log::debug!(
            "{} {} completed with status {} after {:?}",
            record.kind.name(),
            record.request_id,
            completion.backend_status,
            record.sent_at.elapsed()
        );

        match record.kind {
            PendingKind::Create { local, entry } => {
                self.finished_create(completion, local, entry, responder)
            }
            PendingKind::Update {
                object,
                entry,
                previous,
            } => self.finished_update(completion, object, entry, previous, responder),
            PendingKind::Remove { object, entry } => {
                self.finished_remove(completion, object, entry, responder)
            }
            PendingKind::FullQuery { generation } => {
                self.finished_full_query(completion, generation, responder)
            }
            PendingKind::FetchMore {
                generation,
                offset,
                limit,
            } => self.finished_fetch_more(completion, generation, offset, limit, responder),
        }
    }

    fn finished_create(
        &mut self,
        completion: Completion,
        local: LocalId,
        entry: EntryId,
        responder: Responder,
    ) {
        let handled = self.index.mark_request_handled(&completion.request_id);
        let released = match self.index.deref_entry(entry) {
            Ok(data) => Some(data),
            Err(err) => {
                self.inconsistency(&err);
                None
            }
        };
        let durable = if completion.ok {
            completion.object_id()
        } else {
            None
        };
        if completion.ok && durable.is_none() {
            log::error!(
                "Create {} succeeded but returned no object id",
                completion.request_id
            );
        }

        if !handled {
            match released.as_ref().and_then(|data| data.row.live()) {
                Some(row) if !completion.ok => {
                    log::info!(
                        "Create {} failed with status {}, dropping row {row}",
                        completion.request_id,
                        completion.backend_status
                    );
                    self.remove_row(row);
                }
                Some(row) => {
                    if let (Some(id), Some(object)) = (durable.clone(), completion.object()) {
                        self.confirm_row(row, local, id, object.clone());
                    }
                }
                None => {
                    // The temporary row went away with a query reset.
                    if let (Some(id), Some(object)) = (&durable, completion.object()) {
                        match self.index.row_from_durable(id) {
                            Some(row) => self.replace_row(row, object.clone()),
                            None => self.received_create(object.clone()),
                        }
                    }
                }
            }
        }

        responder.resolve(outcome_of(&completion));
        self.dispatch_deferred(&completion.request_id, durable);

        let creates_pending = self
            .pending
            .values()
            .any(|pending| matches!(pending.record.kind, PendingKind::Create { .. }));
        if !creates_pending {
            self.tombstones.clear();
        }
    }

    /// Send the operations that were waiting for `create`.
    fn dispatch_deferred(&mut self, create: &RequestId, durable: Option<ObjectId>) {
        for DeferredOp {
            entry,
            action,
            responder,
        } in self.deferred.take(create)
        {
            let released = match self.index.deref_entry(entry) {
                Ok(data) => Some(data),
                Err(err) => {
                    self.inconsistency(&err);
                    None
                }
            };
            let Some(id) = durable.clone() else {
                responder.resolve(Err(OperationError::DependentCreateFailed {
                    operation: action.verb(),
                }));
                continue;
            };

            let row = released
                .and_then(|data| data.row.live())
                .or_else(|| self.index.row_from_durable(&id))
                .filter(|row| {
                    self.items.get(*row).map(|item| &item.object)
                        == Some(&ObjectRef::Durable(id.clone()))
                });
            let Some(row) = row else {
                log::debug!("Row of {id} vanished before its deferred operation could be sent");
                responder.resolve(Err(OperationError::StaleRequest));
                continue;
            };

            match action {
                DeferredAction::Remove => self.remove_now(row, id, responder),
                DeferredAction::SetProperty { key, value, prior } => {
                    self.set_property_now(row, id, key, value, prior, responder)
                }
            }
        }
    }

    fn finished_update(
        &mut self,
        completion: Completion,
        id: ObjectId,
        entry: EntryId,
        previous: Map<String, Value>,
        responder: Responder,
    ) {
        let released = self.index.deref_entry(entry);
        let handled = self.index.mark_request_handled(&completion.request_id);
        match released {
            Err(err) => self.inconsistency(&err),
            Ok(data) => match data.row.live() {
                None => log::debug!("Update of {id} completed after its row was removed"),
                Some(row) if handled => self.emit(ModelChange::RowChanged { row }),
                Some(row) if completion.ok => match completion.object() {
                    Some(object) => self.replace_row(row, object.clone()),
                    None => self.emit(ModelChange::RowChanged { row }),
                },
                Some(row) if completion.is_not_found() => {
                    log::info!("Object {id} no longer exists, removing row {row}");
                    self.remove_row(row);
                }
                Some(row) => {
                    log::warn!(
                        "Update of {id} failed with status {}, rolling back row {row}",
                        completion.backend_status
                    );
                    self.replace_row(row, previous);
                }
            },
        }
        responder.resolve(outcome_of(&completion));
    }

    fn finished_remove(
        &mut self,
        completion: Completion,
        id: ObjectId,
        entry: EntryId,
        responder: Responder,
    ) {
        let released = self.index.deref_entry(entry);
        let handled = self.index.mark_request_handled(&completion.request_id);
        match released {
            Err(err) => self.inconsistency(&err),
            Ok(data) => match data.row.live() {
                None => log::debug!("Remove of {id} completed after its row was removed"),
                Some(row) if handled => self.emit(ModelChange::RowChanged { row }),
                Some(row) if completion.ok || completion.is_not_found() => self.remove_row(row),
                Some(row) => {
                    log::warn!(
                        "Remove of {id} failed with status {}, keeping row {row}",
                        completion.backend_status
                    );
                    self.emit(ModelChange::RowChanged { row });
                }
            },
        }
        responder.resolve(outcome_of(&completion));
    }

    fn finished_full_query(&mut self, completion: Completion, generation: u64, responder: Responder) {
        if generation != self.generation {
            log::debug!(
                "Not applying result of superseded query {}",
                completion.request_id
            );
            return responder.resolve(outcome_of(&completion));
        }
        if self.paging_request.as_ref() == Some(&completion.request_id) {
            self.paging_request = None;
        }
        if completion.ok {
            let results = completion.results().to_vec();
            let count = results.len();
            self.full_reset(results);
            if let Some(limit) = self.page_limit() {
                self.can_fetch_more = count >= limit;
            }
        } else {
            log::warn!(
                "Query {} failed with status {}",
                completion.request_id,
                completion.backend_status
            );
            // The first page never arrived; paging restarts with the next query.
            self.latest_requested_offset = self.query.offset;
            self.can_fetch_more = false;
        }
        responder.resolve(outcome_of(&completion));
    }

    fn finished_fetch_more(
        &mut self,
        completion: Completion,
        generation: u64,
        offset: usize,
        limit: usize,
        responder: Responder,
    ) {
        if generation != self.generation {
            log::debug!("Not applying page {} of a superseded query", completion.request_id);
            return responder.resolve(outcome_of(&completion));
        }
        if self.paging_request.as_ref() == Some(&completion.request_id) {
            self.paging_request = None;
        }
        if completion.ok {
            let results = completion.results().to_vec();
            let count = results.len();
            self.append_page(results);
            self.can_fetch_more = count >= limit;
        } else {
            log::warn!(
                "Page at offset {offset} failed with status {}",
                completion.backend_status
            );
            self.latest_requested_offset = offset;
        }
        responder.resolve(outcome_of(&completion));
    }

    // ─── Notifications ──────────────────────────────────────────────

    /// Fold one pushed Event in.
    pub fn on_notification(&mut self, event: Event) {
        if let Some(request) = event.request_id.as_deref().map(RequestId::from) {
            let request_row = self.index.row_from_request(&request);
            if self.index.mark_request_handled(&request) {
                log::trace!("Event for request {request} was already applied");
                return;
            }
            if event.kind == EventKind::Create {
                let local = request_row
                    .and_then(|row| self.items.get(row).map(|item| (row, item.object.local())));
                if let (Some((row, Some(local))), Some(id)) = (local, event.object_id()) {
                    let id = ObjectId::from(id);
                    self.confirm_row(row, local, id, event.payload);
                    return;
                }
            }
        }

        match event.kind {
            EventKind::Create => self.received_create(event.payload),
            EventKind::Update => {
                let Some(id) = event.object_id().map(ObjectId::from) else {
                    log::warn!("Update notification without an object id");
                    return;
                };
                match self.index.row_from_durable(&id) {
                    Some(row) => self.replace_row(row, event.payload),
                    None => log::trace!("Update for {id} is outside this window"),
                }
            }
            EventKind::Delete => {
                let Some(id) = event.object_id().map(ObjectId::from) else {
                    log::warn!("Delete notification without an object id");
                    return;
                };
                match self.index.row_from_durable(&id) {
                    Some(row) => self.remove_row(row),
                    None if self.creates_in_flight() => {
                        self.tombstones.insert(id);
                    }
                    None => log::trace!("Delete for {id} is outside this window"),
                }
            }
        }
    }

    fn creates_in_flight(&self) -> bool {
        self.pending
            .values()
            .any(|pending| matches!(pending.record.kind, PendingKind::Create { .. }))
    }

    fn received_create(&mut self, payload: Map<String, Value>) {
        if !self.query.matches(&payload) {
            return;
        }
        let Some(item) = Item::durable(payload) else {
            log::warn!("Create notification without an object id");
            return;
        };
        if let Some(id) = item.id() {
            if self.index.row_from_durable(id).is_some() {
                log::trace!("Object {id} is already present");
                return;
            }
        }
        let row = self.items.len();
        match self.index.insert(row, item.object.clone()) {
            Ok(_) => {
                self.items.push(item);
                self.emit(ModelChange::RangeInserted {
                    start: row,
                    end: row + 1,
                });
            }
            Err(err) => self.inconsistency(&err),
        }
    }

    // ─── Row primitives ─────────────────────────────────────────────

    /// Turn the temporary row into the created object.
    fn confirm_row(
        &mut self,
        row: usize,
        local: LocalId,
        id: ObjectId,
        mut object: Map<String, Value>,
    ) {
        if self.tombstones.remove(&id) {
            log::debug!("Object {id} was deleted before its create was confirmed");
            return self.remove_row(row);
        }
        if let Some(existing) = self.index.row_from_durable(&id) {
            if existing != row {
                log::debug!("Object {id} already visible on row {existing}, dropping row {row}");
                return self.remove_row(row);
            }
        }
        // Updates still waiting on the create stay visible.
        let create = self
            .index
            .entry_for(&ObjectRef::Temporary(local))
            .and_then(|entry| self.index.get(entry))
            .and_then(|data| data.pending_create.clone());
        if let Some(create) = create {
            self.deferred.overlay(&create, &mut object);
        }
        if let Err(err) = self.index.confirm(local, id.clone()) {
            return self.inconsistency(&err);
        }
        if let Some(item) = self.items.get_mut(row) {
            item.object = ObjectRef::Durable(id);
            item.payload = object;
        }
        self.emit(ModelChange::RowChanged { row });
    }

    fn replace_row(&mut self, row: usize, payload: Map<String, Value>) {
        if let Some(item) = self.items.get_mut(row) {
            item.payload = payload;
            self.emit(ModelChange::RowChanged { row });
        }
    }

    fn remove_row(&mut self, row: usize) {
        if row >= self.items.len() {
            let len = self.items.len();
            return self.inconsistency(&IndexError::RowOutOfRange { row, len });
        }
        self.items.remove(row);
        if let Err(err) = self.index.reindex_after_removal(row) {
            self.inconsistency(&err);
        }
        self.emit(ModelChange::RangeRemoved {
            start: row,
            end: row + 1,
        });
    }

    fn full_reset(&mut self, results: Vec<Value>) {
        let items = self.unique_items(results, false);
        let old_len = self.items.len();
        let objects = items.iter().map(|item| item.object.clone()).collect();
        if let Err(err) = self.index.reset(objects) {
            self.inconsistency(&err);
        }
        self.items = items;
        self.tombstones.clear();

        if old_len > 0 {
            self.emit(ModelChange::RangeRemoved {
                start: 0,
                end: old_len,
            });
        }
        if !self.items.is_empty() {
            self.emit(ModelChange::RangeInserted {
                start: 0,
                end: self.items.len(),
            });
        }
    }

    fn append_page(&mut self, results: Vec<Value>) {
        let items = self.unique_items(results, true);
        if items.is_empty() {
            return;
        }
        let start = self.items.len();
        let objects = items.iter().map(|item| item.object.clone()).collect();
        if let Err(err) = self.index.insert_range(start, objects) {
            return self.inconsistency(&err);
        }
        self.items.extend(items);
        self.emit(ModelChange::RangeInserted {
            start,
            end: self.items.len(),
        });
    }

    /// Result objects with an id, first occurrence only. With `skip_visible`,
    /// objects already in the collection are dropped too.
    fn unique_items(&self, results: Vec<Value>, skip_visible: bool) -> Vec<Item> {
        let mut seen = FxHashSet::default();
        results
            .into_iter()
            .filter_map(|value| match value {
                Value::Object(object) => Item::durable(object),
                _ => None,
            })
            .filter(|item| match item.id() {
                Some(id) => {
                    !(skip_visible && self.index.row_from_durable(id).is_some())
                        && seen.insert(id.clone())
                }
                None => false,
            })
            .collect()
    }

    // ─── Helpers ────────────────────────────────────────────────────

    fn track(&mut self, request: RequestId, kind: PendingKind, responder: Responder) {
        let record = RequestRecord::new(request.clone(), kind);
        self.pending.insert(request, PendingRequest { record, responder });
    }

    fn object_type_at(&self, row: usize) -> String {
        self.items
            .get(row)
            .and_then(|item| item.payload.get(OBJECT_TYPE_KEY))
            .and_then(Value::as_str)
            .unwrap_or(self.query.object_type.as_str())
            .to_string()
    }

    fn invalid_row(&self, row: usize) -> OperationError {
        OperationError::InvalidRow {
            row,
            len: self.items.len(),
        }
    }

    fn emit(&self, change: ModelChange) {
        // Without observers the change is simply not seen.
        let _ = self.changes.send(change);
    }

    fn inconsistency(&self, err: &IndexError) {
        log::error!("Row index inconsistency: {err}");
    }

    fn fail(&self, responder: Responder, err: IndexError) {
        self.inconsistency(&err);
        responder.resolve(Err(err.into()));
    }
}

fn outcome_of(completion: &Completion) -> Outcome {
    if completion.ok {
        Ok(completion.payload.clone())
    } else {
        Err(OperationError::Backend {
            status: completion.backend_status,
            payload: completion.payload.clone(),
        })
    }
}
