//! In-memory backend.
//!
//! Issued requests wait until the test resolves them, in any order. Resolving
//! applies the request to the store and yields the Completion together with
//! the echo Event the real backend would push, `meta.requestId` included.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use objsync_client::CompletionSink;
use objsync_core::{Backend, Completion, ObjectId, Query, RequestId};
use objsync_wire::{Event, EventKind};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Create { payload: Map<String, Value> },
    Update { id: ObjectId, delta: Map<String, Value> },
    Remove { id: ObjectId, object_type: String },
    Query { query: Query },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IssuedCall {
    pub request: RequestId,
    pub call: Call,
}

/// What resolving one request produced.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub completion: Completion,
    /// Echo notification; `None` for queries and failures.
    pub event: Option<Event>,
}

#[derive(Default)]
struct Store {
    objects: Vec<Map<String, Value>>,
    pending: Vec<IssuedCall>,
    history: Vec<IssuedCall>,
    forced_failures: VecDeque<u16>,
    next_request: u64,
    next_object: u64,
    sink: Option<CompletionSink>,
}

/// Cloneable handle; every clone sees the same store.
#[derive(Clone, Default)]
pub struct FakeBackend {
    store: Arc<Mutex<Store>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completions are also sent to `sink` as requests are resolved.
    pub fn with_sink(sink: CompletionSink) -> Self {
        let backend = Self::default();
        backend.lock().sink = Some(sink);
        backend
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put an object in the store without any notification.
    pub fn seed(&self, object: Map<String, Value>) {
        self.lock().objects.push(object);
    }

    pub fn objects(&self) -> Vec<Map<String, Value>> {
        self.lock().objects.clone()
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock()
            .objects
            .iter()
            .filter_map(|object| object.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Map<String, Value>> {
        let store = self.lock();
        store.position(id).map(|index| store.objects[index].clone())
    }

    /// Unresolved requests in issue order.
    pub fn pending(&self) -> Vec<RequestId> {
        self.lock()
            .pending
            .iter()
            .map(|issued| issued.request.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Every request ever issued.
    pub fn issued(&self) -> Vec<IssuedCall> {
        self.lock().history.clone()
    }

    pub fn last_issued(&self) -> Option<IssuedCall> {
        self.lock().history.last().cloned()
    }

    /// The next resolved request fails with `status` without touching the store.
    pub fn fail_next(&self, status: u16) {
        self.lock().forced_failures.push_back(status);
    }

    /// Apply one pending request. `None` if it is not pending.
    pub fn resolve(&self, request: &RequestId) -> Option<Resolution> {
        let mut store = self.lock();
        let issued = store.take_pending(request)?;
        let resolution = match store.forced_failures.pop_front() {
            Some(status) => Resolution {
                completion: Completion::failure(
                    issued.request,
                    status,
                    json!({"message": "forced failure"}),
                ),
                event: None,
            },
            None => store.apply(issued),
        };
        store.deliver(&resolution);
        Some(resolution)
    }

    /// Fail one pending request with `status`.
    pub fn fail(&self, request: &RequestId, status: u16) -> Option<Resolution> {
        let mut store = self.lock();
        let issued = store.take_pending(request)?;
        let resolution = Resolution {
            completion: Completion::failure(issued.request, status, json!({"message": "failed"})),
            event: None,
        };
        store.deliver(&resolution);
        Some(resolution)
    }

    /// Resolve everything pending, oldest first.
    pub fn resolve_all(&self) -> Vec<Resolution> {
        self.pending()
            .iter()
            .filter_map(|request| self.resolve(request))
            .collect()
    }

    // ─── Other writers ──────────────────────────────────────────────

    pub fn external_create(&self, mut payload: Map<String, Value>) -> Event {
        let mut store = self.lock();
        let id = store.allocate_id();
        payload.insert("id".into(), Value::String(id));
        store.objects.push(payload.clone());
        Event::new(EventKind::Create, payload)
    }

    pub fn external_update(&self, id: &str, delta: Map<String, Value>) -> Option<Event> {
        let mut store = self.lock();
        let index = store.position(id)?;
        store.objects[index].extend(delta);
        Some(Event::new(EventKind::Update, store.objects[index].clone()))
    }

    pub fn external_remove(&self, id: &str) -> Option<Event> {
        let mut store = self.lock();
        let index = store.position(id)?;
        let removed = store.objects.remove(index);
        Some(Event::new(EventKind::Delete, removed))
    }

    fn issue(&self, call: Call) -> RequestId {
        let mut store = self.lock();
        store.next_request += 1;
        let request = RequestId::new(format!("req-{}", store.next_request));
        let issued = IssuedCall {
            request: request.clone(),
            call,
        };
        log::debug!("Fake backend received {issued:?}");
        store.pending.push(issued.clone());
        store.history.push(issued);
        request
    }
}

impl Store {
    fn take_pending(&mut self, request: &RequestId) -> Option<IssuedCall> {
        let index = self
            .pending
            .iter()
            .position(|issued| &issued.request == request)?;
        Some(self.pending.remove(index))
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.objects
            .iter()
            .position(|object| object.get("id").and_then(Value::as_str) == Some(id))
    }

    fn allocate_id(&mut self) -> String {
        self.next_object += 1;
        format!("obj-{}", self.next_object)
    }

    fn apply(&mut self, issued: IssuedCall) -> Resolution {
        let request = issued.request;
        match issued.call {
            Call::Create { mut payload } => {
                let id = self.allocate_id();
                payload.insert("id".into(), Value::String(id));
                self.objects.push(payload.clone());
                echoed(request, EventKind::Create, payload)
            }
            Call::Update { id, delta } => match self.position(id.as_str()) {
                Some(index) => {
                    self.objects[index].extend(delta);
                    let object = self.objects[index].clone();
                    echoed(request, EventKind::Update, object)
                }
                None => not_found(request),
            },
            Call::Remove { id, object_type } => match self.position(id.as_str()) {
                Some(index) => {
                    self.objects.remove(index);
                    let mut deleted = Map::new();
                    deleted.insert("id".into(), Value::String(id.to_string()));
                    deleted.insert("objectType".into(), Value::String(object_type));
                    echoed(request, EventKind::Delete, deleted)
                }
                None => not_found(request),
            },
            Call::Query { query } => {
                let results: Vec<Value> = self
                    .objects
                    .iter()
                    .filter(|object| query.matches(object))
                    .skip(query.offset)
                    .take(query.limit.unwrap_or(usize::MAX))
                    .cloned()
                    .map(Value::Object)
                    .collect();
                Resolution {
                    completion: Completion::success(request, json!({ "results": results })),
                    event: None,
                }
            }
        }
    }

    fn deliver(&self, resolution: &Resolution) {
        if let Some(sink) = &self.sink {
            sink.send(resolution.completion.clone());
        }
    }
}

fn echoed(request: RequestId, kind: EventKind, object: Map<String, Value>) -> Resolution {
    let event = Event::new(kind, object.clone()).with_request_id(request.as_str());
    Resolution {
        completion: Completion::success(request, Value::Object(object)),
        event: Some(event),
    }
}

fn not_found(request: RequestId) -> Resolution {
    Resolution {
        completion: Completion::failure(request, 404, json!({"message": "object not found"})),
        event: None,
    }
}

impl Backend for FakeBackend {
    fn issue_create(&mut self, payload: Map<String, Value>) -> RequestId {
        self.issue(Call::Create { payload })
    }

    fn issue_update(&mut self, id: &ObjectId, delta: Map<String, Value>) -> RequestId {
        self.issue(Call::Update {
            id: id.clone(),
            delta,
        })
    }

    fn issue_remove(&mut self, id: &ObjectId, object_type: &str) -> RequestId {
        self.issue(Call::Remove {
            id: id.clone(),
            object_type: object_type.to_string(),
        })
    }

    fn issue_query(&mut self, query: &Query) -> RequestId {
        self.issue(Call::Query {
            query: query.clone(),
        })
    }
}
