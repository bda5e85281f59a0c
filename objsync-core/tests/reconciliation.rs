//! Reconciliation tests: Completions and echo Events delivered in arbitrary
//! orders must converge to the backend's state.

use std::cell::RefCell;
use std::rc::Rc;

use objsync_core::{
    Backend, Completion, ObjectId, Query, Reply, RequestId, SyncEngine,
};
use objsync_wire::{Event, EventKind};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

const TODOS: &str = "objects.todos";

enum Message {
    Completion(Completion),
    Event(Event),
}

/// In-memory backend. Requests are applied the moment they are issued; their
/// Completions and echo Events queue up for the test to deliver.
#[derive(Default)]
struct Server {
    objects: Vec<(String, Map<String, Value>)>,
    outbox: Vec<Message>,
    next_id: u32,
    next_request: u32,
}

impl Server {
    fn seeded(ids: &[&str]) -> Self {
        let mut server = Server::default();
        for id in ids {
            let object = json!({"id": id, "objectType": TODOS, "title": id});
            server
                .objects
                .push((id.to_string(), object.as_object().unwrap().clone()));
        }
        server
    }

    fn request(&mut self) -> RequestId {
        self.next_request += 1;
        RequestId::new(format!("r{}", self.next_request))
    }

    fn ids(&self) -> Vec<String> {
        self.objects.iter().map(|(id, _)| id.clone()).collect()
    }

    fn reply(&mut self, request: &RequestId, result: Result<Map<String, Value>, u16>, kind: EventKind) {
        match result {
            Ok(object) => {
                self.outbox.push(Message::Event(
                    Event::new(kind, object.clone()).with_request_id(request.as_str()),
                ));
                self.outbox.push(Message::Completion(Completion::success(
                    request.clone(),
                    Value::Object(object),
                )));
            }
            Err(status) => self.outbox.push(Message::Completion(Completion::failure(
                request.clone(),
                status,
                json!({"message": "not found"}),
            ))),
        }
    }
}

#[derive(Clone)]
struct Shared(Rc<RefCell<Server>>);

impl Backend for Shared {
    fn issue_create(&mut self, mut payload: Map<String, Value>) -> RequestId {
        let mut server = self.0.borrow_mut();
        let request = server.request();
        server.next_id += 1;
        let id = format!("s{}", server.next_id);
        payload.insert("id".into(), Value::String(id.clone()));
        server.objects.push((id, payload.clone()));
        server.reply(&request, Ok(payload), EventKind::Create);
        request
    }

    fn issue_update(&mut self, id: &ObjectId, delta: Map<String, Value>) -> RequestId {
        let mut server = self.0.borrow_mut();
        let request = server.request();
        let result = match server.objects.iter_mut().find(|(key, _)| key == id.as_str()) {
            Some((_, object)) => {
                object.extend(delta);
                Ok(object.clone())
            }
            None => Err(404),
        };
        server.reply(&request, result, EventKind::Update);
        request
    }

    fn issue_remove(&mut self, id: &ObjectId, object_type: &str) -> RequestId {
        let mut server = self.0.borrow_mut();
        let request = server.request();
        let before = server.objects.len();
        server.objects.retain(|(key, _)| key != id.as_str());
        let result = if server.objects.len() < before {
            let deleted = json!({"id": id.as_str(), "objectType": object_type});
            Ok(deleted.as_object().unwrap().clone())
        } else {
            Err(404)
        };
        server.reply(&request, result, EventKind::Delete);
        request
    }

    fn issue_query(&mut self, _query: &Query) -> RequestId {
        let mut server = self.0.borrow_mut();
        let request = server.request();
        let results: Vec<Value> = server
            .objects
            .iter()
            .map(|(_, object)| Value::Object(object.clone()))
            .collect();
        server.outbox.push(Message::Completion(Completion::success(
            request.clone(),
            json!({ "results": results }),
        )));
        request
    }
}

struct Harness {
    server: Rc<RefCell<Server>>,
    engine: SyncEngine<Shared>,
    replies: Vec<Reply>,
}

impl Harness {
    /// Engine showing the seeded objects, with the initial query delivered.
    fn new(ids: &[&str]) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let server = Rc::new(RefCell::new(Server::seeded(ids)));
        let mut engine = SyncEngine::new(Shared(server.clone()));
        let mut harness = Harness {
            server,
            engine: {
                engine.run_query(Query::new(TODOS));
                engine
            },
            replies: Vec::new(),
        };
        harness.deliver_all_reversed();
        harness
    }

    fn take_outbox(&self) -> Vec<Message> {
        std::mem::take(&mut self.server.borrow_mut().outbox)
    }

    fn deliver(&mut self, message: Message) {
        match message {
            Message::Completion(completion) => self.engine.on_completion(completion),
            Message::Event(event) => self.engine.on_notification(event),
        }
    }

    /// Deliver everything, newest first, until nothing is left in flight.
    fn deliver_all_reversed(&mut self) {
        loop {
            let batch = self.take_outbox();
            if batch.is_empty() {
                break;
            }
            for message in batch.into_iter().rev() {
                self.deliver(message);
            }
        }
    }

    /// Deliver one queued message chosen by `seed`.
    fn deliver_one(&mut self, seed: usize) -> bool {
        let mut queued = self.take_outbox();
        if queued.is_empty() {
            return false;
        }
        let message = queued.remove(seed % queued.len());
        // Anything issued while delivering lands behind the rest.
        self.server.borrow_mut().outbox.splice(0..0, queued);
        self.deliver(message);
        true
    }

    fn row_ids(&self) -> Vec<String> {
        self.engine
            .items()
            .iter()
            .map(|item| item.object.to_string())
            .collect()
    }

    fn assert_converged(&mut self) {
        assert_eq!(self.row_ids(), self.server.borrow().ids());
        assert_eq!(self.engine.pending_requests(), 0);
        assert_eq!(self.engine.deferred_operations(), 0);
        assert_eq!(self.engine.index().entry_count(), self.engine.row_count());
        for row in 0..self.engine.row_count() {
            assert_eq!(self.engine.is_synced(row), Some(true));
        }
        for reply in &mut self.replies {
            assert!(reply.is_finished());
        }
    }
}

#[test]
fn test_remove_and_update_with_reversed_completions() {
    let mut harness = Harness::new(&["A", "B"]);
    harness.replies.push(harness.engine.remove(1));
    harness
        .replies
        .push(harness.engine.set_property(0, "x", json!(5)));
    // Row 1 stays until the backend confirms the removal.
    assert_eq!(harness.engine.row_count(), 2);

    harness.deliver_all_reversed();

    assert_eq!(harness.engine.row_count(), 1);
    let row = harness.engine.get(0).unwrap();
    assert_eq!(row.object.to_string(), "A");
    assert_eq!(row.get("x"), Some(&json!(5)));
    for reply in &mut harness.replies {
        assert!(matches!(reply.try_outcome(), Some(Ok(_))));
    }
    harness.assert_converged();
}

#[test]
fn test_append_then_remove_before_create_completes() {
    let mut harness = Harness::new(&[]);
    harness
        .replies
        .push(harness.engine.append(json!({"title": "x"}).as_object().unwrap().clone()));
    harness.replies.push(harness.engine.remove(0));

    harness.deliver_all_reversed();

    assert_eq!(harness.engine.row_count(), 0);
    for reply in &mut harness.replies {
        assert!(matches!(reply.try_outcome(), Some(Ok(_))));
    }
    harness.assert_converged();
}

#[test]
fn test_delete_twice_heals() {
    let mut harness = Harness::new(&["A", "B"]);
    harness.replies.push(harness.engine.remove(0));
    let mut second = harness.engine.remove(0);

    harness.deliver_all_reversed();

    assert_eq!(harness.row_ids(), vec!["B"]);
    // The second request found nothing left to remove.
    assert_eq!(
        second.try_outcome().unwrap().as_ref().unwrap_err().status(),
        Some(404)
    );
    harness.assert_converged();
}

#[derive(Debug, Clone)]
enum Step {
    Append,
    Remove(usize),
    Set(usize, i64),
    Deliver(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::Append),
        any::<usize>().prop_map(Step::Remove),
        (any::<usize>(), any::<i64>()).prop_map(|(row, value)| Step::Set(row, value)),
        any::<usize>().prop_map(Step::Deliver),
        any::<usize>().prop_map(Step::Deliver),
    ]
}

proptest! {
    #[test]
    fn converges_in_any_delivery_order(
        steps in prop::collection::vec(step(), 1..40),
        drain in prop::collection::vec(any::<usize>(), 0..64),
    ) {
        let mut harness = Harness::new(&["A", "B", "C"]);
        for step in steps {
            let rows = harness.engine.row_count();
            match step {
                Step::Append => {
                    let reply = harness.engine.append(Map::new());
                    harness.replies.push(reply);
                }
                Step::Remove(row) if rows > 0 => {
                    let reply = harness.engine.remove(row % rows);
                    harness.replies.push(reply);
                }
                Step::Set(row, value) if rows > 0 => {
                    let reply = harness.engine.set_property(row % rows, "n", json!(value));
                    harness.replies.push(reply);
                }
                Step::Deliver(seed) => {
                    harness.deliver_one(seed);
                }
                _ => {}
            }
        }
        for seed in drain {
            harness.deliver_one(seed);
        }
        harness.deliver_all_reversed();
        harness.assert_converged();
    }
}
