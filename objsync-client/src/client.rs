//! The client task: one engine, one owner.
//!
//! ```text
//!  SyncClient ── Command ──┐
//!  CompletionSink ─────────┼──► select! ──► SyncEngine ──► watch<CollectionSnapshot>
//!  NotificationChannel ────┘                   │
//!    (Event broadcast, ConnectionState watch)  └──► broadcast<ModelChange>
//! ```
//!
//! Every input is applied to the engine on the task, so the engine never
//! needs a lock. Missed pushes (a reconnect, a lagging receiver) are repaired
//! by re-issuing the current query.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use objsync_core::{
    Backend, CollectionSnapshot, Completion, ModelChange, Query, Reply, SyncEngine,
};
use objsync_wire::{ConnectionState, Event, NotificationChannel};
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::sink::Completions;

/// Push inputs for a client: decoded Events and the connection state.
pub struct Notifications {
    events: Option<broadcast::Receiver<Event>>,
    state: Option<watch::Receiver<ConnectionState>>,
}

impl Notifications {
    pub fn new(
        events: broadcast::Receiver<Event>,
        state: watch::Receiver<ConnectionState>,
    ) -> Self {
        Self {
            events: Some(events),
            state: Some(state),
        }
    }

    /// Subscribe to a running notification channel.
    pub fn from_channel(channel: &NotificationChannel) -> Self {
        Self::new(channel.subscribe(), channel.watch_state())
    }

    /// No push channel; the collection only changes through requests.
    pub fn none() -> Self {
        Self {
            events: None,
            state: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub commands: u64,
    pub completions: u64,
    pub events: u64,
    pub requeries: u64,
}

#[derive(Default)]
struct AtomicClientStats {
    commands: AtomicU64,
    completions: AtomicU64,
    events: AtomicU64,
    requeries: AtomicU64,
}

enum Command {
    Insert {
        row: Option<usize>,
        payload: Map<String, Value>,
        reply: oneshot::Sender<Reply>,
    },
    AppendAll {
        payloads: Vec<Map<String, Value>>,
        reply: oneshot::Sender<Vec<Reply>>,
    },
    Remove {
        row: usize,
        reply: oneshot::Sender<Reply>,
    },
    SetProperty {
        row: usize,
        key: String,
        value: Value,
        reply: oneshot::Sender<Reply>,
    },
    RunQuery {
        query: Query,
        reply: oneshot::Sender<Reply>,
    },
    Refresh {
        reply: oneshot::Sender<Reply>,
    },
    FetchMore {
        reply: oneshot::Sender<Option<Reply>>,
    },
    Shutdown,
}

/// Handle to a running client task.
///
/// Operations return the engine's [`Reply`] as soon as the task has applied
/// them, so several can be in flight at once. Dropping the handle aborts the
/// task; outstanding replies then resolve with `EngineDropped`.
pub struct SyncClient {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<CollectionSnapshot>,
    changes: broadcast::Receiver<ModelChange>,
    stats: Arc<AtomicClientStats>,
    task: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// Move a new engine over `backend` into a background task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<B>(
        backend: B,
        completions: Completions,
        notifications: Notifications,
        config: ClientConfig,
    ) -> Self
    where
        B: Backend + Send + 'static,
    {
        let engine = SyncEngine::with_config(backend, config.engine.clone());
        let changes = engine.subscribe();
        let (commands_tx, commands_rx) = mpsc::channel(config.command_capacity.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(engine.snapshot());
        let stats = Arc::new(AtomicClientStats::default());

        let mut state = notifications.state;
        let was_connected = state
            .as_mut()
            .is_some_and(|state| *state.borrow_and_update() == ConnectionState::Connected);

        let actor = Actor {
            engine,
            config,
            commands: commands_rx,
            completions: completions.0,
            events: notifications.events,
            state,
            snapshot: snapshot_tx,
            stats: stats.clone(),
            was_connected,
        };
        let task = tokio::spawn(actor.run());

        Self {
            commands: commands_tx,
            snapshot: snapshot_rx,
            changes,
            stats,
            task: Some(task),
        }
    }

    pub async fn append(&self, payload: Map<String, Value>) -> Result<Reply, ClientError> {
        self.request(|reply| Command::Insert {
            row: None,
            payload,
            reply,
        })
        .await
    }

    pub async fn insert(
        &self,
        row: usize,
        payload: Map<String, Value>,
    ) -> Result<Reply, ClientError> {
        self.request(|reply| Command::Insert {
            row: Some(row),
            payload,
            reply,
        })
        .await
    }

    pub async fn append_all(
        &self,
        payloads: Vec<Map<String, Value>>,
    ) -> Result<Vec<Reply>, ClientError> {
        self.request(|reply| Command::AppendAll { payloads, reply })
            .await
    }

    pub async fn remove(&self, row: usize) -> Result<Reply, ClientError> {
        self.request(|reply| Command::Remove { row, reply }).await
    }

    pub async fn set_property(
        &self,
        row: usize,
        key: impl Into<String>,
        value: Value,
    ) -> Result<Reply, ClientError> {
        let key = key.into();
        self.request(|reply| Command::SetProperty {
            row,
            key,
            value,
            reply,
        })
        .await
    }

    pub async fn run_query(&self, query: Query) -> Result<Reply, ClientError> {
        self.request(|reply| Command::RunQuery { query, reply })
            .await
    }

    pub async fn refresh(&self) -> Result<Reply, ClientError> {
        self.request(|reply| Command::Refresh { reply }).await
    }

    /// `None` when there is no further page to request right now.
    pub async fn fetch_more(&self) -> Result<Option<Reply>, ClientError> {
        self.request(|reply| Command::FetchMore { reply }).await
    }

    /// The collection as of the last applied input.
    pub fn snapshot(&self) -> CollectionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<CollectionSnapshot> {
        self.snapshot.clone()
    }

    /// Row-level changes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ModelChange> {
        self.changes.resubscribe()
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            commands: self.stats.commands.load(Ordering::Relaxed),
            completions: self.stats.completions.load(Ordering::Relaxed),
            events: self.stats.events.load(Ordering::Relaxed),
            requeries: self.stats.requeries.load(Ordering::Relaxed),
        }
    }

    /// Stop the task after the commands already queued, and wait for it.
    pub async fn shutdown(mut self) {
        if self.commands.send(Command::Shutdown).await.is_err() {
            log::debug!("Sync client already stopped");
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                log::error!("Sync client task ended abnormally: {err}");
            }
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| ClientError::Stopped)?;
        rx.await.map_err(|_| ClientError::Stopped)
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ─── Background task ────────────────────────────────────────────────

struct Actor<B: Backend> {
    engine: SyncEngine<B>,
    config: ClientConfig,
    commands: mpsc::Receiver<Command>,
    completions: mpsc::UnboundedReceiver<Completion>,
    events: Option<broadcast::Receiver<Event>>,
    state: Option<watch::Receiver<ConnectionState>>,
    snapshot: watch::Sender<CollectionSnapshot>,
    stats: Arc<AtomicClientStats>,
    was_connected: bool,
}

enum Input {
    Command(Option<Command>),
    Completion(Option<Completion>),
    Event(Result<Event, RecvError>),
    State(bool),
}

impl<B: Backend> Actor<B> {
    async fn run(mut self) {
        let mut completions_open = true;
        loop {
            // Pushed inputs go first, so a command sees every state change
            // and Event that arrived before it.
            let input = tokio::select! {
                biased;
                changed = changed_state(&mut self.state), if self.state.is_some() => {
                    Input::State(changed)
                }
                event = recv_event(&mut self.events), if self.events.is_some() => {
                    Input::Event(event)
                }
                completion = self.completions.recv(), if completions_open => {
                    Input::Completion(completion)
                }
                command = self.commands.recv() => Input::Command(command),
            };

            match input {
                Input::Command(None) | Input::Command(Some(Command::Shutdown)) => break,
                Input::Command(Some(command)) => {
                    self.stats.commands.fetch_add(1, Ordering::Relaxed);
                    self.apply(command);
                }
                Input::Completion(Some(completion)) => {
                    self.stats.completions.fetch_add(1, Ordering::Relaxed);
                    self.engine.on_completion(completion);
                }
                Input::Completion(None) => {
                    log::warn!("Completion channel closed; outstanding requests will not resolve");
                    completions_open = false;
                }
                Input::Event(Ok(event)) => {
                    self.stats.events.fetch_add(1, Ordering::Relaxed);
                    self.engine.on_notification(event);
                }
                Input::Event(Err(RecvError::Lagged(skipped))) => {
                    log::warn!("Event receiver lagged, {skipped} events dropped");
                    if self.config.requery_on_lag {
                        self.requery();
                    }
                }
                Input::Event(Err(RecvError::Closed)) => {
                    log::info!("Notification channel stopped");
                    self.events = None;
                }
                Input::State(true) => self.connection_changed(),
                Input::State(false) => self.state = None,
            }
            self.snapshot.send_replace(self.engine.snapshot());
        }
        log::debug!(
            "Sync client stopping with {} requests outstanding",
            self.engine.pending_requests()
        );
    }

    fn apply(&mut self, command: Command) {
        // A dropped caller future just discards its reply.
        match command {
            Command::Insert { row, payload, reply } => {
                let row = row.unwrap_or(self.engine.row_count());
                let _ = reply.send(self.engine.insert(row, payload));
            }
            Command::AppendAll { payloads, reply } => {
                let _ = reply.send(self.engine.append_all(payloads));
            }
            Command::Remove { row, reply } => {
                let _ = reply.send(self.engine.remove(row));
            }
            Command::SetProperty {
                row,
                key,
                value,
                reply,
            } => {
                let _ = reply.send(self.engine.set_property(row, key, value));
            }
            Command::RunQuery { query, reply } => {
                let _ = reply.send(self.engine.run_query(query));
            }
            Command::Refresh { reply } => {
                let _ = reply.send(self.engine.refresh());
            }
            Command::FetchMore { reply } => {
                let _ = reply.send(self.engine.fetch_more());
            }
            Command::Shutdown => {}
        }
    }

    fn connection_changed(&mut self) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let current = *state.borrow_and_update();
        log::debug!("Notification channel is {current:?}");
        if current != ConnectionState::Connected {
            return;
        }
        if self.was_connected && self.config.requery_on_reconnect {
            log::info!("Notification channel reconnected, re-running query");
            self.requery();
        }
        self.was_connected = true;
    }

    fn requery(&mut self) {
        if self.engine.query().is_empty() {
            return;
        }
        self.stats.requeries.fetch_add(1, Ordering::Relaxed);
        // The outcome shows up in the collection; nobody awaits it.
        drop(self.engine.refresh());
    }
}

async fn recv_event(events: &mut Option<broadcast::Receiver<Event>>) -> Result<Event, RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// `false` once the sender is gone.
async fn changed_state(state: &mut Option<watch::Receiver<ConnectionState>>) -> bool {
    match state {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}
