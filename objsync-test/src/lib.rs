//! # objsync-test: test support for objsync
//!
//! - [`backend`]: [`FakeBackend`], an in-memory request interface whose
//!   requests resolve only when a test says so, in any order
//! - [`server`]: [`NotificationServer`], a WebSocket endpoint that pushes
//!   Event JSON to every connected client

pub mod backend;
pub mod server;

pub use backend::{Call, FakeBackend, IssuedCall, Resolution};
pub use server::NotificationServer;

use objsync_core::{Backend, SyncEngine};

/// Fold a resolution into `engine`, echo Event first when `event_first`.
pub fn deliver<B: Backend>(engine: &mut SyncEngine<B>, resolution: Resolution, event_first: bool) {
    let Resolution { completion, event } = resolution;
    if event_first {
        if let Some(event) = event {
            engine.on_notification(event);
        }
        engine.on_completion(completion);
    } else {
        engine.on_completion(completion);
        if let Some(event) = event {
            engine.on_notification(event);
        }
    }
}
