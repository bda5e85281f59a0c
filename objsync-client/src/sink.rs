//! Completion delivery from a backend implementation to its client task.

use objsync_core::Completion;
use tokio::sync::mpsc;

/// Cloneable handle a [`Backend`](objsync_core::Backend) uses to hand
/// Completions back, from any thread.
#[derive(Debug, Clone)]
pub struct CompletionSink(mpsc::UnboundedSender<Completion>);

/// Receiving half, handed to [`SyncClient::spawn`](crate::SyncClient::spawn).
#[derive(Debug)]
pub struct Completions(pub(crate) mpsc::UnboundedReceiver<Completion>);

impl CompletionSink {
    pub fn channel() -> (CompletionSink, Completions) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CompletionSink(tx), Completions(rx))
    }

    /// Returns `false` once the client task has stopped.
    pub fn send(&self, completion: Completion) -> bool {
        match self.0.send(completion) {
            Ok(()) => true,
            Err(err) => {
                log::debug!(
                    "Dropping completion for {}: client stopped",
                    err.0.request_id
                );
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

impl Completions {
    /// Receive directly, without a client task.
    pub async fn recv(&mut self) -> Option<Completion> {
        self.0.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Completion> {
        self.0.try_recv().ok()
    }
}
