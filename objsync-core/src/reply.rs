//! Per-operation reply handles.
//!
//! Every engine operation hands back a [`Reply`] immediately. It resolves
//! exactly once with the backend outcome, and can be awaited or polled without
//! a runtime.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

use crate::error::OperationError;

pub type Outcome = Result<Value, OperationError>;

/// Engine-side half of a reply.
#[derive(Debug)]
pub(crate) struct Responder(oneshot::Sender<Outcome>);

impl Responder {
    pub(crate) fn resolve(self, outcome: Outcome) {
        // The caller may have dropped its Reply; nothing to deliver then.
        let _ = self.0.send(outcome);
    }
}

/// Caller-side handle for one operation.
#[derive(Debug)]
pub struct Reply {
    rx: oneshot::Receiver<Outcome>,
    outcome: Option<Outcome>,
}

impl Reply {
    pub(crate) fn channel() -> (Responder, Reply) {
        let (tx, rx) = oneshot::channel();
        (
            Responder(tx),
            Reply {
                rx,
                outcome: None,
            },
        )
    }

    /// A reply that is already resolved.
    pub fn resolved(outcome: Outcome) -> Reply {
        let (responder, reply) = Reply::channel();
        responder.resolve(outcome);
        reply
    }

    /// The outcome, if the operation has resolved.
    pub fn try_outcome(&mut self) -> Option<&Outcome> {
        if self.outcome.is_none() {
            match self.rx.try_recv() {
                Ok(outcome) => self.outcome = Some(outcome),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => self.outcome = Some(Err(OperationError::EngineDropped)),
            }
        }
        self.outcome.as_ref()
    }

    pub fn is_finished(&mut self) -> bool {
        self.try_outcome().is_some()
    }

    /// Take the outcome out of a finished reply. Do not await the reply after
    /// this returned `Some`.
    pub fn take_outcome(&mut self) -> Option<Outcome> {
        self.try_outcome();
        self.outcome.take()
    }
}

impl Future for Reply {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = this.outcome.take() {
            return Poll::Ready(outcome);
        }
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(OperationError::EngineDropped)))
    }
}
