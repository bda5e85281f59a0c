//! # objsync-client: tokio runtime for an objsync engine
//!
//! Owns one [`SyncEngine`](objsync_core::SyncEngine) on a background task and
//! feeds it caller commands, backend Completions and pushed Events.
//!
//! ## Modules
//!
//! - [`client`]: the client task and its handle
//! - [`sink`]: Completion delivery from backend implementations
//! - [`config`]: client configuration
//! - [`error`]: client errors

pub mod client;
pub mod config;
pub mod error;
pub mod sink;

pub use client::{ClientStats, Notifications, SyncClient};
pub use config::ClientConfig;
pub use error::ClientError;
pub use sink::{CompletionSink, Completions};
