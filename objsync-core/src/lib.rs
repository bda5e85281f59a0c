//! # objsync-core: client-side mirror of a backend object collection
//!
//! Keeps an ordered, optimistic copy of the objects matching one query and
//! reconciles it with request Completions and pushed notification Events,
//! which may arrive in any order.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  issue_*   ┌──────────────┐
//! │  SyncEngine  │ ─────────► │   Backend    │  (caller-supplied)
//! │              │ ◄───────── │              │
//! │ items        │ Completion └──────────────┘
//! │ RowIndex     │
//! │ DeferredOps  │ ◄───────── Event (objsync-wire)
//! └──────┬───────┘
//!        │ ModelChange / CollectionSnapshot
//!        ▼
//!    observers
//! ```
//!
//! ## Modules
//!
//! - [`object_ref`]: temporary and durable object identity
//! - [`index`]: row/identity index with reference counting
//! - [`request`]: backend trait, completions, pending request records
//! - [`query`]: query description and local matching
//! - [`collection`]: rows, snapshots and change notifications
//! - [`reply`]: per-operation reply handles
//! - [`engine`]: the synchronization engine

pub mod collection;
mod deferred;
pub mod engine;
pub mod error;
pub mod index;
pub mod object_ref;
pub mod query;
pub mod reply;
pub mod request;

pub use collection::{CollectionSnapshot, Item, ModelChange, RowSnapshot};
pub use engine::{EngineConfig, SyncEngine};
pub use error::{IndexError, OperationError};
pub use index::{AttachedData, EntryId, RowIndex, RowSlot};
pub use object_ref::{LocalId, ObjectId, ObjectRef};
pub use query::Query;
pub use reply::{Outcome, Reply};
pub use request::{Backend, Completion, PendingKind, RequestId, RequestRecord};
