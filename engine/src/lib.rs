//! # Lagless Engine
//!
//! Latency compensation and subscription merging for live client/server
//! applications.
//!
//! This crate holds the IO-free core shared by client and server: the data
//! model, the merge box that combines documents published by overlapping
//! subscriptions, the layered local store applications read from, the
//! simulation and reconciliation of optimistic method calls, and the wire
//! protocol.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches a socket or a clock
//! - **Single-threaded client**: every input is processed in order on the
//!   caller's thread, so the client side needs no locking
//! - **Explicit context**: method bodies get everything through a
//!   [`MethodContext`], including whether they run as a simulation
//! - **Fail loudly**: bookkeeping inconsistencies in the merge box or the
//!   local store panic instead of being repaired
//!
//! ## Core Concepts
//!
//! ### Merge Box
//!
//! The [`MergeBox`] keeps, per document, the field snapshot each
//! subscription asserts. The visible document is the union of those
//! snapshots; when two subscriptions disagree on a field, the most recent
//! assertion wins. Only changes of the visible document go downstream.
//!
//! ### Local Store
//!
//! The [`LocalStore`] layers simulated writes over what the merge box
//! asserts. Each overlay belongs to one invocation and is retracted as a
//! whole when the server answers.
//!
//! ### Invocations
//!
//! The [`Reconciler`] walks every invocation through
//! `Simulating -> Simulated -> AwaitingServer -> Confirmed | Failed` and
//! guarantees exactly one retraction per invocation.
//!
//! ### Client
//!
//! The [`Client`] is a sans-IO state machine wiring all of the above to the
//! [`protocol`] messages, including resync after a reconnect.
//!
//! ## Quick Start
//!
//! ```rust
//! use lagless_engine::{fields_from_json, DocChange, FieldDiff, MergeBox};
//! use serde_json::json;
//!
//! let mut merge = MergeBox::new();
//!
//! // Two subscriptions publish different fields of the same document
//! let first = merge.added("s1", "posts", "1", fields_from_json(json!({"title": "A"})));
//! assert!(matches!(first, Some(DocChange::Added(_))));
//! merge.added("s2", "posts", "1", fields_from_json(json!({"author": "X"})));
//! assert_eq!(merge.ref_count("posts", "1"), 2);
//!
//! // The first one withdraws: its field disappears, the document stays
//! let change = merge.removed("s1", "posts", "1");
//! assert_eq!(change, Some(DocChange::Changed(FieldDiff::new().unset("title"))));
//! assert_eq!(
//!     merge.get("posts", "1"),
//!     Some(fields_from_json(json!({"author": "X"})))
//! );
//! ```

pub mod client;
pub mod diff;
pub mod document;
pub mod error;
pub mod local;
pub mod merge_box;
pub mod method;
pub mod protocol;
pub mod reconcile;
pub mod subscription;

// Re-export main types at crate root
pub use client::{Client, ClientConfig, ClientEvent, Invocation, ReconnectPolicy};
pub use diff::{DocChange, DocWrite, FieldDiff};
pub use document::{fields_from_json, DocKey, Document, Fields};
pub use error::{Error, MethodError};
pub use local::{
    ChangeEvent, LocalCollection, LocalQuery, LocalStore, Observer, ObserverId, SimulatedWrite,
    Simulation,
};
pub use merge_box::{MergeBox, MergeEntry};
pub use method::{
    Authorizer, DocumentAccess, Handler, IdGenerator, MethodContext, MethodDef, MethodRegistry,
    MethodResult, DEFAULT_MAX_CALL_DEPTH,
};
pub use protocol::{ClientMessage, ServerMessage};
pub use reconcile::{InvocationRecord, InvocationState, Outcome, Reconciler};
pub use subscription::{SubscriptionRecord, SubscriptionStatus};

/// Type aliases for clarity
pub type DocumentId = String;
pub type CollectionName = String;
pub type FieldName = String;
pub type SubscriptionId = String;
pub type InvocationId = String;
pub type UserId = String;

/// Abort on broken bookkeeping.
#[cold]
#[track_caller]
pub(crate) fn invariant_violated(component: &str, what: std::fmt::Arguments<'_>) -> ! {
    panic!("{component} invariant violated: {what}")
}
