//! The authoritative document store and its live queries.

mod memory;
mod query;

pub use memory::{Cursor, MemoryStore, ObserveCallbacks};
pub use query::{Query, Selector};
