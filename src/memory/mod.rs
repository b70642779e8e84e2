//! C6 — MemoryStore and its data model (§3, §4.6).

pub mod model;
pub mod schema;
pub mod store;

pub use model::{FieldValue, Memory, MemoryUpdate, SearchRequest, SearchResult};
pub use store::MemoryStore;
