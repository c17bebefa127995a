//! Storage module
//!
//! Pluggable key-value storage behind a DHT node.

pub mod backend;
pub mod memory;

pub use backend::{Storage, StoredValue};
pub use memory::InMemoryStorage;
