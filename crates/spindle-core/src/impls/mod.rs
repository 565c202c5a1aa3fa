//! Adapter implementations shipped with the core crate.
//!
//! Only the in-memory adapter lives here. Relational and scripted stores
//! implement `ports::StorageAdapter` in their own crates.

pub mod memory;

pub use self::memory::{InMemoryBackend, InMemoryStorage};
