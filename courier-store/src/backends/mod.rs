//! Backend implementations of the repository traits
//!
//! - `memory`: In-memory storage for tests, development and single-process workers

pub mod memory;

pub use memory::MemoryStore;
