//! Repositories the courier pipeline reads and writes through
//!
//! The pipeline treats persistence as an external collaborator: it only
//! talks to the traits in [`repository`]. The in-memory backend in
//! [`backends`] implements all of them behind a single lock so that a status
//! transition and its audit event become visible together.

pub mod backends;
pub mod config;
pub mod error;
pub mod repository;

pub use backends::MemoryStore;
pub use config::{MemoryConfig, StoreConfig, Stores};
pub use error::{Result, StoreError};
pub use repository::{
    EventRepository, MessageFilter, MessageRepository, Page, SuppressionRepository,
    TenantRepository,
};
