//! The courier worker process
//!
//! Reads its configuration, builds the store, broker, SMTP provider and
//! renderer, and consumes the main queue until told to stop.

pub mod controller;

pub use controller::{Courier, SHUTDOWN_BROADCAST, Worker};
