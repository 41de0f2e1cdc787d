//! Broker side of the courier delivery pipeline
//!
//! - [`topology`]: the main exchange and queue, the dead-letter exchange and
//!   the TTL retry ladder, as an ordered list of declarations
//! - [`Publisher`]: enqueues a job reference once a message is stored
//! - [`Broker`]/[`Subscription`]/[`Delivery`]: the seam the consumer talks
//!   through, implemented by [`AmqpBroker`] (lapin) and [`MemoryBroker`]

pub mod amqp;
pub mod broker;
pub mod config;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod publisher;
pub mod topology;

pub use amqp::AmqpBroker;
pub use broker::{Acknowledge, Broker, Delivery, Subscription};
pub use config::{BrokerConfig, QueueConfig};
pub use envelope::{JSON_CONTENT_TYPE, JobEnvelope, OutboundJob};
pub use error::{QueueError, Result};
pub use memory::{MemoryBroker, MemorySubscription};
pub use publisher::Publisher;
pub use topology::{Declaration, QueueSpec, RetryRung, Topology};
