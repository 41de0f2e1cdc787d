//! The seam between the pipeline and a message broker

use async_trait::async_trait;

use crate::{
    JobEnvelope, OutboundJob, Result,
    topology::{Declaration, Topology},
};

/// Settles a single delivery with the broker that handed it out
#[async_trait]
pub trait Acknowledge: Send + Sync + std::fmt::Debug {
    async fn ack(&self) -> Result<()>;

    /// Reject the delivery. With `requeue` the broker redelivers it from the
    /// same queue; without, it is dead-lettered.
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A job handed to a subscriber, not yet settled
#[derive(Debug)]
pub struct Delivery {
    pub payload: Vec<u8>,
    pub message_id: Option<String>,
    pub priority: Option<u8>,
    /// The broker handed this job out before and it was requeued
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    #[must_use]
    pub fn new(payload: Vec<u8>, acker: Box<dyn Acknowledge>) -> Self {
        Self {
            payload,
            message_id: None,
            priority: None,
            redelivered: false,
            acker,
        }
    }

    #[must_use]
    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: Option<u8>) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Decode the payload as a job envelope
    ///
    /// # Errors
    /// If the payload is not a valid envelope
    pub fn envelope(&self) -> Result<JobEnvelope> {
        JobEnvelope::decode(&self.payload)
    }

    /// # Errors
    /// If the broker refuses the acknowledgement
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    /// # Errors
    /// If the broker refuses the rejection
    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

/// A stream of deliveries from one queue
#[async_trait]
pub trait Subscription: Send + std::fmt::Debug {
    /// The next delivery. `None` once the subscription is cancelled and
    /// everything already handed out has been returned, or the broker went
    /// away.
    async fn next(&mut self) -> Option<Result<Delivery>>;

    /// Stop the broker handing out new deliveries.
    ///
    /// # Errors
    /// If the broker cannot be told
    async fn cancel(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Broker: Send + Sync + std::fmt::Debug {
    /// Declare one exchange, queue or binding. Declaring an existing
    /// object with the same arguments is a no-op.
    ///
    /// # Errors
    /// If the broker refuses the declaration
    async fn apply(&self, declaration: &Declaration) -> Result<()>;

    /// Publish a job and wait until the broker has taken responsibility
    /// for it.
    ///
    /// # Errors
    /// If the broker is unreachable or rejects the message
    async fn publish(&self, exchange: &str, routing_key: &str, job: OutboundJob) -> Result<()>;

    /// Start consuming a queue with at most `prefetch` unsettled deliveries.
    ///
    /// # Errors
    /// If the queue does not exist or the broker is unreachable
    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<Box<dyn Subscription>>;

    /// # Errors
    /// If the connection cannot be closed cleanly
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Declare every exchange, queue and binding of a topology in order.
    ///
    /// # Errors
    /// If the topology is invalid or a declaration fails
    async fn declare(&self, topology: &Topology) -> Result<()> {
        for declaration in topology.declarations()? {
            self.apply(&declaration).await?;
        }
        Ok(())
    }
}
