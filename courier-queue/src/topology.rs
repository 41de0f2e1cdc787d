//! Exchange, queue and retry ladder layout
//!
//! ```text
//!            routing key                          nack(requeue=false)
//! exchange ─────────────► main queue ──────────────────────┐
//!    ▲                                                     ▼
//!    │                                      dlx ──► retry rung 1 (TTL)
//!    └─────────────── dead-letter on expiry ◄──────────────┘
//! ```
//!
//! The main queue dead-letters into the DLX under the first rung's name, so a
//! rejected job lands on exactly one rung. Every rung holds messages for its
//! TTL and then dead-letters them back to the main exchange under the main
//! routing key. Later rungs are declared so operators can move jobs onto a
//! longer delay, but nothing escalates to them automatically.

use serde::{Deserialize, Serialize};

use crate::{QueueError, Result};

/// One step of the delayed retry ladder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRung {
    pub queue: String,
    /// Time a job waits on this rung before it returns to the main queue
    pub ttl_ms: u32,
}

impl RetryRung {
    #[must_use]
    pub fn new(queue: impl Into<String>, ttl_ms: u32) -> Self {
        Self {
            queue: queue.into(),
            ttl_ms,
        }
    }
}

/// Names and delays that make up the broker topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
    pub dlx: String,
    pub retry: Vec<RetryRung>,
    pub max_priority: u8,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: "email.exchange".to_string(),
            routing_key: "email.send".to_string(),
            queue: "email.process".to_string(),
            dlx: "email.dlx".to_string(),
            retry: vec![
                RetryRung::new("email.retry.1", 10_000),
                RetryRung::new("email.retry.2", 60_000),
                RetryRung::new("email.retry.3", 300_000),
            ],
            max_priority: 10,
        }
    }
}

/// Arguments of a queue declaration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub message_ttl_ms: Option<u32>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub max_priority: Option<u8>,
}

/// A single step of declaring the topology on a broker
///
/// Every exchange is durable and direct; every queue is durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    Exchange(String),
    Queue(QueueSpec),
    Binding {
        queue: String,
        exchange: String,
        routing_key: String,
    },
}

impl Topology {
    /// The rung a rejected job is dead-lettered onto
    #[must_use]
    pub fn entry_rung(&self) -> Option<&RetryRung> {
        self.retry.first()
    }

    /// Check that the layout can route every job somewhere.
    ///
    /// # Errors
    /// If a name is empty, the ladder has no rungs, or a rung has no delay.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("exchange", &self.exchange),
            ("routing_key", &self.routing_key),
            ("queue", &self.queue),
            ("dlx", &self.dlx),
        ] {
            if value.is_empty() {
                return Err(QueueError::InvalidTopology(format!("{field} is empty")));
            }
        }

        if self.retry.is_empty() {
            return Err(QueueError::InvalidTopology(
                "at least one retry rung is required".to_string(),
            ));
        }

        for rung in &self.retry {
            if rung.queue.is_empty() {
                return Err(QueueError::InvalidTopology(
                    "retry rung queue is empty".to_string(),
                ));
            }
            if rung.ttl_ms == 0 {
                return Err(QueueError::InvalidTopology(format!(
                    "retry rung {} has no delay",
                    rung.queue
                )));
            }
        }

        Ok(())
    }

    /// Ordered declarations that build this topology.
    ///
    /// Exchanges come before the queues bound to them.
    ///
    /// # Errors
    /// If the topology fails [`Topology::validate`].
    pub fn declarations(&self) -> Result<Vec<Declaration>> {
        self.validate()?;

        let entry = self
            .entry_rung()
            .ok_or_else(|| QueueError::InvalidTopology("no retry rungs".to_string()))?;

        let mut plan = vec![
            Declaration::Exchange(self.exchange.clone()),
            Declaration::Exchange(self.dlx.clone()),
            Declaration::Queue(QueueSpec {
                name: self.queue.clone(),
                dead_letter_exchange: Some(self.dlx.clone()),
                dead_letter_routing_key: Some(entry.queue.clone()),
                max_priority: Some(self.max_priority),
                ..QueueSpec::default()
            }),
            Declaration::Binding {
                queue: self.queue.clone(),
                exchange: self.exchange.clone(),
                routing_key: self.routing_key.clone(),
            },
        ];

        for rung in &self.retry {
            plan.push(Declaration::Queue(QueueSpec {
                name: rung.queue.clone(),
                message_ttl_ms: Some(rung.ttl_ms),
                dead_letter_exchange: Some(self.exchange.clone()),
                dead_letter_routing_key: Some(self.routing_key.clone()),
                max_priority: None,
            }));
            plan.push(Declaration::Binding {
                queue: rung.queue.clone(),
                exchange: self.dlx.clone(),
                routing_key: rung.queue.clone(),
            });
        }

        Ok(plan)
    }
}
