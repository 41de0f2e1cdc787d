use std::sync::Arc;

use chrono::Utc;
use courier_common::{MessageId, Priority};
use tracing::{debug, warn};

use crate::{OutboundJob, Result, broker::Broker, topology::Topology};

/// Enqueues job references for durably created messages
#[derive(Debug, Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    exchange: String,
    routing_key: String,
}

impl Publisher {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, topology: &Topology) -> Self {
        Self {
            broker,
            exchange: topology.exchange.clone(),
            routing_key: topology.routing_key.clone(),
        }
    }

    /// Publish a durable job for `message_id` to the main exchange.
    ///
    /// Returns once the broker has confirmed the job.
    ///
    /// # Errors
    /// If the broker is unreachable or answers with a negative confirm.
    #[tracing::instrument(level = "debug", skip(self), fields(%message_id, %priority))]
    pub async fn publish(&self, message_id: MessageId, priority: Priority) -> Result<()> {
        let job = OutboundJob::for_message(message_id, priority, Utc::now())?;

        self.broker
            .publish(&self.exchange, &self.routing_key, job)
            .await
            .inspect_err(|e| warn!(error = %e, "Failed to publish job"))?;

        debug!("Job published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{JobEnvelope, MemoryBroker};

    #[tokio::test]
    async fn test_publish_lands_on_main_queue() {
        let broker = MemoryBroker::new();
        let topology = Topology::default();
        broker.declare(&topology).await.expect("declare");

        let publisher = Publisher::new(Arc::new(broker.clone()), &topology);
        let id = MessageId::generate();
        publisher.publish(id, Priority::Low).await.expect("publish");

        let jobs = broker.peek(&topology.queue);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].priority, 1);
        assert_eq!(jobs[0].message_id, id.to_string());
        assert_eq!(JobEnvelope::decode(&jobs[0].payload).expect("decode").message_id, id);
    }

    #[tokio::test]
    async fn test_publish_without_topology_fails() {
        let publisher = Publisher::new(Arc::new(MemoryBroker::new()), &Topology::default());
        assert!(
            publisher
                .publish(MessageId::generate(), Priority::Normal)
                .await
                .is_err()
        );
    }
}
