//! Main-queue consumer
//!
//! Prefetch is the only backpressure: the broker never hands this worker
//! more than `prefetch` unsettled jobs, and each one runs on its own task.
//! Shutdown stops intake, hands back anything not yet started and waits a
//! bounded time for the rest to finish.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use courier_common::{Signal, internal};
use courier_queue::{Broker, Delivery, QueueError, Subscription};
use tokio::{
    sync::{Notify, broadcast},
    time::{Instant, timeout_at},
};
use tracing::{debug, error, warn};

use crate::{error::ConsumerError, pipeline::Pipeline};

/// Longest a shutdown waits for running deliveries
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// What was done with a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Acknowledged: sent, permanently failed, already final or unreadable
    Acked,
    /// Rejected without requeue, into the retry ladder
    DeadLettered,
    /// Handed straight back to the main queue
    Requeued,
}

#[derive(Debug, Default)]
struct Shared {
    in_flight: AtomicUsize,
    shutting_down: AtomicBool,
    drained: Notify,
}

/// Counts one running delivery for as long as it lives
struct InFlightGuard(Arc<Shared>);

impl InFlightGuard {
    fn enter(shared: &Arc<Shared>) -> Self {
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(shared))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

#[derive(Debug, Clone)]
pub struct Consumer {
    broker: Arc<dyn Broker>,
    pipeline: Pipeline,
    queue: String,
    prefetch: u16,
    shared: Arc<Shared>,
    drain_timeout: Duration,
}

impl Consumer {
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        pipeline: Pipeline,
        queue: impl Into<String>,
        prefetch: u16,
    ) -> Self {
        Self {
            broker,
            pipeline,
            queue: queue.into(),
            prefetch,
            shared: Arc::default(),
            drain_timeout: DRAIN_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Deliveries currently being handled
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::SeqCst)
    }

    /// Run the pipeline for one delivery and settle it:
    ///
    /// - shutting down: requeue without running anything
    /// - sent, permanently failed, already final or missing: ack
    /// - transient failure: reject into the retry ladder
    /// - repository or broker unavailable: requeue
    /// - payload is not a job envelope: ack and log, nothing can act on it
    ///
    /// # Errors
    /// If the broker refuses the settlement
    pub async fn handle(&self, delivery: Delivery) -> Result<Settlement, QueueError> {
        if self.is_shutting_down() {
            delivery.nack(true).await?;
            return Ok(Settlement::Requeued);
        }

        let _guard = InFlightGuard::enter(&self.shared);
        self.settle(delivery).await
    }

    /// Run and settle a delivery the caller has already counted
    async fn settle(&self, delivery: Delivery) -> Result<Settlement, QueueError> {
        let envelope = match delivery.envelope() {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    message_id = ?delivery.message_id,
                    error = %e,
                    "Discarding job that is not a valid envelope"
                );
                delivery.ack().await?;
                return Ok(Settlement::Acked);
            }
        };

        let settlement = match self.pipeline.process(&envelope.message_id).await {
            Ok(outcome) if outcome.is_retryable() => Settlement::DeadLettered,
            Ok(_) => Settlement::Acked,
            Err(e) => {
                error!(
                    message_id = %envelope.message_id,
                    error = %e,
                    "Infrastructure failure, requeueing"
                );
                Settlement::Requeued
            }
        };

        match settlement {
            Settlement::Acked => delivery.ack().await?,
            Settlement::DeadLettered => delivery.nack(false).await?,
            Settlement::Requeued => delivery.nack(true).await?,
        }

        debug!(message_id = %envelope.message_id, ?settlement, "Delivery settled");
        Ok(settlement)
    }

    /// Consume the main queue until a shutdown signal arrives or the
    /// subscription ends, then drain.
    ///
    /// # Errors
    /// If the subscription cannot be opened, or fails while consuming
    pub async fn run(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), ConsumerError> {
        let mut subscription = self.broker.subscribe(&self.queue, self.prefetch).await?;
        internal!(
            level = INFO,
            "Consuming {} with prefetch {}",
            self.queue,
            self.prefetch
        );

        let mut failure = None;

        loop {
            tokio::select! {
                next = subscription.next() => {
                    match next {
                        Some(Ok(delivery)) => {
                            // Counted before the task starts so a drain sees it
                            let guard = InFlightGuard::enter(&self.shared);
                            let consumer = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = consumer.settle(delivery).await {
                                    error!(error = %e, "Failed to settle delivery");
                                }
                                drop(guard);
                            });
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Subscription failed");
                            failure = Some(e);
                            break;
                        }
                        None => {
                            warn!("Subscription closed by broker");
                            break;
                        }
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(level = INFO, "Consumer received shutdown signal");
                        }
                        Err(e) => {
                            error!("Consumer shutdown channel error: {e}");
                        }
                    }
                    break;
                }
            }
        }

        self.drain(subscription).await;

        failure.map_or(Ok(()), |e| Err(e.into()))
    }

    async fn drain(&self, mut subscription: Box<dyn Subscription>) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + self.drain_timeout;

        if let Err(e) = subscription.cancel().await {
            warn!(error = %e, "Failed to cancel subscription");
        }

        // Deliveries the broker already pushed but nobody picked up
        while let Ok(Some(next)) = timeout_at(deadline, subscription.next()).await {
            match next {
                Ok(delivery) => {
                    if let Err(e) = self.handle(delivery).await {
                        warn!(error = %e, "Failed to requeue buffered delivery");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Subscription failed while draining");
                    break;
                }
            }
        }

        let drained = self.shared.drained.notified();
        tokio::pin!(drained);

        loop {
            drained.as_mut().enable();

            let remaining = self.in_flight();
            if remaining == 0 {
                internal!(level = INFO, "All in-flight deliveries completed");
                return;
            }

            debug!(remaining, "Waiting for in-flight deliveries");
            if timeout_at(deadline, drained.as_mut()).await.is_err() {
                warn!(
                    remaining = self.in_flight(),
                    "Drain timeout exceeded, unsettled deliveries will be redelivered by the broker"
                );
                return;
            }

            drained.set(self.shared.drained.notified());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_notifies_when_last_delivery_finishes() {
        let shared = Arc::new(Shared::default());
        let first = InFlightGuard::enter(&shared);
        let second = InFlightGuard::enter(&shared);
        assert_eq!(shared.in_flight.load(Ordering::SeqCst), 2);

        let notified = shared.drained.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        drop(first);
        assert_eq!(shared.in_flight.load(Ordering::SeqCst), 1);
        drop(second);
        assert_eq!(shared.in_flight.load(Ordering::SeqCst), 0);

        let mut cx = std::task::Context::from_waker(std::task::Waker::noop());
        assert!(notified.as_mut().poll(&mut cx).is_ready());
    }
}
