use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{
    OutboundJob, QueueError, Result,
    broker::{Acknowledge, Broker, Delivery, Subscription},
    topology::{Declaration, QueueSpec},
};

type Shared = Arc<Mutex<State>>;

#[derive(Debug, Clone)]
struct Stored {
    /// Identity of this copy while it sits in one queue
    seq: u64,
    job: OutboundJob,
    routing_key: String,
    redelivered: bool,
}

#[derive(Debug)]
struct Consumer {
    id: u64,
    /// 0 = unlimited
    prefetch: usize,
    unacked: usize,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl Consumer {
    const fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked < self.prefetch
    }
}

#[derive(Debug)]
struct Queue {
    spec: QueueSpec,
    ready: VecDeque<Stored>,
    /// delivery tag -> (consumer id, message)
    unacked: HashMap<u64, (u64, Stored)>,
    consumers: Vec<Consumer>,
    cursor: usize,
}

impl Queue {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            cursor: 0,
        }
    }

    /// Round-robin over consumers with spare prefetch
    fn next_consumer(&mut self) -> Option<usize> {
        let count = self.consumers.len();
        for offset in 0..count {
            let index = (self.cursor + offset) % count;
            if self.consumers[index].has_capacity() {
                self.cursor = (index + 1) % count;
                return Some(index);
            }
        }
        None
    }

    /// Highest priority first, FIFO among equals
    fn next_ready_index(&self) -> usize {
        let Some(max) = self.spec.max_priority else {
            return 0;
        };

        let mut best = 0;
        let mut best_priority = None;
        for (index, stored) in self.ready.iter().enumerate() {
            let priority = stored.job.priority.min(max);
            if best_priority.is_none_or(|current| priority > current) {
                best = index;
                best_priority = Some(priority);
            }
        }
        best
    }
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashSet<String>,
    queues: HashMap<String, Queue>,
    /// (exchange, routing key, queue)
    bindings: Vec<(String, String, String)>,
    next_seq: u64,
    next_tag: u64,
    next_consumer: u64,
}

/// A single-process broker with AMQP direct-exchange semantics
///
/// Supports everything the delivery topology relies on: durable direct
/// exchanges, bindings, per-queue message TTL, dead-letter exchange and
/// routing key, queue priorities, prefetch-limited consumers, and
/// ack/nack with or without requeue. Expired messages are dead-lettered by
/// a tokio timer, so tests can drive the retry ladder with paused time.
///
/// Nothing is persisted; the `persistent` flag on a job is recorded but
/// has no effect.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Shared,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of messages waiting in a queue (0 for unknown queues)
    #[must_use]
    pub fn ready(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Number of messages handed out from a queue and not yet settled
    #[must_use]
    pub fn unacked(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Copies of the jobs waiting in a queue, in queue order
    #[must_use]
    pub fn peek(&self, queue: &str) -> Vec<OutboundJob> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|s| s.job.clone()).collect())
            .unwrap_or_default()
    }
}

fn route(
    shared: &Shared,
    state: &mut State,
    exchange: &str,
    routing_key: &str,
    job: &OutboundJob,
) -> Result<usize> {
    if !state.exchanges.contains(exchange) {
        return Err(QueueError::UnknownExchange(exchange.to_string()));
    }

    let targets: Vec<String> = state
        .bindings
        .iter()
        .filter(|(e, k, _)| e == exchange && k == routing_key)
        .map(|(_, _, queue)| queue.clone())
        .collect();

    if targets.is_empty() {
        trace!(exchange, routing_key, "Dropping unroutable message");
    }

    for queue in &targets {
        state.next_seq += 1;
        let stored = Stored {
            seq: state.next_seq,
            job: job.clone(),
            routing_key: routing_key.to_string(),
            redelivered: false,
        };
        enqueue(shared, state, queue, stored);
    }

    Ok(targets.len())
}

fn enqueue(shared: &Shared, state: &mut State, queue_name: &str, stored: Stored) {
    let Some(queue) = state.queues.get_mut(queue_name) else {
        return;
    };

    if let Some(ttl) = queue.spec.message_ttl_ms {
        let shared = Arc::clone(shared);
        let name = queue_name.to_string();
        let seq = stored.seq;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(u64::from(ttl))).await;
            let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
            expire(&shared, &mut state, &name, seq);
        });
    }

    queue.ready.push_back(stored);
    dispatch(shared, state, queue_name);
}

fn expire(shared: &Shared, state: &mut State, queue_name: &str, seq: u64) {
    let Some(queue) = state.queues.get_mut(queue_name) else {
        return;
    };

    // Already handed out or settled
    let Some(position) = queue.ready.iter().position(|s| s.seq == seq) else {
        return;
    };

    if let Some(stored) = queue.ready.remove(position) {
        trace!(queue = queue_name, message_id = %stored.job.message_id, "Message expired");
        dead_letter(shared, state, queue_name, stored);
    }
}

fn dead_letter(shared: &Shared, state: &mut State, queue_name: &str, stored: Stored) {
    let Some(queue) = state.queues.get(queue_name) else {
        return;
    };

    let Some(exchange) = queue.spec.dead_letter_exchange.clone() else {
        debug!(queue = queue_name, message_id = %stored.job.message_id, "Discarding rejected message, queue has no dead-letter exchange");
        return;
    };
    let routing_key = queue
        .spec
        .dead_letter_routing_key
        .clone()
        .unwrap_or(stored.routing_key);

    if let Err(e) = route(shared, state, &exchange, &routing_key, &stored.job) {
        debug!(queue = queue_name, error = %e, "Dead-lettering failed, message discarded");
    }
}

fn dispatch(shared: &Shared, state: &mut State, queue_name: &str) {
    let Some(queue) = state.queues.get_mut(queue_name) else {
        return;
    };

    while !queue.ready.is_empty() {
        let Some(slot) = queue.next_consumer() else {
            break;
        };
        let index = queue.next_ready_index();
        let Some(stored) = queue.ready.remove(index) else {
            break;
        };

        state.next_tag += 1;
        let tag = state.next_tag;

        let delivery = Delivery::new(
            stored.job.payload.clone(),
            Box::new(MemoryAcker {
                shared: Arc::clone(shared),
                queue: queue_name.to_string(),
                tag,
            }),
        )
        .with_message_id(Some(stored.job.message_id.clone()))
        .with_priority(Some(stored.job.priority))
        .with_redelivered(stored.redelivered);

        if queue.consumers[slot].sender.send(delivery).is_err() {
            // Subscriber went away without cancelling
            queue.consumers.remove(slot);
            queue.cursor = 0;
            queue.ready.push_front(stored);
            continue;
        }

        let consumer = &mut queue.consumers[slot];
        consumer.unacked += 1;
        queue.unacked.insert(tag, (consumer.id, stored));
    }
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Ack,
    Requeue,
    Reject,
}

fn settle(shared: &Shared, queue_name: &str, tag: u64, how: Settle) -> Result<()> {
    let mut guard = shared.lock()?;
    let state = &mut *guard;

    let queue = state
        .queues
        .get_mut(queue_name)
        .ok_or_else(|| QueueError::UnknownQueue(queue_name.to_string()))?;

    let (consumer_id, mut stored) = queue
        .unacked
        .remove(&tag)
        .ok_or_else(|| QueueError::Internal(format!("Unknown delivery tag {tag}")))?;

    if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.id == consumer_id) {
        consumer.unacked = consumer.unacked.saturating_sub(1);
    }

    match how {
        Settle::Ack => {}
        Settle::Requeue => {
            stored.redelivered = true;
            queue.ready.push_front(stored);
        }
        Settle::Reject => dead_letter(shared, state, queue_name, stored),
    }

    dispatch(shared, state, queue_name);
    Ok(())
}

#[derive(Debug)]
struct MemoryAcker {
    shared: Shared,
    queue: String,
    tag: u64,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        settle(&self.shared, &self.queue, self.tag, Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let how = if requeue {
            Settle::Requeue
        } else {
            Settle::Reject
        };
        settle(&self.shared, &self.queue, self.tag, how)
    }
}

/// Deliveries from one queue of a [`MemoryBroker`]
#[derive(Debug)]
pub struct MemorySubscription {
    shared: Shared,
    queue: String,
    consumer_id: u64,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl MemorySubscription {
    fn deregister(&self) {
        let mut state = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(queue) = state.queues.get_mut(&self.queue) {
            queue.consumers.retain(|c| c.id != self.consumer_id);
            queue.cursor = 0;
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        self.receiver.recv().await.map(Ok)
    }

    async fn cancel(&mut self) -> Result<()> {
        self.deregister();
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.deregister();
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn apply(&self, declaration: &Declaration) -> Result<()> {
        let mut state = self.shared.lock()?;

        match declaration {
            Declaration::Exchange(name) => {
                state.exchanges.insert(name.clone());
            }
            Declaration::Queue(spec) => match state.queues.get(&spec.name) {
                Some(existing) if existing.spec != *spec => {
                    return Err(QueueError::InvalidTopology(format!(
                        "queue {} already declared with different arguments",
                        spec.name
                    )));
                }
                Some(_) => {}
                None => {
                    state.queues.insert(spec.name.clone(), Queue::new(spec.clone()));
                }
            },
            Declaration::Binding {
                queue,
                exchange,
                routing_key,
            } => {
                if !state.exchanges.contains(exchange) {
                    return Err(QueueError::UnknownExchange(exchange.clone()));
                }
                if !state.queues.contains_key(queue) {
                    return Err(QueueError::UnknownQueue(queue.clone()));
                }
                let binding = (exchange.clone(), routing_key.clone(), queue.clone());
                if !state.bindings.contains(&binding) {
                    state.bindings.push(binding);
                }
            }
        }

        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, job: OutboundJob) -> Result<()> {
        let mut state = self.shared.lock()?;
        route(&self.shared, &mut state, exchange, routing_key, &job)?;
        Ok(())
    }

    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<Box<dyn Subscription>> {
        let mut guard = self.shared.lock()?;
        let state = &mut *guard;

        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;

        state.next_consumer += 1;
        let consumer_id = state.next_consumer;
        let (sender, receiver) = mpsc::unbounded_channel();
        target.consumers.push(Consumer {
            id: consumer_id,
            prefetch: usize::from(prefetch),
            unacked: 0,
            sender,
        });

        dispatch(&self.shared, state, queue);

        Ok(Box::new(MemorySubscription {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
            consumer_id,
            receiver,
        }))
    }
}

#[cfg(test)]
mod tests {
    use courier_common::{MessageId, Priority};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{JobEnvelope, topology::Topology};

    fn job(priority: Priority) -> OutboundJob {
        OutboundJob::for_message(MessageId::generate(), priority, chrono::Utc::now())
            .expect("job")
    }

    async fn declared() -> (MemoryBroker, Topology) {
        let broker = MemoryBroker::new();
        let topology = Topology::default();
        broker.declare(&topology).await.expect("declare");
        (broker, topology)
    }

    #[tokio::test]
    async fn test_prefetch_limits_unsettled_deliveries() {
        let (broker, topology) = declared().await;
        for _ in 0..5 {
            broker
                .publish(&topology.exchange, &topology.routing_key, job(Priority::Normal))
                .await
                .expect("publish");
        }

        let mut subscription = broker.subscribe(&topology.queue, 2).await.expect("subscribe");
        let first = subscription.next().await.expect("delivery").expect("ok");
        let _second = subscription.next().await.expect("delivery").expect("ok");

        assert_eq!(broker.unacked(&topology.queue), 2);
        assert_eq!(broker.ready(&topology.queue), 3);

        first.ack().await.expect("ack");
        assert_eq!(broker.unacked(&topology.queue), 2);
        assert_eq!(broker.ready(&topology.queue), 2);
    }

    #[tokio::test]
    async fn test_priority_order() {
        let (broker, topology) = declared().await;
        for priority in [Priority::Low, Priority::Critical, Priority::Normal] {
            broker
                .publish(&topology.exchange, &topology.routing_key, job(priority))
                .await
                .expect("publish");
        }

        let mut subscription = broker.subscribe(&topology.queue, 0).await.expect("subscribe");
        let mut order = Vec::new();
        for _ in 0..3 {
            let delivery = subscription.next().await.expect("delivery").expect("ok");
            order.push(delivery.priority);
            delivery.ack().await.expect("ack");
        }
        assert_eq!(order, vec![Some(10), Some(5), Some(1)]);
    }

    #[tokio::test]
    async fn test_requeue_marks_redelivered() {
        let (broker, topology) = declared().await;
        let job = job(Priority::High);
        let id = JobEnvelope::decode(&job.payload).expect("decode").message_id;
        broker
            .publish(&topology.exchange, &topology.routing_key, job)
            .await
            .expect("publish");

        let mut subscription = broker.subscribe(&topology.queue, 1).await.expect("subscribe");
        let delivery = subscription.next().await.expect("delivery").expect("ok");
        assert!(!delivery.redelivered);
        delivery.nack(true).await.expect("nack");

        let again = subscription.next().await.expect("delivery").expect("ok");
        assert!(again.redelivered);
        assert_eq!(again.envelope().expect("envelope").message_id, id);
        assert!(again.ack().await.is_ok());
        assert!(again.ack().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_returns_after_entry_rung_ttl() {
        let (broker, topology) = declared().await;
        broker
            .publish(&topology.exchange, &topology.routing_key, job(Priority::Normal))
            .await
            .expect("publish");

        let mut subscription = broker.subscribe(&topology.queue, 1).await.expect("subscribe");
        let delivery = subscription.next().await.expect("delivery").expect("ok");
        delivery.nack(false).await.expect("nack");

        assert_eq!(broker.ready("email.retry.1"), 1);
        assert_eq!(broker.ready("email.retry.2"), 0);
        assert_eq!(broker.ready("email.retry.3"), 0);

        tokio::time::sleep(Duration::from_millis(9_999)).await;
        assert_eq!(broker.ready("email.retry.1"), 1);

        let returned = tokio::time::timeout(Duration::from_secs(1), subscription.next())
            .await
            .expect("returned after ttl")
            .expect("delivery")
            .expect("ok");
        assert!(!returned.redelivered);
        assert_eq!(broker.ready("email.retry.1"), 0);
    }

    #[tokio::test]
    async fn test_cancel_ends_subscription() {
        let (broker, topology) = declared().await;
        let mut subscription = broker.subscribe(&topology.queue, 1).await.expect("subscribe");
        subscription.cancel().await.expect("cancel");
        assert!(subscription.next().await.is_none());

        broker
            .publish(&topology.exchange, &topology.routing_key, job(Priority::Normal))
            .await
            .expect("publish");
        assert_eq!(broker.ready(&topology.queue), 1);
    }

    #[tokio::test]
    async fn test_unknown_targets() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.publish("nowhere", "key", job(Priority::Normal)).await,
            Err(QueueError::UnknownExchange(_))
        ));
        assert!(matches!(
            broker.subscribe("nowhere", 1).await,
            Err(QueueError::UnknownQueue(_))
        ));
    }

    #[tokio::test]
    async fn test_redeclare_with_different_arguments_fails() {
        let (broker, topology) = declared().await;
        broker.declare(&topology).await.expect("same arguments");

        let changed = Topology {
            max_priority: 5,
            ..topology
        };
        assert!(broker.declare(&changed).await.is_err());
    }
}
