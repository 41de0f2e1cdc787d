#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use courier_common::{MessageId, Priority};
use courier_queue::{Broker, MemoryBroker, Publisher, RetryRung, Topology};
use tokio::time::{Instant, timeout};

fn short_ladder() -> Topology {
    Topology {
        exchange: "test.exchange".to_string(),
        routing_key: "test.send".to_string(),
        queue: "test.process".to_string(),
        dlx: "test.dlx".to_string(),
        retry: vec![RetryRung::new("test.retry.1", 500), RetryRung::new("test.retry.2", 5_000)],
        max_priority: 10,
    }
}

#[tokio::test(start_paused = true)]
async fn test_rejected_job_cycles_through_entry_rung() {
    let broker = MemoryBroker::new();
    let topology = short_ladder();
    broker.declare(&topology).await.expect("declare");

    let publisher = Publisher::new(Arc::new(broker.clone()), &topology);
    let id = MessageId::generate();
    publisher.publish(id, Priority::Normal).await.expect("publish");

    let mut subscription = broker.subscribe(&topology.queue, 1).await.expect("subscribe");

    // No cap on attempts: every rejection comes back after the entry rung's delay
    for _ in 0..3 {
        let delivery = subscription.next().await.expect("delivery").expect("ok");
        assert_eq!(delivery.envelope().expect("envelope").message_id, id);

        let rejected_at = Instant::now();
        delivery.nack(false).await.expect("reject");
        assert_eq!(broker.ready("test.retry.1"), 1);

        let returned = timeout(Duration::from_secs(10), subscription.next())
            .await
            .expect("job returns")
            .expect("delivery")
            .expect("ok");
        assert!(rejected_at.elapsed() >= Duration::from_millis(500));
        assert_eq!(broker.ready("test.retry.2"), 0);

        returned.nack(true).await.expect("requeue");
    }

    let last = subscription.next().await.expect("delivery").expect("ok");
    last.ack().await.expect("ack");
    assert_eq!(broker.ready(&topology.queue), 0);
    assert_eq!(broker.unacked(&topology.queue), 0);
}

#[tokio::test(start_paused = true)]
async fn test_requeue_skips_ladder() {
    let broker = MemoryBroker::new();
    let topology = short_ladder();
    broker.declare(&topology).await.expect("declare");

    let publisher = Publisher::new(Arc::new(broker.clone()), &topology);
    publisher
        .publish(MessageId::generate(), Priority::High)
        .await
        .expect("publish");

    let mut subscription = broker.subscribe(&topology.queue, 1).await.expect("subscribe");
    let delivery = subscription.next().await.expect("delivery").expect("ok");
    let before = Instant::now();
    delivery.nack(true).await.expect("requeue");

    let again = subscription.next().await.expect("delivery").expect("ok");
    assert!(again.redelivered);
    assert_eq!(before.elapsed(), Duration::ZERO);
    assert_eq!(broker.ready("test.retry.1"), 0);
}

#[tokio::test]
async fn test_jobs_are_shared_between_consumers() {
    let broker = MemoryBroker::new();
    let topology = short_ladder();
    broker.declare(&topology).await.expect("declare");
    let publisher = Publisher::new(Arc::new(broker.clone()), &topology);

    let mut first = broker.subscribe(&topology.queue, 1).await.expect("subscribe");
    let mut second = broker.subscribe(&topology.queue, 1).await.expect("subscribe");

    for _ in 0..2 {
        publisher
            .publish(MessageId::generate(), Priority::Normal)
            .await
            .expect("publish");
    }

    let a = first.next().await.expect("delivery").expect("ok");
    let b = second.next().await.expect("delivery").expect("ok");
    assert_ne!(a.message_id, b.message_id);
    assert_eq!(broker.unacked(&topology.queue), 2);
}
