use async_trait::async_trait;
use courier_common::internal;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
};
use tracing::debug;

use crate::{
    OutboundJob, QueueError, Result,
    broker::{Acknowledge, Broker, Delivery, Subscription},
    topology::{Declaration, QueueSpec},
};

const PERSISTENT: u8 = 2;
const TRANSIENT: u8 = 1;

/// AMQP 0-9-1 broker (RabbitMQ) over a single connection and channel
///
/// The channel runs in confirm mode, so [`Broker::publish`] only returns
/// once the broker has accepted the job, and fails on a negative confirm.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
}

impl std::fmt::Debug for AmqpBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpBroker")
            .field("status", &self.connection.status().state())
            .field("channel", &self.channel.id())
            .finish()
    }
}

impl AmqpBroker {
    /// Connect and open a channel with publisher confirms enabled
    ///
    /// # Errors
    /// If the broker cannot be reached or refuses the channel
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        internal!(level = INFO, "Connected to AMQP broker");

        Ok(Self {
            connection,
            channel,
        })
    }
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();

    if let Some(ttl) = spec.message_ttl_ms {
        arguments.insert(
            "x-message-ttl".into(),
            AMQPValue::LongInt(i32::try_from(ttl).unwrap_or(i32::MAX)),
        );
    }

    if let Some(exchange) = &spec.dead_letter_exchange {
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.as_str().into()),
        );
    }

    if let Some(routing_key) = &spec.dead_letter_routing_key {
        arguments.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(routing_key.as_str().into()),
        );
    }

    if let Some(max) = spec.max_priority {
        arguments.insert("x-max-priority".into(), AMQPValue::LongInt(i32::from(max)));
    }

    arguments
}

fn properties(job: &OutboundJob) -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(if job.persistent { PERSISTENT } else { TRANSIENT })
        .with_priority(job.priority)
        .with_content_type(job.content_type.as_str().into())
        .with_message_id(job.message_id.as_str().into())
        .with_timestamp(job.timestamp)
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn apply(&self, declaration: &Declaration) -> Result<()> {
        match declaration {
            Declaration::Exchange(name) => {
                self.channel
                    .exchange_declare(
                        name,
                        ExchangeKind::Direct,
                        ExchangeDeclareOptions {
                            durable: true,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await?;
            }
            Declaration::Queue(spec) => {
                self.channel
                    .queue_declare(
                        &spec.name,
                        QueueDeclareOptions {
                            durable: true,
                            ..Default::default()
                        },
                        queue_arguments(spec),
                    )
                    .await?;
            }
            Declaration::Binding {
                queue,
                exchange,
                routing_key,
            } => {
                self.channel
                    .queue_bind(
                        queue,
                        exchange,
                        routing_key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await?;
            }
        }

        debug!(?declaration, "Declared");
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, job: OutboundJob) -> Result<()> {
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &job.payload,
                properties(&job),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(QueueError::Nacked {
                message_id: job.message_id,
            });
        }

        Ok(())
    }

    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<Box<dyn Subscription>> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        internal!(
            level = INFO,
            "Consuming {queue} as {} with prefetch {prefetch}",
            consumer.tag().as_str()
        );

        Ok(Box::new(AmqpSubscription {
            channel: self.channel.clone(),
            tag: consumer.tag(),
            consumer,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.connection.close(200, "Worker shutting down").await?;
        Ok(())
    }
}

struct AmqpSubscription {
    channel: Channel,
    tag: ShortString,
    consumer: lapin::Consumer,
}

impl std::fmt::Debug for AmqpSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpSubscription")
            .field("tag", &self.tag.as_str())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next(&mut self) -> Option<Result<Delivery>> {
        let delivery = match self.consumer.next().await? {
            Ok(delivery) => delivery,
            Err(e) => return Some(Err(e.into())),
        };

        let message_id = delivery
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string());
        let priority = *delivery.properties.priority();

        Some(Ok(Delivery::new(
            delivery.data,
            Box::new(AmqpAcker {
                tag: delivery.delivery_tag,
                acker: delivery.acker,
            }),
        )
        .with_message_id(message_id)
        .with_priority(priority)
        .with_redelivered(delivery.redelivered)))
    }

    async fn cancel(&mut self) -> Result<()> {
        self.channel
            .basic_cancel(self.tag.as_str(), BasicCancelOptions::default())
            .await?;
        Ok(())
    }
}

struct AmqpAcker {
    tag: u64,
    acker: Acker,
}

impl std::fmt::Debug for AmqpAcker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpAcker").field("tag", &self.tag).finish()
    }
}

#[async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}
