//! Queue access shared by the task scheduler and the workers.
//!
//! Consumers talk to a queue through [`QueueSource`] so the scheduling and
//! retry logic can run against an in-memory queue in tests. [`AmqpQueue`] is
//! the RabbitMQ implementation: one connection and one channel per consumer,
//! never shared between processing units.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions,
    BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties, Consumer};

use crate::error::AppError;
use crate::types::{DELIVERY_COUNT_HEADER, InboundDelivery, Settlement};

/// A single-consumer view of one queue.
#[async_trait]
pub trait QueueSource: Send {
    /// Wait for the next delivery. `None` means the consumer was closed by the broker.
    async fn recv(&mut self) -> Result<Option<InboundDelivery>, AppError>;

    /// Acknowledge or reject a delivery.
    async fn settle(&mut self, delivery_tag: u64, settlement: Settlement) -> Result<(), AppError>;

    /// Cancel the subscription and release the connection. Unsettled deliveries
    /// return to the queue.
    async fn close(&mut self) -> Result<(), AppError>;
}

/// RabbitMQ consumer bound to a durable quorum queue.
pub struct AmqpQueue {
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
    consumer_tag: String,
    queue: String,
    closed: bool,
}

impl AmqpQueue {
    /// Connect, declare `queue` as a durable quorum queue, apply `prefetch`
    /// and start consuming with manual acknowledgement.
    pub async fn open(
        amqp_url: &str,
        queue: &str,
        prefetch: u16,
        consumer_tag: &str,
    ) -> Result<Self, AppError> {
        let connection = Connection::connect(amqp_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        declare_quorum_queue(&channel, queue).await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        tracing::debug!(queue, consumer_tag, prefetch, "Consuming from queue");

        Ok(Self {
            connection,
            channel,
            consumer,
            consumer_tag: consumer_tag.to_string(),
            queue: queue.to_string(),
            closed: false,
        })
    }
}

#[async_trait]
impl QueueSource for AmqpQueue {
    async fn recv(&mut self) -> Result<Option<InboundDelivery>, AppError> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => {
                let delivery_count = delivery_count(delivery.properties.headers().as_ref());
                Ok(Some(InboundDelivery::new(
                    delivery.delivery_tag,
                    delivery_count,
                    delivery.data,
                )))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn settle(&mut self, delivery_tag: u64, settlement: Settlement) -> Result<(), AppError> {
        match settlement {
            Settlement::Ack => {
                self.channel
                    .basic_ack(delivery_tag, BasicAckOptions::default())
                    .await?
            }
            Settlement::Reject { requeue } => {
                self.channel
                    .basic_reject(delivery_tag, BasicRejectOptions { requeue })
                    .await?
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), AppError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await?;
        self.channel.close(200, "consumer finished").await?;
        self.connection.close(200, "consumer finished").await?;

        tracing::debug!(queue = %self.queue, consumer_tag = %self.consumer_tag, "Queue connection released");
        Ok(())
    }
}

/// Declare a durable, replicated quorum queue. Idempotent on the broker.
pub async fn declare_quorum_queue(channel: &Channel, queue: &str) -> Result<(), AppError> {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-queue-type".into(),
        AMQPValue::LongString("quorum".into()),
    );

    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            arguments,
        )
        .await?;

    Ok(())
}

/// Read the broker-managed `x-delivery-count` header, if present and numeric.
pub fn delivery_count(headers: Option<&FieldTable>) -> Option<i64> {
    let (_, value) = headers?
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)?;

    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}
